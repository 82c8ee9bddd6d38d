// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::RegistryError;
use crate::objects::RegistryObject;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tracing::warn;

/// One change notification from a watch. Subscription starts with the
/// existing set replayed as `Added`, then a single `Synced` barrier, then
/// live events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub enum WatchEvent<T> {
	Added { object: T },
	Updated { object: T },
	Deleted { object: T },
	Synced,
}

/// Server-sent-events watch over one object collection.
pub struct WatchStream<T> {
	events: BoxStream<'static, Result<WatchEvent<T>, RegistryError>>,
}

impl<T: RegistryObject> WatchStream<T> {
	pub(crate) fn from_response(response: reqwest::Response) -> Self {
		let events = response
			.bytes_stream()
			.eventsource()
			.filter_map(|result| async move {
				match result {
					Ok(event) => {
						if event.event != "message" && !event.event.is_empty() {
							return None;
						}
						match serde_json::from_str::<WatchEvent<T>>(&event.data) {
							Ok(watch_event) => Some(Ok(watch_event)),
							Err(err) => {
								warn!(error = %err, data = %event.data, "failed to parse watch event");
								Some(Err(RegistryError::Parse(err)))
							}
						}
					}
					Err(err) => {
						warn!(error = %err, "watch stream error");
						Some(Err(RegistryError::Watch(err.to_string())))
					}
				}
			})
			.boxed();

		Self { events }
	}

	/// Next event, or `None` once the server closes the stream.
	pub async fn next(&mut self) -> Option<Result<WatchEvent<T>, RegistryError>> {
		self.events.next().await
	}
}

impl<T> std::fmt::Debug for WatchStream<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WatchStream").finish()
	}
}
