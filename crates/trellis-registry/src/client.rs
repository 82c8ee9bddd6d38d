// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::objects::{ObjectList, RegistryObject, API_VERSION};
use crate::selector::Selector;
use crate::watch::WatchStream;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

/// What the caller was doing when the registry answered 409; `create`
/// races surface as "already exists", writes as optimistic-concurrency
/// conflicts.
#[derive(Debug, Clone, Copy)]
enum Verb {
	Create,
	Write,
}

/// REST client for one registry server. Cheap to clone; all methods are
/// cancel-safe (dropping the future abandons the request).
#[derive(Debug, Clone)]
pub struct RegistryClient {
	base: Url,
	http: Client,
	token: Option<String>,
}

impl RegistryClient {
	pub fn new(config: &RegistryConfig) -> Self {
		Self {
			base: config.server.clone(),
			http: Client::new(),
			token: config.token.clone(),
		}
	}

	fn collection_url<T: RegistryObject>(&self, namespace: &str) -> Result<Url> {
		Ok(self.base.join(&format!(
			"/apis/{API_VERSION}/namespaces/{namespace}/{}",
			T::PLURAL
		))?)
	}

	fn object_url<T: RegistryObject>(&self, namespace: &str, name: &str) -> Result<Url> {
		Ok(self.base.join(&format!(
			"/apis/{API_VERSION}/namespaces/{namespace}/{}/{name}",
			T::PLURAL
		))?)
	}

	fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
		match &self.token {
			Some(token) => builder.bearer_auth(token),
			None => builder,
		}
	}

	async fn check<T: RegistryObject>(
		verb: Verb,
		namespace: &str,
		name: &str,
		response: Response,
	) -> Result<Response> {
		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}
		let namespace = namespace.to_string();
		let name = name.to_string();
		Err(match status {
			StatusCode::NOT_FOUND => RegistryError::NotFound {
				kind: T::KIND,
				namespace,
				name,
			},
			StatusCode::CONFLICT => match verb {
				Verb::Create => RegistryError::AlreadyExists {
					kind: T::KIND,
					namespace,
					name,
				},
				Verb::Write => RegistryError::Conflict {
					kind: T::KIND,
					namespace,
					name,
				},
			},
			_ => RegistryError::Status {
				status: status.as_u16(),
				message: response.text().await.unwrap_or_default(),
			},
		})
	}

	#[instrument(skip(self), fields(kind = T::KIND))]
	pub async fn get<T: RegistryObject>(&self, namespace: &str, name: &str) -> Result<T> {
		let url = self.object_url::<T>(namespace, name)?;
		let response = self.authorize(self.http.get(url)).send().await?;
		let response = Self::check::<T>(Verb::Write, namespace, name, response).await?;
		Ok(response.json().await?)
	}

	#[instrument(skip(self, selector), fields(kind = T::KIND, selector = %selector))]
	pub async fn list<T: RegistryObject>(
		&self,
		namespace: &str,
		selector: &Selector,
	) -> Result<Vec<T>> {
		let url = self.collection_url::<T>(namespace)?;
		let mut request = self.authorize(self.http.get(url));
		if !selector.is_empty() {
			request = request.query(&[("labelSelector", selector.to_string())]);
		}
		let response = request.send().await?;
		let response = Self::check::<T>(Verb::Write, namespace, "", response).await?;
		let list: ObjectList<T> = response.json().await?;
		Ok(list.items)
	}

	/// Creates the object; a name collision is `AlreadyExists`.
	#[instrument(skip(self, object), fields(kind = T::KIND, name = %object.metadata().name))]
	pub async fn create<T: RegistryObject>(&self, object: &T) -> Result<T> {
		let meta = object.metadata();
		let url = self.collection_url::<T>(&meta.namespace)?;
		let response = self.authorize(self.http.post(url)).json(object).send().await?;
		let response = Self::check::<T>(Verb::Create, &meta.namespace, &meta.name, response).await?;
		debug!("created object");
		Ok(response.json().await?)
	}

	/// Replaces the object. The carried `resourceVersion` must still be
	/// current or the registry answers with a conflict.
	#[instrument(skip(self, object), fields(kind = T::KIND, name = %object.metadata().name))]
	pub async fn update<T: RegistryObject>(&self, object: &T) -> Result<T> {
		let meta = object.metadata();
		let url = self.object_url::<T>(&meta.namespace, &meta.name)?;
		let response = self.authorize(self.http.put(url)).json(object).send().await?;
		let response = Self::check::<T>(Verb::Write, &meta.namespace, &meta.name, response).await?;
		debug!("updated object");
		Ok(response.json().await?)
	}

	/// Deletes the object. With `precondition_uid` set the delete only
	/// succeeds while the stored object still carries that uid, so a
	/// reclaimed-and-reissued name is never deleted by a stale owner.
	#[instrument(skip(self), fields(kind = T::KIND))]
	pub async fn delete<T: RegistryObject>(
		&self,
		namespace: &str,
		name: &str,
		precondition_uid: Option<&str>,
	) -> Result<()> {
		let url = self.object_url::<T>(namespace, name)?;
		let mut request = self.authorize(self.http.delete(url));
		if let Some(uid) = precondition_uid {
			request = request.query(&[("preconditionUid", uid)]);
		}
		let response = request.send().await?;
		Self::check::<T>(Verb::Write, namespace, name, response).await?;
		debug!("deleted object");
		Ok(())
	}

	/// Opens a watch on the collection. The registry replays every existing
	/// object as an `added` event, emits `synced`, and then streams live
	/// changes.
	#[instrument(skip(self, selector), fields(kind = T::KIND, selector = %selector))]
	pub async fn watch<T: RegistryObject>(
		&self,
		namespace: &str,
		selector: &Selector,
	) -> Result<WatchStream<T>> {
		let url = self.collection_url::<T>(namespace)?;
		let mut request = self
			.authorize(self.http.get(url))
			.query(&[("watch", "true")])
			.header("Accept", "text/event-stream");
		if !selector.is_empty() {
			request = request.query(&[("labelSelector", selector.to_string())]);
		}
		let response = request.send().await?;
		let response = Self::check::<T>(Verb::Write, namespace, "", response).await?;
		debug!("watch connected");
		Ok(WatchStream::from_response(response))
	}
}
