// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{RegistryError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label selector: comma-joined requirements over a label map. Supports
/// `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, bare-key existence
/// and `!k` non-existence. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
	requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
	Eq(String, String),
	Neq(String, String),
	In(String, Vec<String>),
	NotIn(String, Vec<String>),
	Exists(String),
	NotExists(String),
}

impl Selector {
	pub fn everything() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.requirements.is_empty()
	}

	pub fn parse(input: &str) -> Result<Self> {
		let mut requirements = Vec::new();
		for part in split_requirements(input) {
			let part = part.trim();
			if part.is_empty() {
				continue;
			}
			requirements.push(parse_requirement(part).ok_or_else(|| {
				RegistryError::Selector {
					selector: input.to_string(),
					reason: format!("unparseable requirement {part:?}"),
				}
			})?);
		}
		Ok(Self { requirements })
	}

	pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
		self.requirements.iter().all(|req| match req {
			Requirement::Eq(k, v) => labels.get(k).is_some_and(|got| got == v),
			Requirement::Neq(k, v) => labels.get(k).map_or(true, |got| got != v),
			Requirement::In(k, vs) => labels.get(k).is_some_and(|got| vs.contains(got)),
			Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |got| !vs.contains(got)),
			Requirement::Exists(k) => labels.contains_key(k),
			Requirement::NotExists(k) => !labels.contains_key(k),
		})
	}
}

/// Splits on commas that are not inside an `in (...)` value set.
fn split_requirements(input: &str) -> Vec<String> {
	let mut parts = Vec::new();
	let mut depth = 0usize;
	let mut current = String::new();
	for c in input.chars() {
		match c {
			'(' => {
				depth += 1;
				current.push(c);
			}
			')' => {
				depth = depth.saturating_sub(1);
				current.push(c);
			}
			',' if depth == 0 => {
				parts.push(std::mem::take(&mut current));
			}
			_ => current.push(c),
		}
	}
	parts.push(current);
	parts
}

fn parse_requirement(part: &str) -> Option<Requirement> {
	if let Some((key, value)) = part.split_once("!=") {
		return valid_key(key).map(|k| Requirement::Neq(k, value.trim().to_string()));
	}
	if let Some((key, value)) = part.split_once("==") {
		return valid_key(key).map(|k| Requirement::Eq(k, value.trim().to_string()));
	}
	if let Some((key, value)) = part.split_once('=') {
		return valid_key(key).map(|k| Requirement::Eq(k, value.trim().to_string()));
	}
	if let Some((key, set)) = split_set_op(part, " notin ") {
		return valid_key(&key).map(|k| Requirement::NotIn(k, set));
	}
	if let Some((key, set)) = split_set_op(part, " in ") {
		return valid_key(&key).map(|k| Requirement::In(k, set));
	}
	if let Some(key) = part.strip_prefix('!') {
		return valid_key(key).map(Requirement::NotExists);
	}
	valid_key(part).map(Requirement::Exists)
}

fn split_set_op(part: &str, op: &str) -> Option<(String, Vec<String>)> {
	let (key, rest) = part.split_once(op)?;
	let rest = rest.trim();
	let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
	let values = inner
		.split(',')
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
		.collect();
	Some((key.trim().to_string(), values))
}

fn valid_key(key: &str) -> Option<String> {
	let key = key.trim();
	if key.is_empty() || key.contains(char::is_whitespace) {
		return None;
	}
	Some(key.to_string())
}

impl fmt::Display for Selector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for req in &self.requirements {
			if !first {
				f.write_str(",")?;
			}
			first = false;
			match req {
				Requirement::Eq(k, v) => write!(f, "{k}={v}")?,
				Requirement::Neq(k, v) => write!(f, "{k}!={v}")?,
				Requirement::In(k, vs) => write!(f, "{k} in ({})", vs.join(","))?,
				Requirement::NotIn(k, vs) => write!(f, "{k} notin ({})", vs.join(","))?,
				Requirement::Exists(k) => write!(f, "{k}")?,
				Requirement::NotExists(k) => write!(f, "!{k}")?,
			}
		}
		Ok(())
	}
}

impl FromStr for Selector {
	type Err = RegistryError;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}
