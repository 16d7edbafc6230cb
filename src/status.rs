//! Status resolution for task and attempt payloads.
//!
//! The backend nests the status under different keys and depths depending on
//! the endpoint, so the payload is searched as a tree: priority keys first,
//! then every other value in document order.

use crate::api::{ApiClient, ApiError, Transport};
use crate::config::Watch;
use serde_json::Value;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

pub const UNKNOWN: &str = "UNKNOWN";

const PRIORITY_KEYS: [&str; 3] = ["status", "branch_status", "branchStatus"];

/// Canonical form of a status token, or `None` when nothing is left.
pub fn normalize(raw: &str) -> Option<String> {
	let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
	if trimmed.is_empty() {
		return None;
	}
	Some(trimmed.replace(['-', ' '], "_").to_uppercase())
}

/// Search a document for its status and return it normalized.
pub fn resolve_status(doc: &Value) -> Option<String> {
	match doc {
		Value::String(s) => normalize(s),
		Value::Object(map) => {
			for key in PRIORITY_KEYS {
				if let Some(found) = map.get(key).and_then(resolve_status) {
					return Some(found);
				}
			}
			map.iter()
				.filter(|(key, _)| !PRIORITY_KEYS.contains(&key.as_str()))
				.find_map(|(_, value)| resolve_status(value))
		}
		Value::Array(items) => items.iter().find_map(resolve_status),
		Value::Null | Value::Bool(_) | Value::Number(_) => None,
	}
}

type BodyStrategy = fn(&str) -> Option<String>;

fn status_from_json(text: &str) -> Option<String> {
	serde_json::from_str::<Value>(text)
		.ok()
		.and_then(|doc| resolve_status(&doc))
}

fn status_from_plain_text(text: &str) -> Option<String> {
	if serde_json::from_str::<Value>(text).is_ok() {
		return None;
	}
	normalize(text)
}

const BODY_STRATEGIES: [BodyStrategy; 2] = [status_from_json, status_from_plain_text];

/// Resolve a status from a raw response body. Structured JSON is tried
/// first; a body that is not JSON at all is taken as the status text.
pub fn status_from_body(body: &[u8]) -> Option<String> {
	let text = String::from_utf8_lossy(body);
	let text = text.trim();
	if text.is_empty() {
		return None;
	}
	BODY_STRATEGIES.iter().find_map(|strategy| strategy(text))
}

/// Id of the task that owns an attempt payload.
pub fn extract_task_id(doc: &Value) -> Option<String> {
	match doc {
		Value::Object(map) => {
			if let Some(id) = map.get("data").and_then(extract_task_id) {
				return Some(id);
			}
			if let Some(id) = map.get("task_id").and_then(Value::as_str).filter(|s| !s.trim().is_empty()) {
				return Some(id.to_string());
			}
			map.get("task")
				.and_then(|task| task.get("id"))
				.and_then(Value::as_str)
				.filter(|s| !s.trim().is_empty())
				.map(str::to_string)
		}
		Value::Array(items) => items.iter().find_map(extract_task_id),
		_ => None,
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
	#[error(transparent)]
	Api(#[from] ApiError),
	#[error("no status in response from {0}")]
	NotFound(String),
}

/// Status lookups across the task and attempt endpoints.
pub struct StatusProbe<'a, T> {
	client: &'a ApiClient<T>,
}

impl<'a, T: Transport> StatusProbe<'a, T> {
	pub fn new(client: &'a ApiClient<T>) -> Self {
		Self { client }
	}

	pub fn task_status(&self, task_id: &str) -> Result<String, StatusError> {
		let raw = self.client.task_raw(task_id)?.error_for_status()?;
		status_from_body(&raw.body).ok_or(StatusError::NotFound(raw.url))
	}

	/// Attempt status with fallbacks: the attempt itself, its branch status,
	/// then the owning task. Never fails; gives `UNKNOWN` when all are empty.
	pub fn attempt_status(&self, attempt_id: &str) -> String {
		let mut owner = None;
		match self.client.attempt(attempt_id) {
			Ok(payload) => {
				if let Some(status) = resolve_status(&payload) {
					return status;
				}
				owner = extract_task_id(&payload);
			}
			Err(err) => debug!(attempt_id, error = %err, "attempt lookup failed"),
		}

		match self.client.attempt_branch_status(attempt_id) {
			Ok(payload) => {
				if let Some(status) = resolve_status(&payload) {
					return status;
				}
			}
			Err(err) => debug!(attempt_id, error = %err, "branch status lookup failed"),
		}

		// A usable owner id is normally picked up by `resolve_status` above.
		// This lookup only runs when the id is made of quote characters,
		// which `normalize` strips to nothing.
		if let Some(task_id) = owner {
			match self.task_status(&task_id) {
				Ok(status) => return status,
				Err(err) => debug!(attempt_id, task_id = %task_id, error = %err, "owner task lookup failed"),
			}
		}

		UNKNOWN.to_string()
	}
}

/// Where a `status` lookup was answered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusReport {
	Task(String),
	Attempt(String),
}

/// Treat the id as a task first, then as an attempt.
pub fn lookup<T: Transport>(client: &ApiClient<T>, target_id: &str) -> StatusReport {
	let probe = StatusProbe::new(client);
	match probe.task_status(target_id) {
		Ok(status) => StatusReport::Task(status),
		Err(err) => {
			debug!(target_id, error = %err, "not resolvable as a task, trying attempt");
			StatusReport::Attempt(probe.attempt_status(target_id))
		}
	}
}

/// Poll an attempt until it reaches a terminal status. The wait happens
/// before every check.
pub fn watch_attempt<T, W, S>(
	client: &ApiClient<T>,
	attempt_id: &str,
	watch: &Watch,
	out: &mut W,
	mut sleep: S,
) -> std::io::Result<String>
where
	T: Transport,
	W: Write,
	S: FnMut(Duration),
{
	let probe = StatusProbe::new(client);
	let mut reported_unknown = false;
	loop {
		sleep(watch.poll_interval());
		let status = probe.attempt_status(attempt_id);
		write!(out, "Status: {status}\r")?;
		out.flush()?;
		if watch.is_terminal(&status) {
			writeln!(out)?;
			return Ok(status);
		}
		if status == UNKNOWN && !reported_unknown {
			warn!(attempt_id, "attempt status could not be resolved, still polling");
			reported_unknown = true;
		}
	}
}
