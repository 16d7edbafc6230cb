//! HTTP access to the task backend.
//!
//! Everything goes through [`Transport`], a single `fetch` call that returns
//! the status code and raw body. Response bodies come either bare or wrapped
//! as `{"success": bool, "data": ...}` and both shapes are accepted.

use crate::model::{ExecutionProcess, Project, Task};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("request to {url} failed: {source}")]
	Transport {
		url: String,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("{url} returned status {code}: {body}")]
	Status { url: String, code: u16, body: String },
	#[error("unexpected response from {url}: {source}")]
	Decode {
		url: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Status code and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
	pub url: String,
	pub status: u16,
	pub body: Vec<u8>,
}

impl RawResponse {
	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).trim().to_string()
	}

	/// Fails on non-2xx with the trimmed body as the message.
	pub fn error_for_status(self) -> Result<Self, ApiError> {
		if self.is_success() {
			Ok(self)
		} else {
			Err(ApiError::Status {
				code: self.status,
				body: self.text(),
				url: self.url,
			})
		}
	}

	pub fn json(&self) -> Result<Value, ApiError> {
		serde_json::from_slice(&self.body).map_err(|source| ApiError::Decode {
			url: self.url.clone(),
			source,
		})
	}
}

pub trait Transport {
	fn fetch(&self, method: Method, url: &str, body: Option<&Value>) -> Result<RawResponse, ApiError>;
}

/// Blocking reqwest transport.
pub struct HttpTransport {
	client: reqwest::blocking::Client,
}

impl HttpTransport {
	pub fn new(timeout: Duration) -> Result<Self, ApiError> {
		let client = reqwest::blocking::Client::builder()
			.user_agent(concat!("vkcli/", env!("CARGO_PKG_VERSION")))
			.timeout(timeout)
			.build()
			.map_err(|source| ApiError::Transport {
				url: String::new(),
				source: Box::new(source),
			})?;
		Ok(Self { client })
	}
}

impl Transport for HttpTransport {
	fn fetch(&self, method: Method, url: &str, body: Option<&Value>) -> Result<RawResponse, ApiError> {
		let transport_err = |source: reqwest::Error| ApiError::Transport {
			url: url.to_string(),
			source: Box::new(source),
		};
		let mut request = self.client.request(method.clone(), url);
		if let Some(body) = body {
			request = request.json(body);
		}
		let response = request.send().map_err(transport_err)?;
		let status = response.status().as_u16();
		let bytes = response.bytes().map_err(transport_err)?;
		debug!(%method, url, status, len = bytes.len(), "http exchange");
		Ok(RawResponse {
			url: url.to_string(),
			status,
			body: bytes.to_vec(),
		})
	}
}

/// Strip a `{success, data}` wrapper if present.
pub fn unwrap_envelope(value: Value) -> Value {
	match value {
		Value::Object(mut map) if map.contains_key("data") && map.contains_key("success") => {
			map.remove("data").unwrap_or(Value::Null)
		}
		other => other,
	}
}

/// Decode a list response: wrapped first, then a bare array. A `null`
/// payload is an empty list.
pub fn decode_list<T: DeserializeOwned>(raw: &RawResponse) -> Result<Vec<T>, ApiError> {
	let value = raw.json()?;
	let decode_err = |source| ApiError::Decode {
		url: raw.url.clone(),
		source,
	};
	match unwrap_envelope(value) {
		Value::Null => Ok(Vec::new()),
		inner => serde_json::from_value(inner).map_err(decode_err),
	}
}

/// Decode a single-object response, wrapped or bare.
pub fn decode_one<T: DeserializeOwned>(raw: &RawResponse) -> Result<T, ApiError> {
	let value = unwrap_envelope(raw.json()?);
	serde_json::from_value(value).map_err(|source| ApiError::Decode {
		url: raw.url.clone(),
		source,
	})
}

pub struct ApiClient<T> {
	transport: T,
	base_url: String,
}

impl<T: Transport> ApiClient<T> {
	pub fn new(transport: T, base_url: &str) -> Self {
		Self {
			transport,
			base_url: base_url.trim_end_matches('/').to_string(),
		}
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	fn url_with_query(&self, path: &str, key: &str, value: &str) -> String {
		let base = self.url(path);
		match reqwest::Url::parse_with_params(&base, &[(key, value)]) {
			Ok(url) => url.to_string(),
			Err(_) => format!("{base}?{key}={value}"),
		}
	}

	pub fn get(&self, url: &str) -> Result<RawResponse, ApiError> {
		self.transport.fetch(Method::GET, url, None)
	}

	pub fn projects(&self) -> Result<Vec<Project>, ApiError> {
		let raw = self.get(&self.url("/projects"))?.error_for_status()?;
		decode_list(&raw)
	}

	pub fn tasks(&self, project_id: &str) -> Result<Vec<Task>, ApiError> {
		let url = self.url_with_query("/tasks", "project_id", project_id);
		let raw = self.get(&url)?.error_for_status()?;
		decode_list(&raw)
	}

	/// Raw task detail, left unchecked so status resolution can inspect it.
	pub fn task_raw(&self, task_id: &str) -> Result<RawResponse, ApiError> {
		self.get(&self.url(&format!("/tasks/{task_id}")))
	}

	pub fn task(&self, task_id: &str) -> Result<Task, ApiError> {
		let raw = self.task_raw(task_id)?.error_for_status()?;
		decode_one(&raw)
	}

	pub fn create_attempt(&self, task_id: &str, body: &Value) -> Result<Value, ApiError> {
		let url = self.url(&format!("/tasks/{task_id}/attempts"));
		let raw = self.transport.fetch(Method::POST, &url, Some(body))?.error_for_status()?;
		raw.json()
	}

	/// Attempt listing for a task, kept as raw JSON objects.
	pub fn attempts(&self, task_id: &str) -> Result<Vec<Value>, ApiError> {
		let url = self.url_with_query("/task-attempts", "task_id", task_id);
		let raw = self.get(&url)?.error_for_status()?;
		decode_list(&raw)
	}

	pub fn attempt(&self, attempt_id: &str) -> Result<Value, ApiError> {
		let url = self.url(&format!("/task-attempts/{attempt_id}"));
		self.get(&url)?.error_for_status()?.json()
	}

	pub fn attempt_branch_status(&self, attempt_id: &str) -> Result<Value, ApiError> {
		let url = self.url(&format!("/task-attempts/{attempt_id}/branch-status"));
		self.get(&url)?.error_for_status()?.json()
	}

	pub fn execution_processes(&self, attempt_id: &str) -> Result<Vec<ExecutionProcess>, ApiError> {
		let url = self.url_with_query("/execution-processes", "task_attempt_id", attempt_id);
		let raw = self.get(&url)?.error_for_status()?;
		decode_list(&raw)
	}
}

/// Id of the last listed attempt that carries one.
pub fn last_attempt_id(attempts: &[Value]) -> Option<String> {
	attempts.iter().rev().find_map(|a| {
		a.get("id")
			.and_then(Value::as_str)
			.filter(|id| !id.is_empty())
			.map(str::to_string)
	})
}


#[cfg(test)]
mod tests {
	use super::testing::FakeTransport;
	use super::*;
	use serde_json::json;

	const BASE: &str = "http://vk.test/api";

	#[test]
	fn envelope_is_unwrapped_only_when_shaped_like_one() {
		assert_eq!(unwrap_envelope(json!({"success": true, "data": [1]})), json!([1]));
		assert_eq!(unwrap_envelope(json!({"data": [1]})), json!({"data": [1]}));
		assert_eq!(unwrap_envelope(json!([1, 2])), json!([1, 2]));
	}

	#[test]
	fn projects_accept_wrapped_and_bare_lists() {
		let fake = FakeTransport::new();
		fake.respond(
			&format!("{BASE}/projects"),
			200,
			r#"{"success":true,"data":[{"id":"p1","name":"Alpha"}]}"#,
		);
		let client = ApiClient::new(&fake, BASE);
		let projects = client.projects().unwrap();
		assert_eq!(projects.len(), 1);
		assert_eq!(projects[0].name(), "Alpha");

		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/projects"), 200, r#"[{"id":"p2"}]"#);
		let client = ApiClient::new(&fake, BASE);
		assert_eq!(client.projects().unwrap()[0].id, "p2");
	}

	#[test]
	fn null_data_is_an_empty_list() {
		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/projects"), 200, r#"{"success":true,"data":null}"#);
		let client = ApiClient::new(&fake, BASE);
		assert!(client.projects().unwrap().is_empty());
	}

	#[test]
	fn tasks_query_is_encoded() {
		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/tasks?project_id=a+b"), 200, r#"{"success":true,"data":[]}"#);
		let client = ApiClient::new(&fake, BASE);
		assert!(client.tasks("a b").unwrap().is_empty());
	}

	#[test]
	fn non_success_status_is_an_error() {
		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/projects"), 500, " boom \n");
		let client = ApiClient::new(&fake, BASE);
		match client.projects() {
			Err(ApiError::Status { code, body, .. }) => {
				assert_eq!(code, 500);
				assert_eq!(body, "boom");
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn create_attempt_posts_body() {
		let fake = FakeTransport::new();
		let url = format!("{BASE}/tasks/t1/attempts");
		fake.respond(&url, 200, r#"{"success":true,"data":{"id":"a9"}}"#);
		let client = ApiClient::new(&fake, BASE);
		let created = client.create_attempt("t1", &json!({"executor": "CLAUDE_CODE"})).unwrap();
		assert_eq!(created["data"]["id"], "a9");

		let calls = fake.calls.borrow();
		assert_eq!(calls[0].0, Method::POST);
		assert_eq!(calls[0].2, Some(json!({"executor": "CLAUDE_CODE"})));
	}

	#[test]
	fn last_attempt_id_skips_entries_without_id() {
		let attempts = vec![json!({"id": "a1"}), json!({"id": "a2"}), json!({"branch": "x"})];
		assert_eq!(last_attempt_id(&attempts).as_deref(), Some("a2"));
		assert_eq!(last_attempt_id(&[]), None);
	}
}
