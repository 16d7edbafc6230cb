use crate::api::{last_attempt_id, ApiClient, Transport};
use crate::config::Watch;
use crate::model::AttemptRef;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("no attempt for task {task_id} appeared after {attempts} tries{}", error_suffix(.last_error))]
	Exhausted {
		task_id: String,
		attempts: u32,
		last_error: Option<String>,
	},
}

fn error_suffix(last_error: &Option<String>) -> String {
	last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub attempts: u32,
	pub delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			attempts: 10,
			delay: Duration::from_millis(500),
		}
	}
}

impl From<&Watch> for RetryPolicy {
	fn from(watch: &Watch) -> Self {
		Self {
			attempts: watch.discovery_attempts.max(1),
			delay: watch.discovery_delay(),
		}
	}
}

/// Wait for a freshly created attempt to show up in the task's attempt list.
/// The newest attempt is assumed to be listed last.
pub fn discover_attempt<T: Transport>(
	client: &ApiClient<T>,
	task_id: &str,
	policy: RetryPolicy,
) -> Result<AttemptRef, DiscoveryError> {
	discover_attempt_with(client, task_id, policy, std::thread::sleep)
}

pub fn discover_attempt_with<T, S>(
	client: &ApiClient<T>,
	task_id: &str,
	policy: RetryPolicy,
	mut sleep: S,
) -> Result<AttemptRef, DiscoveryError>
where
	T: Transport,
	S: FnMut(Duration),
{
	let mut last_error = None;
	for attempt in 0..policy.attempts {
		if attempt > 0 {
			sleep(policy.delay);
		}

		match client.attempts(task_id) {
			Ok(list) => {
				last_error = None;
				if let Some(id) = last_attempt_id(&list) {
					debug!(task_id, attempt_id = %id, tries = attempt + 1, "attempt discovered");
					return Ok(AttemptRef {
						id,
						task_id: Some(task_id.to_string()),
					});
				}
			}
			Err(err) => {
				warn!(task_id, try_number = attempt + 1, error = %err, "attempt listing failed");
				last_error = Some(err.to_string());
			}
		}
	}

	Err(DiscoveryError::Exhausted {
		task_id: task_id.to_string(),
		attempts: policy.attempts,
		last_error,
	})
}
