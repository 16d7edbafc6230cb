use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
	pub id: String,
	#[serde(default)]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
	pub id: String,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub status: Option<String>,
	#[serde(default)]
	pub description: Option<String>,
	#[serde(default)]
	pub created_at: Option<String>,
	#[serde(default)]
	pub updated_at: Option<String>,
}

/// One execution run of a task. Only lives for a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRef {
	pub id: String,
	pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionProcess {
	pub id: String,
	#[serde(default)]
	pub executor_action: Option<ExecutorAction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorAction {
	#[serde(default)]
	pub typ: Option<ExecutorActionType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorActionType {
	#[serde(default)]
	pub prompt: Option<String>,
}

impl ExecutionProcess {
	pub fn prompt(&self) -> Option<&str> {
		self.executor_action
			.as_ref()?
			.typ
			.as_ref()?
			.prompt
			.as_deref()
			.map(str::trim)
			.filter(|p| !p.is_empty())
	}
}

/// A single materialized log entry from an execution process.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogEntry {
	pub index: usize,
	pub kind: String,
	pub text: String,
}

pub type Transcript = Vec<LogEntry>;

impl Project {
	pub fn name(&self) -> &str {
		self.name.as_deref().unwrap_or("")
	}
}

impl Task {
	pub fn title(&self) -> &str {
		self.title.as_deref().unwrap_or("")
	}

	pub fn status_label(&self) -> &str {
		self.status.as_deref().unwrap_or("")
	}
}
