//! Two-level project → task picker driven by fzf.
//!
//! The session is a stack of selection contexts: one entry while a project
//! is being picked, two while a task is being picked. The back key pops the
//! task level so the project list is offered again without a re-fetch.

use crate::api::{ApiClient, ApiError, Transport};
use crate::config;
use crate::model::{Project, Task};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// fzf exits with 1 when nothing matched and 130 when interrupted.
const CANCEL_EXIT_CODES: [i32; 2] = [1, 130];

pub const NO_PROJECTS: &str = "No projects found.";
pub const NO_TASKS: &str = "No tasks found for this project.";

#[derive(Debug, Error)]
pub enum PickerError {
	#[error("{0} not found on PATH; install fzf to use pick")]
	MissingSelector(String),
	#[error("failed to run {bin}: {source}")]
	Selector {
		bin: String,
		#[source]
		source: io::Error,
	},
	#[error("{bin} exited with {code:?}")]
	SelectorFailed { bin: String, code: Option<i32> },
	#[error(transparent)]
	Api(#[from] ApiError),
}

/// One invocation of the selection UI.
#[derive(Debug, Clone, Default)]
pub struct SelectRequest {
	pub prompt: String,
	pub lines: Vec<String>,
	pub header: Option<String>,
	pub preview: Option<String>,
	pub expect: Option<String>,
	/// Show only this tab-separated field while keeping the full line.
	pub with_nth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
	Picked { line: String, key: Option<String> },
	Cancelled,
}

pub trait Selector {
	fn select(&mut self, request: &SelectRequest) -> Result<Selection, PickerError>;
}

/// Source of the lists the picker walks through.
pub trait Catalog {
	fn projects(&self) -> Result<Vec<Project>, ApiError>;
	fn tasks(&self, project_id: &str) -> Result<Vec<Task>, ApiError>;
}

impl<T: Transport> Catalog for ApiClient<T> {
	fn projects(&self) -> Result<Vec<Project>, ApiError> {
		ApiClient::projects(self)
	}

	fn tasks(&self, project_id: &str) -> Result<Vec<Task>, ApiError> {
		ApiClient::tasks(self, project_id)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
	Project,
	Task,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickItem {
	Project(Project),
	Task(Task),
}

impl PickItem {
	pub fn id(&self) -> &str {
		match self {
			PickItem::Project(p) => &p.id,
			PickItem::Task(t) => &t.id,
		}
	}

	pub fn line(&self) -> String {
		match self {
			PickItem::Project(p) => format!("{}\t{}", p.id, p.name()),
			PickItem::Task(t) => format!("{}\t[{}] {}", t.id, t.status_label(), t.title()),
		}
	}
}

#[derive(Debug, Clone)]
pub struct SelectionContext {
	pub level: Level,
	pub items: Vec<PickItem>,
	pub current_index: usize,
}

impl SelectionContext {
	fn new(level: Level, items: Vec<PickItem>) -> Self {
		Self {
			level,
			items,
			current_index: 0,
		}
	}

	fn lines(&self) -> Vec<String> {
		self.items.iter().map(PickItem::line).collect()
	}

	fn position(&self, id: &str) -> Option<usize> {
		self.items.iter().position(|item| item.id() == id)
	}
}

/// Non-empty stack of selection contexts.
#[derive(Debug, Clone)]
pub struct PickerSession {
	root: SelectionContext,
	nested: Vec<SelectionContext>,
}

impl PickerSession {
	fn new(root: SelectionContext) -> Self {
		Self {
			root,
			nested: Vec::new(),
		}
	}

	pub fn depth(&self) -> usize {
		1 + self.nested.len()
	}

	pub fn top(&self) -> &SelectionContext {
		self.nested.last().unwrap_or(&self.root)
	}

	fn top_mut(&mut self) -> &mut SelectionContext {
		self.nested.last_mut().unwrap_or(&mut self.root)
	}

	fn push(&mut self, ctx: SelectionContext) {
		self.nested.push(ctx);
	}

	/// Drop the top level; the root is never popped.
	fn pop(&mut self) -> bool {
		self.nested.pop().is_some()
	}

	pub fn projects(&self) -> &SelectionContext {
		&self.root
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickerState {
	SelectingProject,
	SelectingTask,
	Done(PickOutcome),
	Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
	/// A task was chosen and handed to the detail view.
	Shown(String),
	/// Nothing to pick from.
	Empty(&'static str),
}

#[derive(Debug, Clone)]
pub struct PickerOptions {
	pub back_key: String,
	pub preview_command: Option<String>,
}

impl Default for PickerOptions {
	fn default() -> Self {
		Self {
			back_key: config::Picker::default().back_key,
			preview_command: None,
		}
	}
}

pub struct Picker<'a, C, S> {
	catalog: &'a C,
	selector: S,
	options: PickerOptions,
	session: Option<PickerSession>,
	state: PickerState,
}

impl<'a, C: Catalog, S: Selector> Picker<'a, C, S> {
	pub fn new(catalog: &'a C, selector: S, options: PickerOptions) -> Self {
		Self {
			catalog,
			selector,
			options,
			session: None,
			state: PickerState::SelectingProject,
		}
	}

	#[cfg(test)]
	fn state(&self) -> &PickerState {
		&self.state
	}

	#[cfg(test)]
	fn session(&self) -> Option<&PickerSession> {
		self.session.as_ref()
	}

	/// Run until a terminal state. `show` is the detail view invoked with the
	/// chosen task id.
	pub fn run<F>(&mut self, mut show: F) -> anyhow::Result<PickerState>
	where
		F: FnMut(&str) -> anyhow::Result<()>,
	{
		loop {
			match self.step()? {
				Step::Continue => {}
				Step::Chosen(task_id) => {
					show(&task_id)?;
					self.state = PickerState::Done(PickOutcome::Shown(task_id));
				}
			}
			if matches!(self.state, PickerState::Done(_) | PickerState::Cancelled) {
				return Ok(self.state.clone());
			}
		}
	}

	fn step(&mut self) -> Result<Step, PickerError> {
		match self.state {
			PickerState::SelectingProject => self.select_project(),
			PickerState::SelectingTask => self.select_task(),
			PickerState::Done(_) | PickerState::Cancelled => Ok(Step::Continue),
		}
	}

	fn select_project(&mut self) -> Result<Step, PickerError> {
		if self.session.is_none() {
			let projects = self.catalog.projects()?;
			if projects.is_empty() {
				self.state = PickerState::Done(PickOutcome::Empty(NO_PROJECTS));
				return Ok(Step::Continue);
			}
			let items = projects.into_iter().map(PickItem::Project).collect();
			self.session = Some(PickerSession::new(SelectionContext::new(Level::Project, items)));
		}
		let Some(session) = self.session.as_mut() else {
			return Ok(Step::Continue);
		};

		let request = SelectRequest {
			prompt: "Project> ".to_string(),
			lines: session.top().lines(),
			..SelectRequest::default()
		};
		let line = match self.selector.select(&request)? {
			Selection::Cancelled => {
				self.state = PickerState::Cancelled;
				return Ok(Step::Continue);
			}
			Selection::Picked { line, .. } => line,
		};

		let project_id = line_id(&line).to_string();
		let root = session.top_mut();
		if let Some(index) = root.position(&project_id) {
			root.current_index = index;
		} else {
			warn!(project_id = %project_id, "selected project is not in the listed projects");
		}

		let tasks = self.catalog.tasks(&project_id)?;
		if tasks.is_empty() {
			self.state = PickerState::Done(PickOutcome::Empty(NO_TASKS));
			return Ok(Step::Continue);
		}
		let items = tasks.into_iter().map(PickItem::Task).collect();
		session.push(SelectionContext::new(Level::Task, items));
		self.state = PickerState::SelectingTask;
		Ok(Step::Continue)
	}

	fn select_task(&mut self) -> Result<Step, PickerError> {
		let Some(session) = self.session.as_mut() else {
			self.state = PickerState::SelectingProject;
			return Ok(Step::Continue);
		};

		debug!(depth = session.depth(), level = ?session.top().level, "offering tasks");
		let request = SelectRequest {
			prompt: "Task> ".to_string(),
			lines: session.top().lines(),
			header: Some(project_header(session.projects(), &self.options.back_key)),
			preview: self.options.preview_command.clone(),
			expect: Some(self.options.back_key.clone()),
			with_nth: Some("2".to_string()),
		};

		match self.selector.select(&request)? {
			Selection::Cancelled => {
				self.state = PickerState::Cancelled;
				Ok(Step::Continue)
			}
			Selection::Picked { key: Some(key), .. } if key == self.options.back_key => {
				debug!("back to project selection");
				session.pop();
				self.state = PickerState::SelectingProject;
				Ok(Step::Continue)
			}
			Selection::Picked { line, .. } => {
				let task_id = line_id(&line).to_string();
				let tasks = session.top_mut();
				if let Some(index) = tasks.position(&task_id) {
					tasks.current_index = index;
				}
				Ok(Step::Chosen(task_id))
			}
		}
	}
}

enum Step {
	Continue,
	Chosen(String),
}

fn line_id(line: &str) -> &str {
	line.split('\t').next().unwrap_or(line).trim()
}

/// Header listing every project with a marker on the current one.
pub fn project_header(projects: &SelectionContext, back_key: &str) -> String {
	let mut lines = vec![format!("Projects ({back_key} to re-select):")];
	for (i, item) in projects.items.iter().enumerate() {
		let marker = if i == projects.current_index { "▶ " } else { "  " };
		let name = match item {
			PickItem::Project(p) => p.name(),
			PickItem::Task(t) => t.title(),
		};
		lines.push(format!("{marker}{name} ({})", item.id()));
	}
	lines.join("\n")
}

/// Preview command that renders a task through this binary's `show`,
/// against the same config file as the running picker.
pub fn preview_command(exe: &Path, config: Option<&Path>) -> String {
	let exe = exe.to_string_lossy();
	let mut command = format!("{} show {{1}} --with-messages", shell_words::quote(&exe));
	if let Some(config) = config {
		let config = config.to_string_lossy();
		command.push_str(" --config ");
		command.push_str(&shell_words::quote(&config));
	}
	command
}

pub fn current_exe() -> PathBuf {
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("vkcli"))
}

/// External fzf process.
pub struct FzfSelector {
	bin: PathBuf,
	preview_window: String,
}

impl FzfSelector {
	/// Locate the binary on PATH.
	pub fn locate(bin: &str, preview_window: &str) -> Result<Self, PickerError> {
		let bin = which::which(bin).map_err(|_| PickerError::MissingSelector(bin.to_string()))?;
		Ok(Self {
			bin,
			preview_window: preview_window.to_string(),
		})
	}

	fn args(&self, request: &SelectRequest) -> Vec<String> {
		let mut args = vec![
			"--prompt".to_string(),
			request.prompt.clone(),
			"--no-multi".to_string(),
		];
		if let Some(with_nth) = &request.with_nth {
			args.extend(["--delimiter".to_string(), "\t".to_string()]);
			args.extend(["--with-nth".to_string(), with_nth.clone()]);
		}
		if let Some(preview) = &request.preview {
			args.extend(["--preview-window".to_string(), self.preview_window.clone()]);
			args.extend(["--preview".to_string(), preview.clone()]);
		}
		if let Some(key) = &request.expect {
			args.extend(["--expect".to_string(), key.clone()]);
		}
		if let Some(header) = &request.header {
			args.extend(["--header".to_string(), header.clone()]);
		}
		args
	}
}

impl Selector for FzfSelector {
	fn select(&mut self, request: &SelectRequest) -> Result<Selection, PickerError> {
		let bin = self.bin.display().to_string();
		let io_err = |source| PickerError::Selector {
			bin: bin.clone(),
			source,
		};
		let output = run_with_input(
			Command::new(&self.bin).args(self.args(request)),
			&request.lines,
		)
		.map_err(io_err)?;

		if !output.status.success() {
			return match output.status.code() {
				Some(code) if CANCEL_EXIT_CODES.contains(&code) => Ok(Selection::Cancelled),
				code => Err(PickerError::SelectorFailed { bin, code }),
			};
		}
		Ok(parse_output(&output.stdout, request.expect.is_some()))
	}
}

struct ChildOutput {
	status: std::process::ExitStatus,
	stdout: String,
}

/// Feed `lines` on a writer thread while this thread drains stdout, so
/// neither pipe can fill up and block the other.
fn run_with_input(command: &mut Command, lines: &[String]) -> io::Result<ChildOutput> {
	let mut child = command
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::inherit())
		.spawn()?;

	let stdin = child.stdin.take();
	let input: Vec<String> = lines.to_vec();
	let writer = std::thread::spawn(move || -> io::Result<()> {
		let Some(mut stdin) = stdin else {
			return Ok(());
		};
		for line in &input {
			writeln!(stdin, "{line}")?;
		}
		stdin.flush()
	});

	let mut stdout = String::new();
	let read_result = match child.stdout.take() {
		Some(mut pipe) => pipe.read_to_string(&mut stdout).map(|_| ()),
		None => Ok(()),
	};
	let status = child.wait()?;

	match writer.join() {
		Ok(Err(err)) if err.kind() != io::ErrorKind::BrokenPipe => {
			debug!(error = %err, "selector input writer failed")
		}
		Err(_) => warn!("selector input writer panicked"),
		_ => {}
	}
	read_result?;
	Ok(ChildOutput { status, stdout })
}

/// Interpret fzf output. With `--expect` the first line is the pressed key
/// (empty for Enter) and the selection follows.
pub fn parse_output(raw: &str, expect_used: bool) -> Selection {
	let clean = raw.replace("\r\n", "\n");
	let mut lines = clean.split('\n');

	let key = if expect_used {
		lines.next().map(str::trim).filter(|k| !k.is_empty()).map(str::to_string)
	} else {
		None
	};
	let line = lines
		.map(str::trim)
		.find(|l| !l.is_empty())
		.map(str::to_string);

	match (line, key) {
		(None, None) => Selection::Cancelled,
		(line, key) => Selection::Picked {
			line: line.unwrap_or_default(),
			key,
		},
	}
}
