use crate::api::{unwrap_envelope, ApiClient, HttpTransport, Transport};
use crate::config::Config;
use crate::discovery::{self, RetryPolicy};
use crate::logstream::{normalized_logs_url, WsFrameSource};
use crate::model::{Project, Task};
use crate::picker::{self, FzfSelector, PickOutcome, Picker, PickerOptions, PickerState};
use crate::show::DetailView;
use crate::status::{self, StatusReport};
use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
	/// List projects
	Projects,
	/// List tasks of a project
	List {
		project_id: String,
	},
	/// Show task details
	Show {
		task_id: String,
		/// Include execution transcripts of the latest attempt
		#[arg(long, default_value_t = false)]
		with_messages: bool,
	},
	/// Start a task attempt and watch it until it finishes
	Exec {
		task_id: String,
		/// Executor profile to run the attempt with
		#[arg(long)]
		executor: Option<String>,
		/// Branch the attempt starts from
		#[arg(long)]
		base_branch: Option<String>,
	},
	/// Show the status of a task or attempt
	Status {
		/// Task id or attempt id
		target_id: String,
	},
	/// Pick a project and task with fzf, then show the task
	Pick {
		#[arg(long, default_value_t = false)]
		with_messages: bool,
	},
}

/// `config_path` is the `--config` file, if any, so child invocations load
/// the same settings.
pub fn dispatch(command: Commands, cfg: &Config, config_path: Option<&Path>) -> Result<()> {
	let transport = HttpTransport::new(cfg.api.request_timeout()).context("failed to build http client")?;
	let client = ApiClient::new(transport, &cfg.api.base_url);
	let mut stdout = io::stdout().lock();

	match command {
		Commands::Projects => {
			let projects = client.projects().context("failed to list projects")?;
			write_projects(&mut stdout, &projects)?;
		}
		Commands::List { project_id } => {
			let tasks = client
				.tasks(&project_id)
				.with_context(|| format!("failed to list tasks of {project_id}"))?;
			write_tasks(&mut stdout, &tasks)?;
		}
		Commands::Show {
			task_id,
			with_messages,
		} => {
			detail_view(&client, cfg).show(&mut stdout, &task_id, with_messages)?;
		}
		Commands::Exec {
			task_id,
			executor,
			base_branch,
		} => {
			let attempt_id = start_attempt(&client, cfg, &task_id, executor, base_branch)?;
			writeln!(stdout, "Started attempt: {attempt_id}")?;
			let final_status =
				status::watch_attempt(&client, &attempt_id, &cfg.watch, &mut stdout, std::thread::sleep)?;
			info!(attempt_id = %attempt_id, status = %final_status, "attempt finished");
		}
		Commands::Status { target_id } => match status::lookup(&client, &target_id) {
			StatusReport::Task(s) => writeln!(stdout, "Task {target_id} status: {s}")?,
			StatusReport::Attempt(s) => writeln!(stdout, "Attempt {target_id} status: {s}")?,
		},
		Commands::Pick { with_messages } => {
			drop(stdout);
			pick(&client, cfg, config_path, with_messages)?;
		}
	}
	Ok(())
}

fn detail_view<'a, T: Transport>(
	client: &'a ApiClient<T>,
	cfg: &Config,
) -> DetailView<'a, T, impl FnMut(&str) -> Result<WsFrameSource, crate::logstream::StreamError>> {
	let ws_root = cfg.api.ws_root();
	let timeout = cfg.watch.stream_timeout();
	DetailView::new(client, move |process_id: &str| {
		WsFrameSource::connect(&normalized_logs_url(&ws_root, process_id), timeout)
	})
}

fn write_projects<W: Write>(out: &mut W, projects: &[Project]) -> io::Result<()> {
	if projects.is_empty() {
		return writeln!(out, "{}", picker::NO_PROJECTS);
	}
	writeln!(out, "{:<38}  {:<40}", "PROJECT ID", "NAME")?;
	writeln!(out, "{}", "-".repeat(80))?;
	for p in projects {
		writeln!(out, "{:<38}  {:<40}", p.id, p.name())?;
	}
	Ok(())
}

fn write_tasks<W: Write>(out: &mut W, tasks: &[Task]) -> io::Result<()> {
	if tasks.is_empty() {
		return writeln!(out, "{}", picker::NO_TASKS);
	}
	writeln!(out, "{:<38}  {:<40}  {:<10}", "TASK ID", "TITLE", "STATUS")?;
	writeln!(out, "{}", "-".repeat(92))?;
	for t in tasks {
		writeln!(out, "{:<38}  {:<40}  {:<10}", t.id, t.title(), t.status_label())?;
	}
	Ok(())
}

fn attempt_body(executor: Option<String>, base_branch: Option<String>) -> Value {
	let mut body = Map::new();
	if let Some(executor) = executor {
		body.insert("executor".to_string(), Value::String(executor));
	}
	if let Some(branch) = base_branch {
		body.insert("base_branch".to_string(), Value::String(branch));
	}
	Value::Object(body)
}

/// Attempt id echoed by the creation response, wrapped or bare.
fn created_attempt_id(response: Value) -> Option<String> {
	let value = unwrap_envelope(response);
	value
		.get("id")
		.and_then(Value::as_str)
		.filter(|id| !id.trim().is_empty())
		.map(str::to_string)
}

fn start_attempt<T: Transport>(
	client: &ApiClient<T>,
	cfg: &Config,
	task_id: &str,
	executor: Option<String>,
	base_branch: Option<String>,
) -> Result<String> {
	let response = client
		.create_attempt(task_id, &attempt_body(executor, base_branch))
		.with_context(|| format!("failed to start an attempt for {task_id}"))?;
	if let Some(id) = created_attempt_id(response) {
		return Ok(id);
	}
	info!(task_id, "attempt id missing from response, polling attempt list");
	let attempt = discovery::discover_attempt(client, task_id, RetryPolicy::from(&cfg.watch))?;
	Ok(attempt.id)
}

fn pick<T: Transport>(
	client: &ApiClient<T>,
	cfg: &Config,
	config_path: Option<&Path>,
	with_messages: bool,
) -> Result<()> {
	let selector = FzfSelector::locate(&cfg.picker.fzf_bin, &cfg.picker.preview_window)?;
	let options = PickerOptions {
		back_key: cfg.picker.back_key.clone(),
		preview_command: Some(picker::preview_command(&picker::current_exe(), config_path)),
	};
	let mut view = detail_view(client, cfg);
	let mut picker = Picker::new(client, selector, options);
	let state = picker.run(|task_id| view.show(&mut io::stdout().lock(), task_id, with_messages))?;

	match state {
		PickerState::Cancelled => println!("Selection canceled."),
		PickerState::Done(PickOutcome::Empty(notice)) => println!("{notice}"),
		_ => {}
	}
	Ok(())
}
