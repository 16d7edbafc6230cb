use crate::api::{last_attempt_id, ApiClient, Transport};
use crate::logstream::{self, FrameSource, StreamError};
use crate::model::Task;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::io::Write;

/// Renders one task, optionally followed by the transcripts of its latest
/// attempt.
pub struct DetailView<'a, T, F> {
	client: &'a ApiClient<T>,
	connect: F,
}

impl<'a, T, F, S> DetailView<'a, T, F>
where
	T: Transport,
	F: FnMut(&str) -> Result<S, StreamError>,
	S: FrameSource,
{
	/// `connect` opens the log stream for an execution process id.
	pub fn new(client: &'a ApiClient<T>, connect: F) -> Self {
		Self { client, connect }
	}

	pub fn show<W: Write>(&mut self, out: &mut W, task_id: &str, with_messages: bool) -> Result<()> {
		let task = self
			.client
			.task(task_id)
			.with_context(|| format!("failed to load task {task_id}"))?;
		write_task(out, &task)?;

		if with_messages {
			writeln!(out, "\n{}", section_divider("Messages", terminal_width()))?;
			self.write_messages(out, task_id)?;
		}
		Ok(())
	}

	fn write_messages<W: Write>(&mut self, out: &mut W, task_id: &str) -> Result<()> {
		let attempts = self.client.attempts(task_id)?;
		let Some(attempt_id) = last_attempt_id(&attempts) else {
			writeln!(out, "No attempts found.")?;
			return Ok(());
		};
		writeln!(out, "Latest Attempt ID: {attempt_id}\n")?;

		let processes = self.client.execution_processes(&attempt_id)?;
		if processes.is_empty() {
			writeln!(out, "(no execution processes found)")?;
			return Ok(());
		}

		for process in processes {
			writeln!(out, "🔹 Process ID: {}", process.id)?;
			if let Some(prompt) = process.prompt() {
				writeln!(out, "🧑 User Prompt:\n{prompt}\n")?;
			}
			let source = (self.connect)(&process.id)?;
			let transcript = logstream::reconstruct(source);
			write!(out, "{}", logstream::render_transcript(&transcript))?;
			writeln!(out)?;
		}
		Ok(())
	}
}

fn write_task<W: Write>(out: &mut W, task: &Task) -> std::io::Result<()> {
	writeln!(out, "ID:          {}", task.id)?;
	writeln!(out, "Title:       {}", task.title())?;
	writeln!(out, "Status:      {}", task.status_label())?;
	writeln!(out, "Created At:  {}", format_timestamp(task.created_at.as_deref()))?;
	writeln!(out, "Updated At:  {}", format_timestamp(task.updated_at.as_deref()))?;
	writeln!(out)?;
	writeln!(out, "Description:")?;
	writeln!(out, "{}", task.description.as_deref().unwrap_or(""))
}

/// RFC 3339 timestamps are shown in local time; anything else verbatim.
fn format_timestamp(raw: Option<&str>) -> String {
	let Some(raw) = raw else {
		return String::new();
	};
	match DateTime::parse_from_rfc3339(raw) {
		Ok(ts) => ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
		Err(_) => raw.to_string(),
	}
}

fn terminal_width() -> usize {
	std::env::var("COLUMNS")
		.ok()
		.and_then(|c| c.trim().parse::<usize>().ok())
		.filter(|w| *w > 0)
		.unwrap_or(80)
}

pub fn section_divider(title: &str, width: usize) -> String {
	let title = match title.trim() {
		"" => "-",
		t => t,
	};
	let padding = width.saturating_sub(title.chars().count() + 2).max(2);
	let left = padding / 2;
	let right = padding - left;
	format!("{} {} {}", "-".repeat(left), title, "-".repeat(right))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::testing::FakeTransport;
	use std::io;

	const BASE: &str = "http://vk.test/api";

	struct OneShot(Vec<Vec<u8>>);

	impl FrameSource for OneShot {
		fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
			if self.0.is_empty() {
				Ok(None)
			} else {
				Ok(Some(self.0.remove(0)))
			}
		}
	}

	fn task_body() -> &'static str {
		r#"{"success":true,"data":{"id":"t1","title":"Fix login","status":"inreview","description":"Broken on Safari","created_at":"not a date","updated_at":null}}"#
	}

	#[test]
	fn divider_is_centered_and_padded() {
		assert_eq!(section_divider("Messages", 20), "----- Messages -----");
		assert_eq!(section_divider("  ", 7), "-- - --");
		assert_eq!(section_divider("A very long title", 4), "- A very long title -");
	}

	#[test]
	fn shows_task_fields() {
		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/tasks/t1"), 200, task_body());
		let client = ApiClient::new(&fake, BASE);
		let mut view = DetailView::new(&client, |_: &str| -> Result<OneShot, StreamError> {
			panic!("no streams without --with-messages")
		});

		let mut out = Vec::new();
		view.show(&mut out, "t1", false).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.starts_with("ID:          t1\nTitle:       Fix login\nStatus:      inreview\n"));
		assert!(text.contains("Created At:  not a date\n"));
		assert!(text.ends_with("Description:\nBroken on Safari\n"));
	}

	#[test]
	fn shows_latest_attempt_transcripts() {
		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/tasks/t1"), 200, task_body());
		fake.respond(
			&format!("{BASE}/task-attempts?task_id=t1"),
			200,
			r#"{"success":true,"data":[{"id":"a1"},{"id":"a2"}]}"#,
		);
		fake.respond(
			&format!("{BASE}/execution-processes?task_attempt_id=a2"),
			200,
			r#"{"success":true,"data":[{"id":"p1","executor_action":{"typ":{"type":"CodingAgentInitialRequest","prompt":"Fix it"}}}]}"#,
		);
		let client = ApiClient::new(&fake, BASE);
		let mut opened = Vec::new();
		let mut view = DetailView::new(&client, |id: &str| {
			opened.push(id.to_string());
			Ok(OneShot(vec![
				br#"{"JsonPatch":[{"op":"add","path":"/entries/0","value":{"content":{"entry_type":{"type":"assistant_message"},"content":"All good"}}}]}"#.to_vec(),
				br#"{"finished":true}"#.to_vec(),
			]))
		});

		let mut out = Vec::new();
		view.show(&mut out, "t1", true).unwrap();
		drop(view);
		let text = String::from_utf8(out).unwrap();

		assert_eq!(opened, vec!["p1"]);
		assert!(text.contains("Latest Attempt ID: a2\n"));
		assert!(text.contains("🔹 Process ID: p1\n🧑 User Prompt:\nFix it\n"));
		assert!(text.contains("\n✅ Result:\nAll good\n"));
	}

	#[test]
	fn missing_attempts_and_processes_are_notices() {
		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/tasks/t1"), 200, task_body());
		fake.respond(&format!("{BASE}/task-attempts?task_id=t1"), 200, r#"{"success":true,"data":[]}"#);
		let client = ApiClient::new(&fake, BASE);
		let mut view = DetailView::new(&client, |_: &str| Ok(OneShot(Vec::new())));
		let mut out = Vec::new();
		view.show(&mut out, "t1", true).unwrap();
		assert!(String::from_utf8(out).unwrap().ends_with("No attempts found.\n"));

		let fake = FakeTransport::new();
		fake.respond(&format!("{BASE}/tasks/t1"), 200, task_body());
		fake.respond(&format!("{BASE}/task-attempts?task_id=t1"), 200, r#"[{"id":"a1"}]"#);
		fake.respond(&format!("{BASE}/execution-processes?task_attempt_id=a1"), 200, r#"[]"#);
		let client = ApiClient::new(&fake, BASE);
		let mut view = DetailView::new(&client, |_: &str| Ok(OneShot(Vec::new())));
		let mut out = Vec::new();
		view.show(&mut out, "t1", true).unwrap();
		assert!(String::from_utf8(out).unwrap().ends_with("(no execution processes found)\n"));
	}
}
