//! Execution log transcripts.
//!
//! The backend streams JSON-patch frames that add or replace entries at
//! `/entries/<n>`. Frames may arrive in any order; for each index only the
//! last write is kept, and the transcript is rendered in index order once the
//! stream finishes or the socket closes.

use crate::model::{LogEntry, Transcript};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

const FINISHED_MARKER: &[u8] = b"\"finished\"";

static ENTRY_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/entries/(\d+)$").unwrap());

#[derive(Debug, Error)]
pub enum StreamError {
	#[error("error connecting to {url}: {source}")]
	Connect {
		url: String,
		#[source]
		source: Box<tungstenite::Error>,
	},
}

/// A message-oriented connection delivering raw frames.
pub trait FrameSource {
	/// Next frame, `Ok(None)` once the peer closed the stream.
	fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>>;

	fn close(&mut self) {}
}

#[derive(Debug, Deserialize)]
struct PatchFrame {
	#[serde(rename = "JsonPatch")]
	json_patch: Vec<PatchOp>,
}

#[derive(Debug, Deserialize)]
struct PatchOp {
	op: String,
	path: String,
	#[serde(default)]
	value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EntryValue {
	content: EntryContent,
}

#[derive(Debug, Deserialize)]
struct EntryContent {
	entry_type: EntryType,
	#[serde(default)]
	content: String,
}

#[derive(Debug, Deserialize)]
struct EntryType {
	#[serde(rename = "type")]
	kind: String,
}

fn entry_index(path: &str) -> Option<usize> {
	ENTRY_PATH
		.captures(path)
		.and_then(|caps| caps.get(1))
		.and_then(|m| m.as_str().parse().ok())
}

/// Sparse index → entry map built from patch frames.
#[derive(Debug, Default)]
pub struct Reconstructor {
	entries: BTreeMap<usize, LogEntry>,
}

impl Reconstructor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Apply one non-terminal frame. Malformed frames are ignored.
	pub fn apply_frame(&mut self, frame: &[u8]) {
		let patch: PatchFrame = match serde_json::from_slice(frame) {
			Ok(patch) => patch,
			Err(err) => {
				debug!(error = %err, len = frame.len(), "skipping unparsable frame");
				return;
			}
		};
		for op in patch.json_patch {
			self.apply_op(op);
		}
	}

	fn apply_op(&mut self, op: PatchOp) {
		if op.op != "add" && op.op != "replace" {
			return;
		}
		let Some(index) = entry_index(&op.path) else {
			return;
		};
		let Some(value) = op.value else {
			return;
		};
		match serde_json::from_value::<EntryValue>(value) {
			Ok(entry) => {
				self.entries.insert(
					index,
					LogEntry {
						index,
						kind: entry.content.entry_type.kind,
						text: entry.content.content,
					},
				);
			}
			Err(err) => debug!(index, error = %err, "skipping entry with unexpected shape"),
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn into_transcript(self) -> Transcript {
		self.entries.into_values().collect()
	}
}

/// Drain a connection into a transcript. The connection is closed on return.
pub fn reconstruct<S: FrameSource>(mut source: S) -> Transcript {
	let mut state = Reconstructor::new();
	loop {
		match source.next_frame() {
			Ok(Some(frame)) => {
				if contains(&frame, FINISHED_MARKER) {
					debug!(entries = state.len(), "stream finished");
					break;
				}
				state.apply_frame(&frame);
			}
			Ok(None) => {
				debug!(entries = state.len(), "stream closed by peer");
				break;
			}
			Err(err) if is_timeout(&err) => {
				if state.is_empty() {
					warn!("log stream timed out before any entry arrived");
				} else {
					warn!(entries = state.len(), "log stream timed out, showing partial transcript");
				}
				break;
			}
			Err(err) => {
				debug!(error = %err, "stream read ended");
				break;
			}
		}
	}
	source.close();
	state.into_transcript()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
	haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_timeout(err: &io::Error) -> bool {
	matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Text rendering of a transcript. Unknown kinds are dropped.
pub fn render_transcript(transcript: &[LogEntry]) -> String {
	let mut out = String::new();
	for entry in transcript {
		let text = &entry.text;
		let _ = match entry.kind.as_str() {
			"system_message" | "thinking" => writeln!(out, "── {text}"),
			"tool_use" => writeln!(out, "── > {text}"),
			"user_message" => writeln!(out, "\n> {text}"),
			"assistant_message" => writeln!(out, "\n✅ Result:\n{text}"),
			_ => Ok(()),
		};
	}
	out
}

pub fn normalized_logs_url(ws_root: &str, process_id: &str) -> String {
	format!(
		"{}/execution-processes/{}/normalized-logs/ws",
		ws_root.trim_end_matches('/'),
		process_id
	)
}

/// Blocking websocket connection with an idle read timeout and an overall
/// deadline.
pub struct WsFrameSource {
	socket: WebSocket<MaybeTlsStream<TcpStream>>,
	deadline: Option<Instant>,
	closed: bool,
}

impl WsFrameSource {
	pub fn connect(url: &str, timeout: Option<Duration>) -> Result<Self, StreamError> {
		let (socket, _response) = tungstenite::connect(url).map_err(|source| StreamError::Connect {
			url: url.to_string(),
			source: Box::new(source),
		})?;
		if let Some(timeout) = timeout {
			if let Some(tcp) = tcp_stream(socket.get_ref()) {
				if let Err(err) = tcp.set_read_timeout(Some(timeout)) {
					warn!(error = %err, "could not set log stream read timeout");
				}
			}
		}
		debug!(url, "log stream connected");
		Ok(Self {
			socket,
			deadline: timeout.and_then(deadline_after),
			closed: false,
		})
	}
}

/// `None` when the timeout is too large to represent as an instant.
fn deadline_after(timeout: Duration) -> Option<Instant> {
	Instant::now().checked_add(timeout)
}

fn tcp_stream(stream: &MaybeTlsStream<TcpStream>) -> Option<&TcpStream> {
	match stream {
		MaybeTlsStream::Plain(s) => Some(s),
		MaybeTlsStream::NativeTls(s) => Some(s.get_ref()),
		_ => None,
	}
}

impl FrameSource for WsFrameSource {
	fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
		loop {
			if self.deadline.is_some_and(|d| Instant::now() >= d) {
				return Err(io::Error::new(io::ErrorKind::TimedOut, "log stream deadline reached"));
			}
			match self.socket.read() {
				Ok(Message::Text(text)) => return Ok(Some(text.into_bytes())),
				Ok(Message::Binary(bytes)) => return Ok(Some(bytes)),
				Ok(Message::Close(_)) => {
					self.closed = true;
					return Ok(None);
				}
				Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
				Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
					self.closed = true;
					return Ok(None);
				}
				Err(tungstenite::Error::Io(err)) => return Err(err),
				Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
			}
		}
	}

	fn close(&mut self) {
		if self.closed {
			return;
		}
		self.closed = true;
		if let Err(err) = self.socket.close(None) {
			debug!(error = %err, "log stream close failed");
			return;
		}
		let _ = self.socket.flush();
	}
}

impl Drop for WsFrameSource {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::VecDeque;

	struct ScriptedFrames {
		frames: VecDeque<io::Result<Option<Vec<u8>>>>,
		closed: bool,
	}

	impl ScriptedFrames {
		fn new(frames: Vec<io::Result<Option<Vec<u8>>>>) -> Self {
			Self {
				frames: frames.into(),
				closed: false,
			}
		}

		fn text(frames: &[&str]) -> Self {
			Self::new(frames.iter().map(|f| Ok(Some(f.as_bytes().to_vec()))).collect())
		}
	}

	impl FrameSource for &mut ScriptedFrames {
		fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
			self.frames.pop_front().unwrap_or(Ok(None))
		}

		fn close(&mut self) {
			self.closed = true;
		}
	}

	fn patch(op: &str, index: usize, kind: &str, content: &str) -> String {
		serde_json::json!({
			"JsonPatch": [{
				"op": op,
				"path": format!("/entries/{index}"),
				"value": {"type": "NORMALIZED_ENTRY", "content": {"entry_type": {"type": kind}, "content": content}}
			}]
		})
		.to_string()
	}

	#[test]
	fn replace_overwrites_earlier_add() {
		let frames = [
			patch("add", 0, "user_message", "hello"),
			patch("replace", 0, "assistant_message", "done"),
			r#"{"finished": true}"#.to_string(),
		];
		let refs: Vec<&str> = frames.iter().map(String::as_str).collect();
		let mut source = ScriptedFrames::text(&refs);

		let transcript = reconstruct(&mut source);

		assert_eq!(
			transcript,
			vec![LogEntry {
				index: 0,
				kind: "assistant_message".to_string(),
				text: "done".to_string(),
			}]
		);
		assert!(source.closed);
	}

	#[test]
	fn order_follows_index_not_arrival() {
		let frames = [
			patch("add", 2, "tool_use", "ls"),
			patch("add", 0, "user_message", "start"),
			patch("add", 1, "thinking", "hmm"),
		];
		let refs: Vec<&str> = frames.iter().map(String::as_str).collect();
		let transcript = reconstruct(&mut ScriptedFrames::text(&refs));
		let indices: Vec<usize> = transcript.iter().map(|e| e.index).collect();
		assert_eq!(indices, vec![0, 1, 2]);
	}

	#[test]
	fn per_index_last_write_is_independent_of_interleaving() {
		let a = [
			patch("add", 0, "user_message", "q"),
			patch("add", 1, "thinking", "first"),
			patch("replace", 1, "assistant_message", "final"),
			patch("add", 2, "tool_use", "grep"),
		];
		let b = [
			patch("add", 2, "tool_use", "grep"),
			patch("add", 1, "thinking", "first"),
			patch("add", 0, "user_message", "q"),
			patch("replace", 1, "assistant_message", "final"),
		];
		let ra: Vec<&str> = a.iter().map(String::as_str).collect();
		let rb: Vec<&str> = b.iter().map(String::as_str).collect();
		assert_eq!(
			reconstruct(&mut ScriptedFrames::text(&ra)),
			reconstruct(&mut ScriptedFrames::text(&rb))
		);
	}

	#[test]
	fn unknown_ops_and_foreign_paths_are_ignored() {
		let mut state = Reconstructor::new();
		state.apply_frame(patch("add", 0, "user_message", "keep").as_bytes());
		state.apply_frame(patch("remove", 0, "user_message", "x").as_bytes());
		state.apply_frame(patch("test", 0, "thinking", "x").as_bytes());
		state.apply_frame(
			br#"{"JsonPatch":[{"op":"add","path":"/entries/3/content","value":{"content":{"entry_type":{"type":"thinking"},"content":"x"}}}]}"#,
		);
		state.apply_frame(
			br#"{"JsonPatch":[{"op":"add","path":"/other/1","value":{"content":{"entry_type":{"type":"thinking"},"content":"x"}}}]}"#,
		);
		state.apply_frame(br#"{"JsonPatch":[{"op":"add","path":"/entries/-1","value":{}}]}"#);
		assert_eq!(
			state.into_transcript(),
			vec![LogEntry {
				index: 0,
				kind: "user_message".to_string(),
				text: "keep".to_string(),
			}]
		);
	}

	#[test]
	fn oversized_timeout_means_no_deadline() {
		assert!(deadline_after(Duration::from_secs(u64::MAX)).is_none());
		let soon = deadline_after(Duration::from_secs(300)).unwrap();
		assert!(soon > Instant::now());
	}

	#[test]
	fn malformed_frames_do_not_stop_the_stream() {
		let good = patch("add", 4, "assistant_message", "ok");
		let transcript = reconstruct(&mut ScriptedFrames::text(&[
			"not json",
			r#"{"JsonPatch": "nope"}"#,
			r#"{"JsonPatch":[{"op":"add","path":"/entries/1","value":"plain"}]}"#,
			good.as_str(),
		]));
		assert_eq!(transcript.len(), 1);
		assert_eq!(transcript[0].index, 4);
	}

	#[test]
	fn finished_marker_stops_reading() {
		let late = patch("add", 9, "user_message", "late");
		let mut source = ScriptedFrames::text(&[r#"{"Finished":"ignored"}"#, r#"{"type":"finished"}"#, late.as_str()]);
		let transcript = reconstruct(&mut source);
		assert!(transcript.is_empty());
		assert_eq!(source.frames.len(), 1);
	}

	#[test]
	fn read_errors_and_timeouts_end_with_partial_transcript() {
		let first = patch("add", 0, "user_message", "hi");
		let mut source = ScriptedFrames::new(vec![
			Ok(Some(first.into_bytes())),
			Err(io::Error::new(io::ErrorKind::WouldBlock, "idle")),
			Ok(Some(patch("add", 1, "user_message", "never").into_bytes())),
		]);
		let transcript = reconstruct(&mut source);
		assert_eq!(transcript.len(), 1);
		assert!(source.closed);

		let mut source = ScriptedFrames::new(vec![Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))]);
		assert!(reconstruct(&mut source).is_empty());
	}

	#[test]
	fn rendering_maps_kinds_and_drops_unknown() {
		let entry = |index, kind: &str, text: &str| LogEntry {
			index,
			kind: kind.to_string(),
			text: text.to_string(),
		};
		let transcript = vec![
			entry(0, "system_message", "boot"),
			entry(1, "user_message", "fix the bug"),
			entry(2, "thinking", "looking"),
			entry(3, "tool_use", "cargo test"),
			entry(4, "error_message", "dropped"),
			entry(5, "assistant_message", "fixed"),
		];
		assert_eq!(
			render_transcript(&transcript),
			"── boot\n\n> fix the bug\n── looking\n── > cargo test\n\n✅ Result:\nfixed\n"
		);
	}

	#[test]
	fn logs_url_is_built_from_ws_root() {
		assert_eq!(
			normalized_logs_url("ws://localhost:8096/api/", "p1"),
			"ws://localhost:8096/api/execution-processes/p1/normalized-logs/ws"
		);
	}
}
