use chrono::{DateTime, Utc};
use kernel_proto::{msg_type, ErrorContent, ExecuteReply, Message};
use serde_json::Value;

/// Cap on accumulated bytes per output stream for one execution.
pub const MAX_STREAM_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Error,
    Abort,
}

impl ExecutionStatus {
    fn from_reply(status: &str) -> Self {
        match status {
            "ok" => ExecutionStatus::Ok,
            "abort" | "aborted" => ExecutionStatus::Abort,
            _ => ExecutionStatus::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timing {
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Accumulated view of one code execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub execution_count: Option<u64>,
    pub stdout: String,
    pub stderr: String,
    pub traceback: Vec<String>,
    pub display_data: Vec<Value>,
    pub error: Option<ErrorContent>,
    pub timing: Timing,
}

/// Builds an [`ExecutionResult`] incrementally from the streaming events
/// addressed to one execute request.
pub(crate) struct ExecutionAccumulator {
    started: DateTime<Utc>,
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    display_data: Vec<Value>,
    error: Option<ErrorContent>,
}

impl ExecutionAccumulator {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            stdout: StreamBuffer::default(),
            stderr: StreamBuffer::default(),
            display_data: Vec::new(),
            error: None,
        }
    }

    /// Fold one correlated event in. Returns the reply content when the
    /// terminal `execute_reply` arrives; everything else keeps the call
    /// pending.
    pub fn absorb(&mut self, msg: &Message) -> Option<ExecuteReply> {
        match msg.msg_type() {
            msg_type::STREAM => {
                if let Some(stream) = msg.stream() {
                    match stream.name.as_str() {
                        "stderr" => self.stderr.push(&stream.text),
                        _ => self.stdout.push(&stream.text),
                    }
                }
                None
            }
            msg_type::DISPLAY_DATA | msg_type::EXECUTE_RESULT => {
                self.display_data.push(msg.content.clone());
                None
            }
            // An error event is data, not a fault; the kernel may still
            // send a final reply after it.
            msg_type::ERROR => {
                self.error = msg.error();
                None
            }
            msg_type::EXECUTE_REPLY => msg.execute_reply(),
            _ => None,
        }
    }

    pub fn finalize(self, reply: ExecuteReply) -> ExecutionResult {
        let completed = Utc::now();
        let mut stderr = self.stderr.text;
        for (name, truncated) in [("stdout", self.stdout.truncated), ("stderr", self.stderr.truncated)] {
            if truncated {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "[{name} truncated: exceeded {} bytes]\n",
                    MAX_STREAM_BYTES
                ));
            }
        }
        let traceback = self
            .error
            .as_ref()
            .map(|err| err.traceback.clone())
            .unwrap_or_default();
        ExecutionResult {
            status: ExecutionStatus::from_reply(&reply.status),
            execution_count: reply.execution_count,
            stdout: self.stdout.text,
            stderr,
            traceback,
            display_data: self.display_data,
            error: self.error,
            timing: Timing {
                started: self.started,
                completed,
                duration_ms: (completed - self.started).num_milliseconds(),
            },
        }
    }
}

#[derive(Default)]
struct StreamBuffer {
    text: String,
    truncated: bool,
}

impl StreamBuffer {
    /// Append up to the cap; bytes past it are dropped, never buffered.
    fn push(&mut self, chunk: &str) {
        let remaining = MAX_STREAM_BYTES.saturating_sub(self.text.len());
        if remaining == 0 {
            self.truncated = true;
            return;
        }
        if chunk.len() <= remaining {
            self.text.push_str(chunk);
        } else {
            let mut end = remaining;
            while !chunk.is_char_boundary(end) {
                end -= 1;
            }
            self.text.push_str(&chunk[..end]);
            self.truncated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_proto::Header;
    use serde_json::json;

    fn event(msg_type: &str, parent_id: &str, content: Value) -> Message {
        let mut msg = Message::request(msg_type, "kernel-session", content);
        msg.parent_header = Some(Header {
            msg_id: parent_id.to_string(),
            ..Header::new("execute_request", "client-session")
        });
        msg
    }

    fn ok_reply(count: u64) -> ExecuteReply {
        serde_json::from_value(json!({ "status": "ok", "execution_count": count })).unwrap()
    }

    #[test]
    fn accumulates_streams_and_display_data() {
        let mut acc = ExecutionAccumulator::new();
        assert!(acc
            .absorb(&event("stream", "m", json!({ "name": "stdout", "text": "a" })))
            .is_none());
        assert!(acc
            .absorb(&event("stream", "m", json!({ "name": "stderr", "text": "b" })))
            .is_none());
        assert!(acc
            .absorb(&event(
                "execute_result",
                "m",
                json!({ "data": { "text/plain": "42" } })
            ))
            .is_none());

        let reply = acc
            .absorb(&event(
                "execute_reply",
                "m",
                json!({ "status": "ok", "execution_count": 7 })
            ))
            .expect("terminal reply");
        let result = acc.finalize(reply);
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.execution_count, Some(7));
        assert_eq!(result.stdout, "a");
        assert_eq!(result.stderr, "b");
        assert_eq!(result.display_data.len(), 1);
        assert!(result.timing.duration_ms >= 0);
    }

    #[test]
    fn error_event_is_recorded_without_resolving() {
        let mut acc = ExecutionAccumulator::new();
        let terminal = acc.absorb(&event(
            "error",
            "m",
            json!({ "ename": "ValueError", "evalue": "bad", "traceback": ["tb0", "tb1"] }),
        ));
        assert!(terminal.is_none());

        let reply: ExecuteReply =
            serde_json::from_value(json!({ "status": "error", "execution_count": 1 })).unwrap();
        let result = acc.finalize(reply);
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error.as_ref().unwrap().ename, "ValueError");
        assert_eq!(result.traceback, vec!["tb0", "tb1"]);
    }

    #[test]
    fn stdout_truncates_at_cap_and_keeps_earlier_bytes() {
        let mut acc = ExecutionAccumulator::new();
        let chunk = "x".repeat(600 * 1024);
        acc.absorb(&event("stream", "m", json!({ "name": "stdout", "text": chunk })));
        acc.absorb(&event("stream", "m", json!({ "name": "stdout", "text": chunk })));
        acc.absorb(&event("stream", "m", json!({ "name": "stdout", "text": "late" })));

        let result = acc.finalize(ok_reply(1));
        assert_eq!(result.stdout.len(), MAX_STREAM_BYTES);
        assert!(result.stdout.starts_with("xxx"));
        assert!(result.stderr.contains("stdout truncated"));
    }

    #[test]
    fn truncation_cuts_on_a_char_boundary() {
        let mut acc = ExecutionAccumulator::new();
        let almost = "x".repeat(MAX_STREAM_BYTES - 1);
        acc.absorb(&event("stream", "m", json!({ "name": "stdout", "text": almost })));
        // multi-byte char cannot fit in the single remaining byte
        acc.absorb(&event("stream", "m", json!({ "name": "stdout", "text": "é" })));

        let result = acc.finalize(ok_reply(1));
        assert_eq!(result.stdout.len(), MAX_STREAM_BYTES - 1);
        assert!(result.stderr.contains("stdout truncated"));
    }

    #[test]
    fn untruncated_output_gets_no_notice() {
        let mut acc = ExecutionAccumulator::new();
        acc.absorb(&event("stream", "m", json!({ "name": "stdout", "text": "fine" })));
        let result = acc.finalize(ok_reply(1));
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn abort_status_maps_through() {
        let acc = ExecutionAccumulator::new();
        let reply: ExecuteReply = serde_json::from_value(json!({ "status": "abort" })).unwrap();
        let result = acc.finalize(reply);
        assert_eq!(result.status, ExecutionStatus::Abort);
        assert_eq!(result.execution_count, None);
    }
}
