//! Archive Stream Protocol Decoder.
//!
//! With `--log-json`, borg writes one JSON object per logical message to its
//! terminal, interleaved with whatever else ends up there. Objects are usually
//! on one line but are not guaranteed to be, so decoding is two-staged:
//!
//! 1. [`LineSplitter`] turns raw terminal bytes into lines.
//! 2. [`StreamDecoder`] buffers lines from an opening `{` until a line ending
//!    in `}` completes a parseable object, then yields a [`Message`].
//!
//! [`ArchiveStream`] is the per-process state on top: it applies messages
//! (progress, relayed log lines, prompts) and writes prompt answers back to
//! the process.
//!
//! ```text
//! {"type": "archive_progress", "original_size": 250, ...}  -> Progress
//! {"type": "log_message", "message": "..."}                -> Log
//! {"type": "question_prompt", "msgid": "...", ...}         -> Prompt
//! Enter passphrase for key /repo:                          -> legacy prompt
//! anything else                                            -> relayed text
//! ```

use std::collections::HashMap;
use std::io::Write;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::operator::Operator;

/// Plain-text passphrase prompt printed by archivers without JSON prompts.
pub const LEGACY_PASSPHRASE_PROMPT: &str = "Enter passphrase for key ";

/// Give up on an unterminated object after this many lines.
const MAX_PENDING_LINES: usize = 64;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    finished: bool,
    original_size: Option<f64>,
    msgid: Option<String>,
    message: Option<String>,
    #[serde(default)]
    is_prompt: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `archive_progress` with `finished` set.
    ArchiveFinished,
    /// `archive_progress` while running.
    Progress { original_size: Option<f64> },
    /// `log_message`.
    Log { text: String },
    /// A `question*` message that expects an answer.
    Prompt { id: String, text: String },
    /// `question_accepted`; nothing to show.
    Accepted,
    /// Any other `question*` message, shown as is.
    Notice { text: String },
    /// Parsed, but not a type this decoder acts on.
    Unrecognized { kind: String },
}

impl From<Envelope> for Message {
    fn from(env: Envelope) -> Self {
        let Some(kind) = env.kind else {
            return Message::Unrecognized { kind: String::new() };
        };
        match kind.as_str() {
            "archive_progress" if env.finished => Message::ArchiveFinished,
            "archive_progress" => Message::Progress {
                original_size: env.original_size,
            },
            "log_message" => Message::Log {
                text: env.message.unwrap_or_default(),
            },
            k if k.starts_with("question") => {
                let is_prompt = env.is_prompt || k.starts_with("question_prompt");
                let accepted = k.starts_with("question_accepted");
                let Some(id) = env.msgid.clone().or_else(|| env.message.clone()) else {
                    return Message::Unrecognized { kind };
                };
                let text = env.message.unwrap_or_default();
                if is_prompt {
                    Message::Prompt { id, text }
                } else if accepted {
                    Message::Accepted
                } else {
                    Message::Notice { text }
                }
            }
            _ => Message::Unrecognized { kind },
        }
    }
}

// ---------------------------------------------------------------------------
// Line decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Inside an object; more lines needed.
    Pending,
    Message(Message),
    /// Buffered lines that did not form an object, to be shown verbatim.
    Malformed(Vec<String>),
    /// The legacy plain-text passphrase prompt.
    PassphrasePrompt(String),
    Text(String),
    Blank,
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Feed one line (without its newline).
    pub fn push_line(&mut self, line: &str) -> Decoded {
        if self.pending.is_empty() && !line.starts_with('{') {
            return if line.starts_with(LEGACY_PASSPHRASE_PROMPT) {
                Decoded::PassphrasePrompt(line.to_string())
            } else if line.is_empty() {
                Decoded::Blank
            } else {
                Decoded::Text(line.to_string())
            };
        }

        self.pending.push(line.to_string());
        if line.ends_with('}') {
            match serde_json::from_str::<Envelope>(&self.pending.join("\n")) {
                Ok(env) => {
                    self.pending.clear();
                    return Decoded::Message(env.into());
                }
                // A `}` closed an inner object; keep reading.
                Err(e) if e.is_eof() => {}
                Err(e) => {
                    debug!("unparseable archiver message: {e}");
                    return Decoded::Malformed(std::mem::take(&mut self.pending));
                }
            }
        }
        if self.pending.len() >= MAX_PENDING_LINES {
            return Decoded::Malformed(std::mem::take(&mut self.pending));
        }
        Decoded::Pending
    }

    /// End of stream: whatever is still buffered can only be shown verbatim.
    pub fn finish(&mut self) -> Option<Vec<String>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Splits terminal output into lines, across arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line they complete, without `\r\n`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// A legacy passphrase prompt is never followed by a newline; hand it
    /// out as soon as it is complete.
    pub fn take_prompt(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.buf);
        if text.starts_with(LEGACY_PASSPHRASE_PROMPT) && text.trim_end().ends_with(':') {
            let line = decode_line(&self.buf);
            self.buf.clear();
            return Some(line);
        }
        None
    }

    /// Trailing text without a newline, at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Some(line)
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

// ---------------------------------------------------------------------------
// Prompt answers
// ---------------------------------------------------------------------------

/// Answers given by the operator during one run, keyed by prompt id. Shared
/// by every process so the same question is asked once.
#[derive(Debug, Default, Clone)]
pub struct PromptBook {
    answers: HashMap<String, String>,
}

impl PromptBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, id: &str) -> Option<&str> {
        self.answers.get(id).map(String::as_str)
    }

    pub fn record(&mut self, id: impl Into<String>, answer: impl Into<String>) {
        self.answers.insert(id.into(), answer.into());
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-process stream
// ---------------------------------------------------------------------------

pub struct ArchiveStream {
    tag: String,
    decoder: StreamDecoder,
    progress: f64,
    input: Option<Box<dyn Write + Send>>,
}

impl ArchiveStream {
    /// `tag` labels relayed output; `input` is where prompt answers go.
    pub fn new(tag: impl Into<String>, input: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            tag: tag.into(),
            decoder: StreamDecoder::new(),
            progress: 0.0,
            input,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Fraction of the total size processed so far. May exceed 1.0.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn mark_complete(&mut self) {
        self.progress = 1.0;
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Apply one line of process output.
    pub fn handle_line(
        &mut self,
        line: &str,
        total_size: Option<u64>,
        prompts: &mut PromptBook,
        operator: &mut dyn Operator,
    ) {
        match self.decoder.push_line(line) {
            Decoded::Pending | Decoded::Blank => {}
            Decoded::Text(text) => operator.relay(&self.tag, &[&text]),
            Decoded::Malformed(lines) => {
                let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
                operator.relay(&self.tag, &lines);
            }
            Decoded::PassphrasePrompt(prompt) => self.relay_passphrase(&prompt, operator),
            Decoded::Message(message) => self.apply(message, total_size, prompts, operator),
        }
    }

    /// Flush anything still buffered once the process output has ended.
    pub fn finish(&mut self, operator: &mut dyn Operator) {
        if let Some(lines) = self.decoder.finish() {
            let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
            operator.relay(&self.tag, &lines);
        }
    }

    fn apply(&mut self, message: Message, total_size: Option<u64>, prompts: &mut PromptBook, operator: &mut dyn Operator) {
        match message {
            Message::ArchiveFinished => operator.relay(&self.tag, &["archive finished"]),
            Message::Progress { original_size } => {
                if let (Some(size), Some(total)) = (original_size, total_size) {
                    if total > 0 {
                        self.progress = size / total as f64;
                    }
                }
            }
            Message::Log { text } | Message::Notice { text } => {
                let lines: Vec<&str> = text.split('\n').collect();
                operator.relay(&self.tag, &lines);
            }
            Message::Prompt { id, text } => self.answer_prompt(&id, &text, prompts, operator),
            Message::Accepted => {}
            Message::Unrecognized { kind } => debug!(tag = %self.tag, kind = %kind, "ignoring archiver message"),
        }
    }

    fn answer_prompt(&mut self, id: &str, text: &str, prompts: &mut PromptBook, operator: &mut dyn Operator) {
        if let Some(answer) = prompts.answer(id) {
            let answer = answer.to_string();
            self.reply(&answer);
            return;
        }
        if !self.has_input() {
            return;
        }
        match operator.ask(&self.tag, text) {
            Ok(Some(answer)) => {
                self.reply(&answer);
                prompts.record(id, answer);
            }
            Ok(None) => self.close_input(),
            Err(e) => {
                warn!(tag = %self.tag, "failed to read answer: {e}");
                self.close_input();
            }
        }
    }

    fn relay_passphrase(&mut self, prompt: &str, operator: &mut dyn Operator) {
        match operator.ask_secret(Some(&self.tag), prompt) {
            Ok(Some(secret)) => self.reply(&secret),
            Ok(None) => self.close_input(),
            Err(e) => {
                warn!(tag = %self.tag, "failed to read passphrase: {e}");
                self.close_input();
            }
        }
    }

    fn reply(&mut self, answer: &str) {
        let Some(input) = self.input.as_mut() else {
            debug!(tag = %self.tag, "input closed, dropping reply");
            return;
        };
        if let Err(e) = writeln!(input, "{answer}").and_then(|()| input.flush()) {
            debug!(tag = %self.tag, "reply not delivered: {e}");
            self.input = None;
        }
    }
}

/// Mean of the per-process progress fractions.
pub fn mean_progress<'a>(streams: impl IntoIterator<Item = &'a ArchiveStream>) -> f64 {
    let (sum, count) = streams
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), s| (sum + s.progress(), count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}
