//! The person at the terminal.
//!
//! Archiver output is relayed line by line with a `[destination]` tag, and
//! archiver prompts are forwarded with the same tag. Everything goes to
//! stderr so stdout stays free for the progress line.

use std::io::{self, BufRead};

use console::Term;

pub trait Operator {
    /// Whether someone can answer prompts.
    fn is_interactive(&self) -> bool;

    /// Print each line prefixed with `[tag]`.
    fn relay(&mut self, tag: &str, lines: &[&str]);

    /// Show a tagged prompt (no trailing newline) and read one line of input.
    /// `None` means input is closed.
    fn ask(&mut self, tag: &str, prompt: &str) -> io::Result<Option<String>>;

    /// Like [`ask`](Self::ask), but the answer is not echoed.
    fn ask_secret(&mut self, tag: Option<&str>, prompt: &str) -> io::Result<Option<String>>;
}

/// Render `lines` tagged, one per line. The last line gets `end` instead of a
/// newline.
pub fn tagged(tag: &str, lines: &[&str], end: &str) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        out.push('[');
        out.push_str(tag);
        out.push_str("] ");
        out.push_str(line);
        out.push_str(if i + 1 == lines.len() { end } else { "\n" });
    }
    out
}

pub struct ConsoleOperator {
    err: Term,
}

impl ConsoleOperator {
    pub fn new() -> Self {
        Self { err: Term::stderr() }
    }
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for ConsoleOperator {
    fn is_interactive(&self) -> bool {
        Term::stdout().is_term()
    }

    fn relay(&mut self, tag: &str, lines: &[&str]) {
        if lines.is_empty() {
            return;
        }
        let _ = self.err.write_str(&tagged(tag, lines, "\n"));
    }

    fn ask(&mut self, tag: &str, prompt: &str) -> io::Result<Option<String>> {
        let lines: Vec<&str> = prompt.split('\n').collect();
        self.err.write_str(&tagged(tag, &lines, ""))?;
        self.err.flush()?;
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer)? == 0 {
            return Ok(None);
        }
        Ok(Some(answer.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn ask_secret(&mut self, tag: Option<&str>, prompt: &str) -> io::Result<Option<String>> {
        match tag {
            Some(tag) => self.err.write_str(&tagged(tag, &[prompt], ""))?,
            None => self.err.write_str(prompt)?,
        }
        self.err.flush()?;
        match self.err.read_secure_line() {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_every_line() {
        assert_eq!(tagged("repo::a", &["one", "two"], "\n"), "[repo::a] one\n[repo::a] two\n");
    }

    #[test]
    fn prompt_has_no_trailing_newline() {
        assert_eq!(
            tagged("host:repo::a", &["Warning: unknown repo", "Proceed? "], ""),
            "[host:repo::a] Warning: unknown repo\n[host:repo::a] Proceed? "
        );
    }
}
