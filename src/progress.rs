//! Single-line progress display, redrawn in place.

use std::cell::Cell;

use console::Term;

/// Lines are padded to this width so a shorter redraw erases a longer one.
const LINE_WIDTH: usize = 65;

pub struct ProgressLine {
    term: Option<Term>,
    animate: bool,
    drawn: Cell<bool>,
}

impl ProgressLine {
    /// Progress on stdout. When `animate` is off, only one-shot notices are
    /// printed so the operator can tell the run is not stuck.
    pub fn stdout(animate: bool) -> Self {
        Self {
            term: Some(Term::stdout()),
            animate,
            drawn: Cell::new(false),
        }
    }

    /// Discards everything.
    pub fn hidden() -> Self {
        Self {
            term: None,
            animate: false,
            drawn: Cell::new(false),
        }
    }

    /// Whether percentages are being drawn.
    pub fn is_enabled(&self) -> bool {
        self.animate && self.term.is_some()
    }

    /// Redraw the progress line with `text`.
    pub fn update(&self, text: &str) {
        if !self.animate {
            return;
        }
        if let Some(term) = &self.term {
            let _ = term.write_str(&format!("\r{text:<LINE_WIDTH$}\r"));
            let _ = term.flush();
            self.drawn.set(true);
        }
    }

    /// Print `text` on its own line, for runs that show no percentages.
    pub fn notice(&self, text: &str) {
        self.finish();
        if let Some(term) = &self.term {
            let _ = term.write_line(text);
        }
    }

    /// Move past the progress line, if one was drawn.
    pub fn finish(&self) {
        if let Some(term) = &self.term {
            if self.drawn.replace(false) {
                let _ = term.write_line("");
            }
        }
    }
}

/// `int(100 * fraction)`. Not clamped: the archiver can report more bytes
/// than the precomputed total.
pub fn percent(fraction: f64) -> i64 {
    (fraction * 100.0).trunc() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_truncates() {
        assert_eq!(percent(0.625), 62);
        assert_eq!(percent(0.999), 99);
        assert_eq!(percent(0.0), 0);
    }

    #[test]
    fn percent_allows_overshoot() {
        assert_eq!(percent(1.25), 125);
    }

    #[test]
    fn hidden_line_draws_nothing() {
        let line = ProgressLine::hidden();
        assert!(!line.is_enabled());
        line.update("backup progress: 10%");
        line.notice("starting backup");
        line.finish();
    }
}
