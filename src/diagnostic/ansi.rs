use std::fmt::Write;

use super::Diagnostic;

const BOLD: &str = "1";
const RED: &str = "1;31";
const CYAN: &str = "36";
const DIM: &str = "2";

/// Renders a diagnostic the way an uncaught exception is shown on a terminal:
/// the traceback, outermost call first, then the labelled message.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("\x1b[{style}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        if !d.traceback.is_empty() {
            let _ = writeln!(out, "{}", self.paint(DIM, "Traceback (most recent call last):"));
            let arrow = self.paint(CYAN, "-->");
            for frame in &d.traceback {
                let function = self.paint(BOLD, &frame.function);
                let _ = writeln!(out, "  {arrow} {}:{} in {function}", frame.filename, frame.line);
            }
        }

        let label = match d.code {
            Some(code) => format!("error[{code}]"),
            None => "error".to_string(),
        };
        let _ = writeln!(out, "{}: {}", self.paint(RED, &label), self.paint(BOLD, &d.message));

        let bullet = self.paint(DIM, "=");
        for note in &d.notes {
            let _ = writeln!(out, "  {bullet} note: {note}");
        }
        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {bullet} help: {suggestion}");
        }
        out
    }
}
