use serde::Serialize;

use super::Diagnostic;
use crate::debug::TraceFrame;

/// Wire shape of a diagnostic under `--json`.
#[derive(Serialize)]
struct Report<'a> {
    severity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    message: &'a str,
    traceback: &'a [TraceFrame],
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

/// One JSON object on a single line.
pub fn render(d: &Diagnostic) -> String {
    let report = Report {
        severity: "error",
        code: d.code,
        message: &d.message,
        traceback: &d.traceback,
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
    };
    serde_json::to_string(&report).unwrap_or_else(|e| {
        serde_json::json!({ "severity": "error", "message": format!("could not encode diagnostic: {e}") }).to_string()
    })
}
