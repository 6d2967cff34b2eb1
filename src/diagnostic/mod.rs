pub mod ansi;
pub mod json;
pub mod registry;

use crate::debug::TraceFrame;
use crate::loader::LoadError;
use crate::vm::VmError;

/// A fatal report: an uncaught exception or a code file that failed to load.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<&'static str>,
    pub message: String,
    /// Outermost call first.
    pub traceback: Vec<TraceFrame>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            message: message.into(),
            traceback: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_traceback(mut self, traceback: Vec<TraceFrame>) -> Self {
        self.traceback = traceback;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

fn load_error_code(e: &LoadError) -> &'static str {
    match e {
        LoadError::Io { .. } => "KRK-L001",
        LoadError::Json(_) => "KRK-L002",
        LoadError::BadOpcode { .. } => "KRK-L003",
        LoadError::Truncated { .. } => "KRK-L004",
        LoadError::ConstantOutOfRange { .. } => "KRK-L005",
        LoadError::ConstantKind { .. } => "KRK-L006",
        LoadError::JumpOutOfRange { .. } => "KRK-L007",
    }
}

impl From<&VmError> for Diagnostic {
    fn from(e: &VmError) -> Self {
        match e {
            VmError::Uncaught(exception) => {
                let mut d = Diagnostic::error(exception.to_string()).with_traceback(exception.traceback.clone());
                if let Some(code) = registry::code_for_exception(&exception.type_name) {
                    d = d.with_code(code);
                }
                if exception.type_name == "KeyboardInterrupt" {
                    d = d.with_note("execution was interrupted");
                }
                d
            }
            VmError::Load(load) => {
                let code = load_error_code(load);
                let mut d = Diagnostic::error(load.to_string()).with_code(code);
                if !matches!(load, LoadError::Io { .. }) {
                    d = d.with_suggestion(format!("run with --explain {code} for details"));
                }
                d
            }
        }
    }
}
