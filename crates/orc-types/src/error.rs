use serde::Serialize;

/// The seven error kinds named in the error-handling design (spec §7).
/// Crate-local error enums (`StoreError`, `QueueError`, ...) each expose a
/// `kind()` that classifies into one of these, so the HTTP boundary can
/// apply one recovery/serialization policy regardless of origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    PolicyDenied,
    ApprovalRequired,
    BudgetExceeded,
    NotFound,
    Conflict,
    Fatal,
}

/// Normalised error object returned to API callers (spec §7).
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: format!("{kind:?}")
                .chars()
                .fold(String::new(), |mut acc, c| {
                    if c.is_uppercase() && !acc.is_empty() {
                        acc.push('_');
                    }
                    acc.push(c.to_ascii_uppercase());
                    acc
                }),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
