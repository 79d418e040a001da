//! Structured warning records returned next to results.
//!
//! Every record is also forwarded to the `log` facade so that a binary with
//! `env_logger` installed sees the same messages it would have seen before.

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub context: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Diagnostics {
    pub records: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, context: &str, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{context}: {message}");
        self.records.push(Diagnostic {
            severity: Severity::Warning,
            context: context.to_string(),
            message,
        });
    }

    pub fn info(&mut self, context: &str, message: impl Into<String>) {
        let message = message.into();
        log::info!("{context}: {message}");
        self.records.push(Diagnostic {
            severity: Severity::Info,
            context: context.to_string(),
            message,
        });
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.records.extend(other.records);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.records
            .iter()
            .filter(|record| record.severity == Severity::Warning)
    }

    pub fn has_warnings(&self) -> bool {
        self.warnings().next().is_some()
    }
}
