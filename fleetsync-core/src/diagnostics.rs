//! Diagnostics and explicit read failures.
//!
//! Hosts usually report problems by appending to a diagnostics accumulator
//! that also carries warnings. The executor instead consumes
//! `Result<S, Failures>`: [`Diagnostics::into_result`] is the bridge.

use std::fmt;

use tracing::warn;

use crate::classify::{
    Classify, ErrorInfo, StatusClass, classify_error, classify_text, render_chain,
};

/// Severity of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single diagnostic entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    /// Classification captured while the structured cause was still at hand.
    pub info: Option<ErrorInfo>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            info: None,
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            info: None,
        }
    }

    /// Error diagnostic from a typed error, classified before it is rendered.
    pub fn from_error(
        summary: impl Into<String>,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: render_chain(err),
            info: Some(classify_error(err)),
        }
    }

    pub fn with_info(mut self, info: ErrorInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl Classify for Diagnostic {
    fn classify(&self) -> ErrorInfo {
        match &self.info {
            Some(info) => info.clone(),
            None => classify_text(&format!("{} {}", self.summary, self.detail)),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(&self.summary)
        } else {
            write!(f, "{}: {}", self.summary, self.detail)
        }
    }
}

/// Accumulator of errors and warnings, in the order they were reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    pub fn add_error(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.push(Diagnostic::error(summary, detail));
    }

    pub fn add_warning(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.push(Diagnostic::warning(summary, detail));
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| !d.is_error())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Ok(state)` when no errors were reported, otherwise the errors.
    ///
    /// Warnings never fail the result; they are logged and dropped.
    pub fn into_result<S>(self, state: S) -> Result<S, Failures> {
        let (errors, warnings): (Vec<_>, Vec<_>) =
            self.entries.into_iter().partition(Diagnostic::is_error);
        for w in &warnings {
            warn!(summary = %w.summary, detail = %w.detail, "diagnostic warning");
        }
        match Failures::from_diagnostics(errors) {
            Some(failures) => Err(failures),
            None => Ok(state),
        }
    }
}

impl From<Vec<Diagnostic>> for Diagnostics {
    fn from(entries: Vec<Diagnostic>) -> Self {
        Self { entries }
    }
}

/// Non-empty list of error diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failures {
    first: Diagnostic,
    rest: Vec<Diagnostic>,
}

impl Failures {
    pub fn new(first: Diagnostic) -> Self {
        Self {
            first,
            rest: Vec::new(),
        }
    }

    /// Keep only error entries; `None` if there are none.
    pub fn from_diagnostics(diagnostics: impl IntoIterator<Item = Diagnostic>) -> Option<Self> {
        let mut errors = diagnostics.into_iter().filter(Diagnostic::is_error);
        let first = errors.next()?;
        Some(Self {
            first,
            rest: errors.collect(),
        })
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.rest.push(diagnostic);
    }

    pub fn primary(&self) -> &Diagnostic {
        &self.first
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }
}

impl Classify for Failures {
    /// The first entry that classifies to something other than `Unknown`.
    fn classify(&self) -> ErrorInfo {
        self.iter()
            .map(Classify::classify)
            .find(|info| info.status_class != StatusClass::Unknown)
            .unwrap_or_else(|| self.first.classify())
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first)?;
        if !self.rest.is_empty() {
            write!(f, " (and {} more)", self.rest.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for Failures {}

impl From<Diagnostic> for Failures {
    fn from(diagnostic: Diagnostic) -> Self {
        Self::new(diagnostic)
    }
}

impl From<crate::classify::ApiError> for Failures {
    fn from(err: crate::classify::ApiError) -> Self {
        Self::new(Diagnostic::from_error("remote API error", &err))
    }
}
