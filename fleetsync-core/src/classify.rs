//! Error classification.
//!
//! Remote failures arrive in three shapes: a structured [`ApiError`] envelope,
//! a transport-level [`std::io::Error`], or text that was rendered before it
//! reached us. Each shape has its own adapter that reduces it to an
//! [`ErrorInfo`]. The verdict functions at the bottom decide what the retry
//! executor does with that tuple.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized HTTP status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Locked,
    TooManyRequests,
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    Unknown,
}

impl StatusClass {
    /// Map a raw HTTP status onto a class.
    ///
    /// Statuses outside the fixed set fold as: other 5xx to 500, 408 to 504,
    /// everything else to `Unknown`.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            408 | 504 => Self::GatewayTimeout,
            409 => Self::Conflict,
            423 => Self::Locked,
            429 => Self::TooManyRequests,
            502 => Self::BadGateway,
            503 => Self::ServiceUnavailable,
            500..=599 => Self::InternalServerError,
            _ => Self::Unknown,
        }
    }

    /// The representative HTTP status, `None` for `Unknown`.
    pub fn as_u16(self) -> Option<u16> {
        match self {
            Self::BadRequest => Some(400),
            Self::Unauthorized => Some(401),
            Self::Forbidden => Some(403),
            Self::NotFound => Some(404),
            Self::Conflict => Some(409),
            Self::Locked => Some(423),
            Self::TooManyRequests => Some(429),
            Self::InternalServerError => Some(500),
            Self::BadGateway => Some(502),
            Self::ServiceUnavailable => Some(503),
            Self::GatewayTimeout => Some(504),
            Self::Unknown => None,
        }
    }

    pub fn is_server_error(self) -> bool {
        matches!(
            self,
            Self::InternalServerError
                | Self::BadGateway
                | Self::ServiceUnavailable
                | Self::GatewayTimeout
        )
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(status) => write!(f, "{status}"),
            None => f.write_str("unknown"),
        }
    }
}

/// Classification result: status class, machine code and an optional
/// server-provided back-off hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub status_class: StatusClass,
    pub code: String,
    pub retry_after: Option<Duration>,
}

impl ErrorInfo {
    pub fn new(status_class: StatusClass, code: impl Into<String>) -> Self {
        Self {
            status_class,
            code: code.into(),
            retry_after: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(StatusClass::Unknown, "Unknown")
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status_class == StatusClass::NotFound
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_class, self.code)
    }
}

/// Anything that can reduce itself to an [`ErrorInfo`].
pub trait Classify {
    fn classify(&self) -> ErrorInfo;
}

/// Structured error envelope returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status} {code}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "ResourceNotFound", message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl Classify for ApiError {
    fn classify(&self) -> ErrorInfo {
        let mut status_class = StatusClass::from_status(self.status);
        if status_class == StatusClass::Unknown {
            // Gateways sometimes wrap the real status; the message may know better.
            status_class = classify_text(&self.message).status_class;
        }
        let code = if self.code.is_empty() {
            "ApiError".to_string()
        } else {
            self.code.clone()
        };
        ErrorInfo {
            status_class,
            code,
            retry_after: self.retry_after,
        }
    }
}

impl Classify for io::Error {
    fn classify(&self) -> ErrorInfo {
        classify_transport(self)
    }
}

/// Classify a transport-level failure.
pub fn classify_transport(err: &io::Error) -> ErrorInfo {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut => ErrorInfo::new(StatusClass::GatewayTimeout, "TransportTimeout"),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => {
            ErrorInfo::new(StatusClass::ServiceUnavailable, "TransportConnection")
        }
        _ => {
            let from_text = classify_text(&err.to_string());
            if from_text.status_class == StatusClass::Unknown {
                ErrorInfo::new(StatusClass::Unknown, "TransportError")
            } else {
                from_text
            }
        }
    }
}

/// Phrase table for rendered text, checked in order against the lowercased
/// message.
const PHRASES: &[(&str, StatusClass, &str)] = &[
    ("not found", StatusClass::NotFound, "NotFound"),
    ("does not exist", StatusClass::NotFound, "NotFound"),
    ("throttl", StatusClass::TooManyRequests, "Throttled"),
    ("too many requests", StatusClass::TooManyRequests, "TooManyRequests"),
    ("rate limit", StatusClass::TooManyRequests, "RateLimited"),
    ("gateway timeout", StatusClass::GatewayTimeout, "GatewayTimeout"),
    ("timeout", StatusClass::GatewayTimeout, "Timeout"),
    ("timed out", StatusClass::GatewayTimeout, "Timeout"),
    ("deadline exceeded", StatusClass::GatewayTimeout, "Timeout"),
    ("service unavailable", StatusClass::ServiceUnavailable, "ServiceUnavailable"),
    ("temporarily unavailable", StatusClass::ServiceUnavailable, "ServiceUnavailable"),
    ("connection refused", StatusClass::ServiceUnavailable, "TransportConnection"),
    ("connection reset", StatusClass::ServiceUnavailable, "TransportConnection"),
    ("bad gateway", StatusClass::BadGateway, "BadGateway"),
    ("internal server error", StatusClass::InternalServerError, "InternalServerError"),
    ("unauthorized", StatusClass::Unauthorized, "Unauthorized"),
    ("unauthenticated", StatusClass::Unauthorized, "Unauthorized"),
    ("forbidden", StatusClass::Forbidden, "Forbidden"),
    ("access denied", StatusClass::Forbidden, "Forbidden"),
    ("permission denied", StatusClass::Forbidden, "Forbidden"),
    ("conflict", StatusClass::Conflict, "Conflict"),
    ("already exists", StatusClass::Conflict, "Conflict"),
    ("locked", StatusClass::Locked, "Locked"),
    ("bad request", StatusClass::BadRequest, "BadRequest"),
];

/// Status codes recognised as bare numbers in rendered text.
const STATUS_TOKENS: &[u16] = &[400, 401, 403, 404, 409, 423, 429, 500, 502, 503, 504];

/// Classify pre-rendered diagnostic text by case-insensitive phrase matching,
/// falling back to a bare status number appearing as its own token.
pub fn classify_text(text: &str) -> ErrorInfo {
    let lowered = text.to_lowercase();

    if let Some((_, class, code)) = PHRASES
        .iter()
        .find(|(phrase, _, _)| lowered.contains(phrase))
    {
        return ErrorInfo::new(*class, *code);
    }

    lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|status| STATUS_TOKENS.contains(status))
        .map(|status| ErrorInfo::new(StatusClass::from_status(status), format!("Http{status}")))
        .unwrap_or_else(ErrorInfo::unknown)
}

/// Classify an arbitrary error by walking its `source()` chain.
///
/// The first link that is a known structured shape wins. Otherwise the
/// rendered text of the whole chain is classified.
pub fn classify_error(err: &(dyn std::error::Error + 'static)) -> ErrorInfo {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(api) = e.downcast_ref::<ApiError>() {
            return api.classify();
        }
        if let Some(failures) = e.downcast_ref::<crate::diagnostics::Failures>() {
            return failures.classify();
        }
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return classify_transport(io);
        }
        current = e.source();
    }
    classify_text(&render_chain(err))
}

/// `outer: inner: innermost`
pub fn render_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        rendered.push_str(": ");
        rendered.push_str(&e.to_string());
        current = e.source();
    }
    rendered
}

/// How a read is being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Waiting for a write to become visible; a 404 is a convergence miss.
    #[default]
    AfterWrite,
    /// Plain refresh; a 404 means the resource is gone.
    Refresh,
}

/// What a delete does with a failure that could not be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownDeleteVerdict {
    #[default]
    Retry,
    Fail,
}

/// Outcome of classifying a delete failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Try again after the interval.
    Retry,
    /// Stop; retrying cannot change the outcome.
    Fail,
    /// Stop; the goal is already achieved.
    Satisfied,
}

/// Reads: retry throttling, server errors and anything unclassified.
pub fn is_retryable_read(info: &ErrorInfo) -> bool {
    matches!(
        info.status_class,
        StatusClass::TooManyRequests
            | StatusClass::InternalServerError
            | StatusClass::BadGateway
            | StatusClass::ServiceUnavailable
            | StatusClass::GatewayTimeout
            | StatusClass::Locked
            | StatusClass::Unknown
    )
}

/// Deletes: already gone, or a client error that will never succeed.
pub fn is_non_retryable_delete(info: &ErrorInfo) -> bool {
    matches!(
        info.status_class,
        StatusClass::NotFound
            | StatusClass::BadRequest
            | StatusClass::Unauthorized
            | StatusClass::Forbidden
    )
}

/// Deletes: contention, throttling and server errors.
pub fn is_retryable_delete(info: &ErrorInfo) -> bool {
    matches!(
        info.status_class,
        StatusClass::Conflict | StatusClass::Locked | StatusClass::TooManyRequests
    ) || info.status_class.is_server_error()
}

/// Whether a failed read should be attempted again.
pub fn should_retry_read(info: &ErrorInfo, mode: ReadMode) -> bool {
    match mode {
        ReadMode::AfterWrite if info.is_not_found() => true,
        _ => is_retryable_read(info),
    }
}

/// Verdict for a failed delete call.
pub fn delete_verdict(info: &ErrorInfo, unknown: UnknownDeleteVerdict) -> Verdict {
    if info.is_not_found() {
        Verdict::Satisfied
    } else if is_non_retryable_delete(info) {
        Verdict::Fail
    } else if is_retryable_delete(info) {
        Verdict::Retry
    } else {
        match unknown {
            UnknownDeleteVerdict::Retry => Verdict::Retry,
            UnknownDeleteVerdict::Fail => Verdict::Fail,
        }
    }
}
