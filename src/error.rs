// =============================================================================
// Error taxonomy for the autotrade core
// =============================================================================
//
// Mirrors the six error kinds the decision/execution pipeline distinguishes:
// config errors are fatal at startup, transient I/O is retried with backoff,
// validation errors discard a whole decision cycle, business rejections are
// just a logged message, fatal exchange errors are reported but never
// retried, and feedback errors are swallowed without affecting trading.
//
// Internal seams that need to match on kind return `Result<T, AppError>`;
// everything else uses `anyhow::Result` at the edges.
// =============================================================================

use std::fmt;

/// Typed error kind for the core trading pipeline.
#[derive(Debug)]
pub enum AppError {
    /// Missing or invalid configuration at startup. Fatal — the process
    /// refuses to start.
    Config(String),
    /// Exchange, cache, LLM, or DB network error. Retried with backoff;
    /// surfaces as a rejected execution once retries are exhausted.
    TransientIo(String),
    /// The LLM produced malformed JSON or an out-of-range decision value.
    /// The entire decision cycle is discarded — no partial execution.
    Validation(String),
    /// A structurally valid decision could not execute (no price,
    /// insufficient cash, unmapped symbol, short-sell attempted).
    BusinessRejection(String),
    /// Explicit exchange rejection (`canceled`/`rejected`/`error`). Reported
    /// as a failed-order metric; never retried.
    FatalExchange(String),
    /// LLM or Repository error inside the feedback loop. Logged and
    /// swallowed; no rule is generated.
    Feedback(String),
}

impl AppError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn business(msg: impl Into<String>) -> Self {
        Self::BusinessRejection(msg.into())
    }

    pub fn fatal_exchange(msg: impl Into<String>) -> Self {
        Self::FatalExchange(msg.into())
    }

    pub fn feedback(msg: impl Into<String>) -> Self {
        Self::Feedback(msg.into())
    }

    /// Whether this error kind should be retried by the caller's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::TransientIo(msg) => write!(f, "transient I/O error: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::BusinessRejection(msg) => write!(f, "rejected: {msg}"),
            Self::FatalExchange(msg) => write!(f, "exchange error: {msg}"),
            Self::Feedback(msg) => write!(f, "feedback error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::BusinessRejection(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FatalExchange(_) => StatusCode::BAD_GATEWAY,
            Self::Feedback(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_io_is_retryable() {
        assert!(AppError::transient("timeout").is_retryable());
        assert!(!AppError::validation("bad json").is_retryable());
        assert!(!AppError::business("no price").is_retryable());
        assert!(!AppError::fatal_exchange("rejected").is_retryable());
        assert!(!AppError::feedback("llm down").is_retryable());
        assert!(!AppError::config("missing key").is_retryable());
    }

    #[test]
    fn display_includes_message() {
        let e = AppError::business("insufficient cash");
        assert!(e.to_string().contains("insufficient cash"));
    }
}
