// =============================================================================
// Datafeed error taxonomy
// =============================================================================
//
// Request-validation failures (exchange, resolution, symbol) are kept apart
// from transport failures so a consumer can tell "request invalid" from
// "exchange unreachable". An empty history is not an error at all; it is
// signalled through `BarsResult::no_data`.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("unsupported resolution: {0}")]
    UnsupportedResolution(String),

    #[error("cannot resolve symbol: {0}")]
    UnresolvableSymbol(String),

    #[error("fetch failed: {0:#}")]
    Fetch(#[from] anyhow::Error),
}

impl FeedError {
    /// Short machine-readable kind, used in WebSocket error pushes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedExchange(_) => "unsupported-exchange",
            Self::UnsupportedResolution(_) => "unsupported-resolution",
            Self::UnresolvableSymbol(_) => "unresolvable-symbol",
            Self::Fetch(_) => "fetch-error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedExchange(_) | Self::UnsupportedResolution(_) => StatusCode::BAD_REQUEST,
            Self::UnresolvableSymbol(_) => StatusCode::NOT_FOUND,
            Self::Fetch(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for FeedError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "s": "error",
            "kind": self.kind(),
            "errmsg": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let errors = [
            FeedError::UnsupportedExchange("kraken2".into()),
            FeedError::UnsupportedResolution("7".into()),
            FeedError::UnresolvableSymbol("FOOBAR".into()),
            FeedError::Fetch(anyhow::anyhow!("timeout")),
        ];
        let kinds: Vec<&str> = errors.iter().map(FeedError::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "unsupported-exchange",
                "unsupported-resolution",
                "unresolvable-symbol",
                "fetch-error"
            ]
        );
    }

    #[test]
    fn fetch_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("connection reset").context("GET /api/v3/klines request failed");
        let err = FeedError::from(inner);
        let msg = err.to_string();
        assert!(msg.contains("GET /api/v3/klines request failed"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn status_codes_by_kind() {
        assert_eq!(
            FeedError::UnresolvableSymbol("X".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            FeedError::Fetch(anyhow::anyhow!("x")).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
