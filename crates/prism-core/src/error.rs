use bytes::Bytes;

use prism_codec::{ConvertError, ErrorKind, InternalError};
use prism_common::ApiFormat;

/// Internal error taxonomy for one dispatch. The orchestrator classifies
/// each value into retry/surface/circuit decisions and owns the
/// translation to a client-facing envelope.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The client's own request is at fault; never retried.
    #[error("client error ({status}): {error:?}")]
    ClientRequest { status: u16, error: InternalError },

    /// The codec cannot express the request in the target dialect.
    #[error(transparent)]
    Conversion(#[from] ConvertError),

    /// The RPM guard rejected the attempt. No health effect.
    #[error("rpm limit reached: {observed}/{limit}")]
    ConcurrencyLimit { observed: i64, limit: u32 },

    /// 429/5xx/transport/timeout; retry on the next candidate.
    #[error("retriable upstream failure (status {status:?}): {message}")]
    UpstreamRetriable {
        status: Option<u16>,
        message: String,
        /// Explicit rate-limit signal feeds the adaptive RPM controller.
        rate_limited: bool,
        timeout: bool,
        body: Option<Bytes>,
    },

    /// 401/403 from the upstream credential: circuit-breaker material.
    #[error("upstream auth failure (status {status})")]
    UpstreamAuth { status: u16, body: Bytes },

    /// 400/413/422 that is plausibly the client's fault; surfaced as-is.
    #[error("upstream client error (status {status})")]
    UpstreamClient { status: u16, body: Bytes },

    /// HTTP 200 with an error envelope inside (Gemini habit).
    #[error("embedded upstream error: {0:?}")]
    Embedded(InternalError),

    /// Every candidate was tried and failed.
    #[error("no candidates available")]
    NoCandidates { last: Option<Box<GatewayError>> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        GatewayError::Internal(err.to_string())
    }

    pub fn from_upstream_status(status: u16, body: Bytes) -> Self {
        match status {
            401 | 403 => GatewayError::UpstreamAuth { status, body },
            400 | 413 | 422 => GatewayError::UpstreamClient { status, body },
            429 => GatewayError::UpstreamRetriable {
                status: Some(status),
                message: "upstream rate limited".to_string(),
                rate_limited: true,
                timeout: false,
                body: Some(body),
            },
            _ => GatewayError::UpstreamRetriable {
                status: Some(status),
                message: format!("upstream returned status {status}"),
                rate_limited: false,
                timeout: false,
                body: Some(body),
            },
        }
    }
}

/// Status and dialect-correct body ready to hand to the HTTP layer.
#[derive(Debug)]
pub struct ClientFacingError {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ClientFacingError {
    /// Render a gateway error in the client's dialect, with the request id
    /// attached for correlation.
    pub fn render(
        error: &GatewayError,
        client_format: ApiFormat,
        target_format: Option<ApiFormat>,
        request_id: &str,
    ) -> Self {
        let normalizer = prism_codec::normalizer(client_format.data_format());
        match error {
            GatewayError::ClientRequest { status, error } => Self {
                status: *status,
                body: normalizer.error_from_internal(error, Some(request_id)),
            },
            GatewayError::Conversion(err) => {
                let internal =
                    InternalError::new(ErrorKind::InvalidRequest, err.to_string());
                Self {
                    status: 400,
                    body: normalizer.error_from_internal(&internal, Some(request_id)),
                }
            }
            GatewayError::UpstreamClient { status, body } => Self {
                status: *status,
                body: prism_codec::convert_error_body(
                    target_format.unwrap_or(client_format),
                    client_format,
                    *status,
                    body,
                    Some(request_id),
                ),
            },
            GatewayError::Embedded(internal) => Self {
                status: internal.http_status(),
                body: normalizer.error_from_internal(internal, Some(request_id)),
            },
            GatewayError::NoCandidates { last } => match last.as_deref() {
                Some(GatewayError::UpstreamRetriable { timeout: true, .. }) => {
                    let internal = InternalError::new(
                        ErrorKind::ServerError,
                        "upstream timeout after exhausting candidates",
                    );
                    Self {
                        status: 504,
                        body: normalizer.error_from_internal(&internal, Some(request_id)),
                    }
                }
                Some(GatewayError::Conversion(err)) => {
                    let internal =
                        InternalError::new(ErrorKind::InvalidRequest, err.to_string());
                    Self {
                        status: 400,
                        body: normalizer.error_from_internal(&internal, Some(request_id)),
                    }
                }
                Some(GatewayError::ConcurrencyLimit { .. }) => {
                    let internal = InternalError::new(
                        ErrorKind::RateLimit,
                        "all upstream keys are at their rate limit",
                    );
                    Self {
                        status: 429,
                        body: normalizer.error_from_internal(&internal, Some(request_id)),
                    }
                }
                _ => {
                    let internal = InternalError::new(
                        ErrorKind::ServerError,
                        "upstream error after exhausting candidates",
                    );
                    Self {
                        status: 502,
                        body: normalizer.error_from_internal(&internal, Some(request_id)),
                    }
                }
            },
            GatewayError::ConcurrencyLimit { .. } => {
                let internal = InternalError::new(ErrorKind::RateLimit, error.to_string());
                Self {
                    status: 429,
                    body: normalizer.error_from_internal(&internal, Some(request_id)),
                }
            }
            GatewayError::UpstreamRetriable { .. } | GatewayError::UpstreamAuth { .. } => {
                let internal = InternalError::new(ErrorKind::ServerError, error.to_string());
                Self {
                    status: 502,
                    body: normalizer.error_from_internal(&internal, Some(request_id)),
                }
            }
            GatewayError::Internal(message) => {
                let internal = InternalError::new(ErrorKind::ServerError, message.clone());
                Self {
                    status: 500,
                    body: normalizer.error_from_internal(&internal, Some(request_id)),
                }
            }
        }
    }

    pub fn quota_exceeded(client_format: ApiFormat, request_id: &str) -> Self {
        let normalizer = prism_codec::normalizer(client_format.data_format());
        let internal = InternalError::new(ErrorKind::RateLimit, "quota exceeded");
        Self {
            status: 429,
            body: normalizer.error_from_internal(&internal, Some(request_id)),
        }
    }
}
