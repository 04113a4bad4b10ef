use crate::error::GatewayError;

/// What the dispatch loop does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Move to the next candidate; `health_penalty` controls whether the
    /// failure counts against the key's rolling window.
    RetryNext { health_penalty: bool },
    /// Auth failure: count toward the per-(key, format) circuit breaker,
    /// then move on.
    OpenCircuit,
    /// The client must see this; stop the loop.
    Surface,
    /// Explicit upstream rate-limit signal while the key is adaptive:
    /// lower the learned limit, no health regression, keep retrying.
    AdaptiveDownshift,
}

pub fn classify_failure(error: &GatewayError, key_is_adaptive: bool) -> FailureAction {
    match error {
        GatewayError::ConcurrencyLimit { .. } => FailureAction::RetryNext {
            health_penalty: false,
        },
        GatewayError::Conversion(_) => FailureAction::RetryNext {
            health_penalty: false,
        },
        GatewayError::UpstreamRetriable { rate_limited, .. } => {
            if *rate_limited && key_is_adaptive {
                FailureAction::AdaptiveDownshift
            } else {
                FailureAction::RetryNext {
                    health_penalty: true,
                }
            }
        }
        GatewayError::Embedded(_) => FailureAction::RetryNext {
            health_penalty: true,
        },
        GatewayError::UpstreamAuth { .. } => FailureAction::OpenCircuit,
        GatewayError::UpstreamClient { .. } | GatewayError::ClientRequest { .. } => {
            FailureAction::Surface
        }
        // Unexpected internal failures burn the current candidate only.
        GatewayError::Internal(_) => FailureAction::RetryNext {
            health_penalty: false,
        },
        GatewayError::NoCandidates { .. } => FailureAction::Surface,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn retriable(rate_limited: bool) -> GatewayError {
        GatewayError::UpstreamRetriable {
            status: Some(429),
            message: "slow down".to_string(),
            rate_limited,
            timeout: false,
            body: None,
        }
    }

    #[test]
    fn concurrency_limit_retries_without_penalty() {
        let action = classify_failure(
            &GatewayError::ConcurrencyLimit {
                observed: 48,
                limit: 60,
            },
            false,
        );
        assert_eq!(
            action,
            FailureAction::RetryNext {
                health_penalty: false
            }
        );
    }

    #[test]
    fn rate_limit_downshifts_only_adaptive_keys() {
        assert_eq!(
            classify_failure(&retriable(true), true),
            FailureAction::AdaptiveDownshift
        );
        assert_eq!(
            classify_failure(&retriable(true), false),
            FailureAction::RetryNext {
                health_penalty: true
            }
        );
    }

    #[test]
    fn auth_failures_open_the_circuit() {
        let error = GatewayError::UpstreamAuth {
            status: 401,
            body: Bytes::new(),
        };
        assert_eq!(classify_failure(&error, false), FailureAction::OpenCircuit);
    }

    #[test]
    fn upstream_client_errors_surface() {
        let error = GatewayError::UpstreamClient {
            status: 413,
            body: Bytes::new(),
        };
        assert_eq!(classify_failure(&error, false), FailureAction::Surface);
    }

    #[test]
    fn embedded_errors_retry_with_penalty() {
        let error = GatewayError::Embedded(prism_codec::InternalError::new(
            prism_codec::ErrorKind::RateLimit,
            "quota exhausted",
        ));
        assert_eq!(
            classify_failure(&error, false),
            FailureAction::RetryNext {
                health_penalty: true
            }
        );
    }
}
