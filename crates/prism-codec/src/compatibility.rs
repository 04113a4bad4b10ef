use prism_common::{ApiFormat, is_passthrough};

/// Endpoint-side acceptance declaration, mirrored from the catalog so the
/// codec crate does not depend on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatAcceptance {
    pub enabled: bool,
    pub accept_formats: Vec<ApiFormat>,
    pub reject_formats: Vec<ApiFormat>,
    pub stream_conversion: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatCompatibility {
    /// Same data format; bytes pass through untouched.
    Passthrough,
    /// The codec converts requests, responses, and (if streaming) streams.
    Convert,
    Incompatible { reason: &'static str },
}

/// Decide whether an endpoint can serve a client-format request.
///
/// Every normalizer implements the full request/response/stream contract,
/// so convertibility reduces to policy: the global switch plus the
/// endpoint's acceptance declaration.
pub fn check_format_compatibility(
    client_format: ApiFormat,
    endpoint_format: ApiFormat,
    acceptance: Option<&FormatAcceptance>,
    is_stream: bool,
    global_conversion_enabled: bool,
) -> FormatCompatibility {
    if is_passthrough(client_format, endpoint_format) {
        return FormatCompatibility::Passthrough;
    }

    if !global_conversion_enabled {
        return FormatCompatibility::Incompatible {
            reason: "format conversion disabled globally",
        };
    }

    let Some(acceptance) = acceptance else {
        return FormatCompatibility::Incompatible {
            reason: "endpoint does not declare format acceptance",
        };
    };
    if !acceptance.enabled {
        return FormatCompatibility::Incompatible {
            reason: "endpoint format conversion disabled",
        };
    }

    if acceptance.reject_formats.contains(&client_format) {
        return FormatCompatibility::Incompatible {
            reason: "endpoint rejects this client format",
        };
    }

    if !acceptance.accept_formats.is_empty()
        && !acceptance.accept_formats.contains(&client_format)
    {
        return FormatCompatibility::Incompatible {
            reason: "endpoint does not accept this client format",
        };
    }

    if is_stream && !acceptance.stream_conversion {
        return FormatCompatibility::Incompatible {
            reason: "endpoint does not allow stream conversion",
        };
    }

    FormatCompatibility::Convert
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acceptance(enabled: bool, stream: bool) -> FormatAcceptance {
        FormatAcceptance {
            enabled,
            accept_formats: Vec::new(),
            reject_formats: Vec::new(),
            stream_conversion: stream,
        }
    }

    #[test]
    fn same_family_passes_through() {
        assert_eq!(
            check_format_compatibility(
                ApiFormat::Claude,
                ApiFormat::ClaudeCli,
                None,
                true,
                false,
            ),
            FormatCompatibility::Passthrough
        );
    }

    #[test]
    fn conversion_needs_global_switch() {
        let result = check_format_compatibility(
            ApiFormat::Claude,
            ApiFormat::OpenAi,
            Some(&acceptance(true, true)),
            false,
            false,
        );
        assert!(matches!(result, FormatCompatibility::Incompatible { .. }));
    }

    #[test]
    fn reject_list_wins_over_accept_list() {
        let mut acc = acceptance(true, true);
        acc.accept_formats = vec![ApiFormat::Claude];
        acc.reject_formats = vec![ApiFormat::Claude];
        let result = check_format_compatibility(
            ApiFormat::Claude,
            ApiFormat::OpenAi,
            Some(&acc),
            false,
            true,
        );
        assert!(matches!(result, FormatCompatibility::Incompatible { .. }));
    }

    #[test]
    fn stream_conversion_gate() {
        let result = check_format_compatibility(
            ApiFormat::Claude,
            ApiFormat::OpenAi,
            Some(&acceptance(true, false)),
            true,
            true,
        );
        assert!(matches!(result, FormatCompatibility::Incompatible { .. }));

        let result = check_format_compatibility(
            ApiFormat::Claude,
            ApiFormat::OpenAi,
            Some(&acceptance(true, true)),
            true,
            true,
        );
        assert_eq!(result, FormatCompatibility::Convert);
    }
}
