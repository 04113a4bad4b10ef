use prism_common::DataFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid {format:?} payload: {reason}")]
    InvalidPayload { format: DataFormat, reason: String },
    #[error("{source_format:?} -> {target_format:?} cannot represent {reason}")]
    Unsupported {
        source_format: DataFormat,
        target_format: DataFormat,
        reason: String,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ConvertError {
    pub fn invalid(format: DataFormat, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            format,
            reason: reason.into(),
        }
    }

    pub fn unsupported(
        source_format: DataFormat,
        target_format: DataFormat,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unsupported {
            source_format,
            target_format,
            reason: reason.into(),
        }
    }
}
