use thiserror::Error;

/// Typed failures raised by the engine itself. Collaborator and device
/// failures travel as `anyhow::Error` instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("PCM payload has odd length {len}, expected whole 16-bit samples")]
    OddPcmLength { len: usize },

    #[error("short microphone read: wanted {wanted} samples, got {got}")]
    ShortRead { wanted: usize, got: usize },
}

impl EngineError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_field() {
        let e = EngineError::config("block_ms", "must be positive");
        assert_eq!(e.to_string(), "invalid config `block_ms`: must be positive");
        assert!(EngineError::OddPcmLength { len: 3 }.to_string().contains('3'));
    }
}
