use thiserror::Error;

/// Decoding failures of the wire protocol. Every variant is fatal for the frame being decoded, and
///  a connection that produces one is closed.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum WireError {
    #[error("malformed {what}: {required} bytes required, only {available} available")]
    Malformed {
        what: &'static str,
        required: usize,
        available: usize,
    },
    #[error("malformed {0}: invalid length prefix")]
    InvalidLength(&'static str),
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unknown {what} discriminator {id}")]
    UnknownDiscriminator {
        what: &'static str,
        id: u8,
    },
    #[error("frame of {len} bytes exceeds the maximum frame size of {max} bytes")]
    FrameTooLarge {
        len: usize,
        max: usize,
    },
}

impl WireError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, WireError::Malformed { .. })
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::malformed(WireError::Malformed { what: "app id", required: 5, available: 1 }, "malformed app id: 5 bytes required, only 1 available")]
    #[case::invalid_length(WireError::InvalidLength("frame"), "malformed frame: invalid length prefix")]
    #[case::invalid_utf8(WireError::InvalidUtf8("host"), "invalid UTF-8 in host")]
    #[case::unknown(WireError::UnknownDiscriminator { what: "deploy message", id: 99 }, "unknown deploy message discriminator 99")]
    #[case::too_large(WireError::FrameTooLarge { len: 10, max: 8 }, "frame of 10 bytes exceeds the maximum frame size of 8 bytes")]
    fn test_display(#[case] error: WireError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }
}
