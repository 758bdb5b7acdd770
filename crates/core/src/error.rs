use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid routing flag {0}")]
    InvalidRoutingFlag(u8),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Fail with [`CoreError::InvalidLength`] unless `bytes` has exactly `expected` bytes
pub(crate) fn expect_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(CoreError::InvalidLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}
