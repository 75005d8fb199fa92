//! Error types for StrataDB.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in StrataDB operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Buffer pool errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Index errors
    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let strata_err: StrataError = io_err.into();
        assert!(matches!(strata_err, StrataError::Io(_)));
        assert!(strata_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_io_error_string_display() {
        let err = StrataError::IoError("page 9 does not exist in file 0".to_string());
        assert_eq!(err.to_string(), "I/O error: page 9 does not exist in file 0");
    }

    #[test]
    fn test_buffer_pool_full_display() {
        let err = StrataError::BufferPoolFull;
        assert_eq!(err.to_string(), "Buffer pool full, unable to allocate frame");
    }

    #[test]
    fn test_btree_corrupted_display() {
        let err = StrataError::BTreeCorrupted("slot order violated".to_string());
        assert_eq!(err.to_string(), "B+ tree corrupted: slot order violated");
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = StrataError::InvalidParameter {
            name: "leaf_max_size".to_string(),
            value: "2".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: leaf_max_size = 2");
    }

    #[test]
    fn test_internal_error_display() {
        let err = StrataError::Internal("assertion failed".to_string());
        assert_eq!(err.to_string(), "Internal error: assertion failed");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(StrataError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StrataError>();
    }
}
