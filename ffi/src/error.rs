use std::fmt;

use cellbox_shared::errors::{CellboxError, ErrorCode};

/// Result type of boundary operations.
pub type BoundaryResult<T> = Result<T, ErrorInfo>;

/// Error handed to a boundary caller.
///
/// Carries the discriminated kind for programmatic handling and the full
/// message for humans. The caller owns it once returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl ErrorInfo {
    pub fn code_i32(&self) -> i32 {
        self.code.as_i32()
    }
}

impl From<CellboxError> for ErrorInfo {
    fn from(err: CellboxError) -> Self {
        Self {
            code: err.code(),
            message: Some(err.to_string()),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{:?}: {}", self.code, message),
            None => write!(f, "{:?}", self.code),
        }
    }
}

impl std::error::Error for ErrorInfo {}

/// Error for a required argument the caller left empty.
pub(crate) fn missing(param: &str) -> ErrorInfo {
    CellboxError::InvalidArgument(format!("{} is null", param)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_core_error() {
        let info = ErrorInfo::from(CellboxError::NotFound("web".into()));
        assert_eq!(info.code, ErrorCode::NotFound);
        assert_eq!(info.code_i32(), 2);
        assert_eq!(info.message.as_deref(), Some("box not found: web"));
    }

    #[test]
    fn test_missing_argument() {
        let info = missing("image");
        assert_eq!(info.code, ErrorCode::InvalidArgument);
        assert!(info.to_string().contains("image is null"));
    }
}
