//! Script error types

use std::fmt;

/// Script result type
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Error raised by a script or by the host functions it calls
///
/// Host functions report argument and usage errors as [`ScriptError::RuntimeError`]; the
/// runtime delivers them into the script, which may handle them or let them end the
/// coroutine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Script compilation/loading error
    CompilationError {
        /// Error message
        message: String,
        /// Line number if available
        line: Option<usize>,
        /// Column number if available
        column: Option<usize>,
    },

    /// Script runtime error
    RuntimeError {
        /// Error message
        message: String,
        /// Script line where error occurred
        line: Option<usize>,
    },

    /// Host function argument of the wrong type
    TypeError {
        /// Error message
        message: String,
    },

    /// Invalid script source
    InvalidSource {
        /// Error message
        message: String,
    },

    /// IO error (reading script files)
    IoError {
        /// Error message
        message: String,
    },
}

impl ScriptError {
    /// Create a compilation error
    pub fn compilation<S: Into<String>>(message: S) -> Self {
        Self::CompilationError {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::RuntimeError {
            message: message.into(),
            line: None,
        }
    }

    /// Create an invalid source error
    pub fn invalid_source<S: Into<String>>(message: S) -> Self {
        Self::InvalidSource {
            message: message.into(),
        }
    }

    /// Create a type error
    pub fn type_error<S: Into<String>>(message: S) -> Self {
        Self::TypeError {
            message: message.into(),
        }
    }

    /// Error raised when a wrapper is used after its slice ended
    pub fn out_of_scope() -> Self {
        Self::runtime("object used outside of proper scope")
    }

    /// The bare message, without the error kind prefix
    pub fn message(&self) -> &str {
        match self {
            Self::CompilationError { message, .. }
            | Self::RuntimeError { message, .. }
            | Self::TypeError { message }
            | Self::InvalidSource { message }
            | Self::IoError { message } => message,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompilationError {
                message,
                line,
                column,
            } => {
                write!(f, "Script compilation error: {}", message)?;
                if let Some(line) = line {
                    write!(f, " at line {}", line)?;
                    if let Some(col) = column {
                        write!(f, ", column {}", col)?;
                    }
                }
                Ok(())
            }
            Self::RuntimeError { message, line } => {
                write!(f, "Script runtime error: {}", message)?;
                if let Some(line) = line {
                    write!(f, " at line {}", line)?;
                }
                Ok(())
            }
            Self::TypeError { message } => {
                write!(f, "Script type error: {}", message)
            }
            Self::InvalidSource { message } => {
                write!(f, "Invalid script source: {}", message)
            }
            Self::IoError { message } => {
                write!(f, "Script IO error: {}", message)
            }
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            message: err.to_string(),
        }
    }
}

impl From<ScriptError> for octopus_core::Error {
    fn from(err: ScriptError) -> Self {
        octopus_core::Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_position() {
        let err = ScriptError::CompilationError {
            message: "unexpected token".to_string(),
            line: Some(3),
            column: Some(7),
        };
        assert_eq!(
            err.to_string(),
            "Script compilation error: unexpected token at line 3, column 7"
        );
    }

    #[test]
    fn test_message_strips_prefix() {
        let err = ScriptError::out_of_scope();
        assert_eq!(err.message(), "object used outside of proper scope");
        assert_eq!(
            err.to_string(),
            "Script runtime error: object used outside of proper scope"
        );
    }

    #[test]
    fn test_into_core_error() {
        let err: octopus_core::Error = ScriptError::compilation("no such script").into();
        assert!(matches!(err, octopus_core::Error::Config(_)));
    }
}
