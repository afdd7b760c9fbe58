use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistexpError {
    #[error("Failed to connect to {server} at {address}: {source}")]
    Connection {
        server: String,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server {0} is not connected")]
    NotConnected(String),
    #[error("{server}: {command:?} exited with return code {code}")]
    RemoteExit {
        server: String,
        command: String,
        code: i32,
    },
    #[error("{server}: {command:?} timed out")]
    Timeout { server: String, command: String },
    #[error("Assertion failed at {location}: {message}")]
    Assertion { location: String, message: String },
    #[error("Malformed RPC message: {0}")]
    Protocol(String),
    #[error("Invalid server configuration: {0}")]
    Config(String),
    #[error("Invalid parameter grid: {0}")]
    Grid(String),
    #[error("Failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to render command template: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("Failed to send notification: {0}")]
    Notification(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DistexpError {
    /// Whether this error stops the remaining batch.
    ///
    /// Nonzero exits and timeouts only halt when the owning registration
    /// asked for it with `raise_on_rc`. Everything else always halts.
    pub fn halts_batch(&self, raise_on_rc: bool) -> bool {
        match self {
            DistexpError::RemoteExit { .. } | DistexpError::Timeout { .. } => raise_on_rc,
            _ => true,
        }
    }
}

/// Returns an `Assertion` error from the enclosing function if `cond` is false.
///
/// The error records the file and line of the check.
///
/// ```ignore
/// check!(rc == 0, "server exited with {}", rc);
/// ```
#[macro_export]
macro_rules! check {
    ($cond:expr $(,)?) => {
        $crate::check!($cond, "{}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::DistexpError::Assertion {
                location: format!("{}:{}", file!(), line!()),
                message: format!($($arg)+),
            });
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded(value: i32) -> Result<i32, DistexpError> {
        check!(value > 0, "value was {}", value);
        Ok(value)
    }

    #[test]
    fn test_check_passes_through() {
        assert_eq!(guarded(3).unwrap(), 3);
    }

    #[test]
    fn test_check_records_location() {
        match guarded(-1) {
            Err(DistexpError::Assertion { location, message }) => {
                assert!(location.starts_with(file!()));
                assert_eq!(message, "value was -1");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_remote_exit_halts_only_with_raise_on_rc() {
        let err = DistexpError::RemoteExit {
            server: "node01".into(),
            command: "false".into(),
            code: 1,
        };
        assert!(err.halts_batch(true));
        assert!(!err.halts_batch(false));
    }

    #[test]
    fn test_assertion_always_halts() {
        let err = DistexpError::Assertion {
            location: "x.rs:1".into(),
            message: "boom".into(),
        };
        assert!(err.halts_batch(false));
        assert!(err.halts_batch(true));
    }
}
