use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KciError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Command failed: {command} (exit status {status})")]
    Command { command: String, status: i32 },

    #[error("Command timed out after {timeout:?}: {command}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Parse error: {message}")]
    ParseError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to apply patch {patch}")]
    PatchFailed { patch: String },

    #[error("Patchwork RPC fault {code}: {message}")]
    RpcFault { code: i32, message: String },

    #[error("Patchwork API mismatch ({got}, expected {expected})")]
    RpcProtocolMismatch { got: i64, expected: i64 },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("State error: {0}")]
    State(String),
}

impl KciError {
    pub fn parse(message: impl Into<String>) -> Self {
        KciError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    pub fn command(argv: &[String], status: Option<i32>) -> Self {
        KciError::Command {
            command: argv.join(" "),
            // Signal-terminated children report no code
            status: status.unwrap_or(-1),
        }
    }

    pub fn invalid_publisher(kind: &str) -> Self {
        KciError::Config(format!(
            "Unknown publisher type '{kind}'. Valid types are: scp, http"
        ))
    }

    pub fn invalid_runner(kind: &str) -> Self {
        KciError::Config(format!(
            "Unknown runner type '{kind}'. Valid types are: beaker"
        ))
    }

    pub fn invalid_reporter(kind: &str) -> Self {
        KciError::Config(format!(
            "Unknown reporter type '{kind}'. Valid types are: stdio"
        ))
    }
}

impl From<reqwest::Error> for KciError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "Request timed out. Check your network connection.".to_string()
        } else if err.is_connect() {
            "Failed to connect to server. Check your network connection.".to_string()
        } else if err.is_status() {
            format!(
                "HTTP error: {}",
                err.status()
                    .map_or("unknown".to_string(), |s| s.to_string())
            )
        } else {
            "Network request failed".to_string()
        };

        KciError::NetworkError {
            message,
            source: Some(Box::new(err)),
        }
    }
}

/// Format a `KciError` with contextual information for terminal display.
///
/// # Arguments
///
/// * `error` - The error to format
/// * `verbose` - If true, includes the full source chain
pub fn format_error(error: &KciError, verbose: bool) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    let _ = writeln!(output, "\n\u{26a0} Error: {}", error);

    if let Some(suggestion) = error_suggestion(error) {
        let _ = writeln!(output, "\nSuggestion: {}", suggestion);
    }

    if verbose {
        let mut source = std::error::Error::source(error);
        if source.is_some() {
            let _ = writeln!(output, "\nCaused by:");
        }
        while let Some(cause) = source {
            let _ = writeln!(output, "  - {}", cause);
            source = cause.source();
        }
    }

    output
}

fn error_suggestion(error: &KciError) -> Option<&'static str> {
    match error {
        KciError::Config(_) => Some("Check your rc file and command-line flags"),
        KciError::CommandTimeout { .. } => {
            Some("The build exceeded its watchdog; inspect the build log for a hang")
        }
        KciError::PatchFailed { .. } => {
            Some("The merge log records the failing application; see the report")
        }
        KciError::NetworkError { .. } => Some("Check connectivity to the remote endpoint"),
        KciError::Command { .. }
        | KciError::FileSystem(_)
        | KciError::ParseError { .. }
        | KciError::RpcFault { .. }
        | KciError::RpcProtocolMismatch { .. }
        | KciError::Scheduler(_)
        | KciError::State(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = KciError::command(&["git".to_string(), "merge".to_string()], Some(128));
        assert_eq!(
            err.to_string(),
            "Command failed: git merge (exit status 128)"
        );
    }

    #[test]
    fn test_command_error_signal_exit() {
        let err = KciError::command(&["make".to_string()], None);
        assert!(err.to_string().contains("exit status -1"));
    }

    #[test]
    fn test_timeout_is_distinct_kind() {
        let err = KciError::CommandTimeout {
            command: "make targz-pkg".to_string(),
            timeout: Duration::from_secs(60),
        };
        assert!(matches!(err, KciError::CommandTimeout { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_protocol_mismatch_display() {
        let err = KciError::RpcProtocolMismatch {
            got: 1,
            expected: 1010,
        };
        assert_eq!(err.to_string(), "Patchwork API mismatch (1, expected 1010)");
    }

    #[test]
    fn test_format_error_includes_suggestion() {
        let err = KciError::Config("missing baserepo".to_string());
        let formatted = format_error(&err, false);
        assert!(formatted.contains("missing baserepo"));
        assert!(formatted.contains("Suggestion:"));
    }
}
