//! CLI error handling with user-friendly messages.

use std::fmt;
use std::io;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(io::Error),
    /// A session operation failed
    Session(tollway::connection::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);
        let code = match self {
            CliError::LoggingInit(_) => 1,
            CliError::Session(_) => 2,
        };
        process::exit(code)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggingInit(e) => write!(f, "failed to initialize logging: {}", e),
            Self::Session(e) => write!(f, "session error: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::LoggingInit(e) => Some(e),
            Self::Session(e) => Some(e),
        }
    }
}

impl From<tollway::connection::Error> for CliError {
    fn from(e: tollway::connection::Error) -> Self {
        Self::Session(e)
    }
}
