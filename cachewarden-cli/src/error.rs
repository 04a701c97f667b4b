//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;

use cachewarden::watch::WatchError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(std::io::Error),
    /// Configuration error
    Config(String),
    /// Failed to start the filesystem watcher
    Watch(WatchError),
    /// Failed to build the async runtime
    Runtime(std::io::Error),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        // Print additional help for specific errors
        if let CliError::Watch(_) = self {
            eprintln!();
            eprintln!("Common issues:");
            eprintln!("  1. inotify limits: raise fs.inotify.max_user_watches /");
            eprintln!("     fs.inotify.max_user_instances via sysctl");
            eprintln!("  2. The listen directory must exist before the daemon starts");
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Watch(e) => write!(f, "Failed to start filesystem watcher: {}", e),
            CliError::Runtime(e) => write!(f, "Failed to build async runtime: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::LoggingInit(e) => Some(e),
            CliError::Watch(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            CliError::Config(_) => None,
        }
    }
}

impl From<WatchError> for CliError {
    fn from(e: WatchError) -> Self {
        CliError::Watch(e)
    }
}
