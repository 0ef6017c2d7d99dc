use std::io;
use thiserror::Error;
use std::string::FromUtf8Error;

/// type alias for all operations in this crate that could fail with a [`LinefsError`]
pub type Result<T> = std::result::Result<T, LinefsError>;

/// Error variants used throughout `linefs`.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum LinefsError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// variant for errors when parsing strings to some other type
    #[error("{}", .0)]
    Parsing(String),

    /// variant for wire protocol violations, i.e. a malformed request or response
    #[error("malformed message: {}", .0)]
    Protocol(String),

    /// variant for an invalid or out of range configuration value
    #[error("configuration error: {}", .0)]
    Config(String),

    /// variant for errors caused during type serialization/deserialization
    #[error("serialization/deserialization error")]
    Serialization(#[from] serde_json::Error),

    /// a line received on the wire is an invalid UTF-8 sequence
    #[error("{}", .0)]
    Utf8Error(#[from] FromUtf8Error),

    /// variant for reporting an `ERROR <message>` line sent by the server
    #[error("{}", .0)]
    Remote(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for LinefsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
