use proven_storage::StorageError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Entry file name could not be parsed as an index.
    #[error("invalid entry file name: {0}")]
    InvalidEntryName(String),

    /// Namespace cannot be mapped onto a directory name.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),
}

impl From<Error> for StorageError {
    fn from(error: Error) -> Self {
        match error {
            Error::InvalidEntryName(name) => Self::InvalidValue(name),
            Error::InvalidNamespace(name) => Self::InvalidNamespace(name),
            Error::Io(context, source) => {
                Self::Io(std::io::Error::new(source.kind(), format!("{context}: {source}")))
            }
        }
    }
}
