use thiserror::Error;

use crate::types::ChunkId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Repository not found at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("{path}: no such file or directory")]
    NotFound { path: String },

    #[error("{path}: already exists")]
    AlreadyExists { path: String },

    #[error("Lock timeout: {path} is held by someone else")]
    LockTimeout { path: String },

    #[error("Client {client} already exists in repository")]
    ClientAlreadyExists { client: String },

    #[error("Client {client} does not exist in repository")]
    ClientDoesNotExist { client: String },

    #[error("Repository client list could not be locked")]
    ClientListLockingFailed,

    #[error("Repository client list is not locked")]
    ClientListNotLocked,

    #[error("Client {client} could not be locked")]
    ClientLockingFailed { client: String },

    #[error("Client {client} is not locked")]
    ClientNotLocked { client: String },

    #[error("Client {client} has no generations")]
    ClientHasNoGenerations { client: String },

    #[error("Cannot find requested generation {generation} for client {client}")]
    GenerationDoesNotExist { client: String, generation: String },

    #[error("Client {client} has an unfinished generation {generation}")]
    GenerationUnfinished { client: String, generation: String },

    #[error("Generation {generation} of client {client} is finished and read-only")]
    GenerationFinished { client: String, generation: String },

    #[error("Client {client}, generation {generation} does not have file {path}")]
    FileDoesNotExistInGeneration {
        client: String,
        generation: String,
        path: String,
    },

    #[error("Repository format {format} does not allow key {key} to be used")]
    KeyNotAllowed { format: String, key: String },

    #[error("Key {key} does not accept a value of that type")]
    InvalidKeyValue { key: String },

    #[error("Repository does not contain chunk {chunk_id}")]
    ChunkDoesNotExist { chunk_id: ChunkId },

    #[error("Repository chunk indexes do not contain content")]
    ChunkContentNotInIndexes,

    #[error("Repository chunk indexes are not locked")]
    ChunkIndexesNotLocked,

    #[error("Repository chunk indexes could not be locked")]
    ChunkIndexesLockingFailed,

    #[error("Repository data is corrupted: {0}")]
    Corrupted(String),

    #[error("{0}")]
    Other(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl Error {
    /// Attach a pathname to an I/O error raised by a storage collaborator.
    pub fn io_at(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                path: path.to_string(),
            },
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists {
                path: path.to_string(),
            },
            _ => Error::Io(std::io::Error::new(err.kind(), format!("{path}: {err}"))),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
