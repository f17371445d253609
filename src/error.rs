//! This module provides an `Error` type for the crate using the [`thiserror`] crate.

use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The emulator dynamic library could not be opened.
    #[error("failed to load emulator library {path}: {source}")]
    LibraryLoad {
        path: String,
        #[source]
        source: libloading::Error,
    },
    /// A required symbol was missing from the emulator dynamic library.
    #[error("emulator library is missing symbol {0}")]
    MissingSymbol(&'static str),
    /// The guest kernel image could not be opened or read.
    #[error("failed to load kernel image {path}: {source}")]
    KernelLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A Domain already exists in this process. There can be only one.
    #[error("tried to create more than one Domain; there can be only one")]
    DomainAlreadyExists,
    /// Failure reading or writing a checkpoint file.
    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(#[from] std::io::Error),
    /// The checkpoint file's header or region lengths were inconsistent with the RAM descriptor.
    #[error("malformed checkpoint: {0}")]
    MalformedCheckpoint(String),
}
