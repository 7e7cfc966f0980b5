//! Error types for the PDS core

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for PDS core operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// PDS core error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: ErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories raised by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Record path malformed (bad collection NSID, forbidden rkey characters,
    /// length out of bounds)
    InvalidKey,
    /// MST mutation targeted a key that does not exist
    KeyNotFound,
    /// MST create targeted a key that already exists
    KeyExists,
    /// No repository for the given DID or handle
    RepoNotFound,
    /// Operation attempted on a deactivated or tombstoned repository
    InactiveRepo,
    /// A write batch contains two operations for the same key
    ConflictingWrites,
    /// The external record validator rejected a record
    Validation,
    /// A referenced CID is absent from storage; indicates corruption
    BlockNotFound,
    /// Firehose cursor is older than the rollback window
    OutdatedCursor,
    /// MST node structure violates an invariant
    InvalidNode,
    /// Commit structure or chain invalid
    InvalidCommit,
    /// Cryptographic operation failed
    Crypto,
    /// Serialization or deserialization failed
    Serialization,
    /// CAR archive operation failed
    Car,
    /// Storage back-end failure
    Storage,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: ErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Constructors for different error kinds

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidKey, None)
            .with_help("record paths must match collection/rkey with [a-zA-Z0-9._:~-] characters, max 256 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create a key-not-found error
    pub fn key_not_found(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::KeyNotFound, None).with_context(format!("key not found: {key}"))
    }

    /// Create a key-exists error
    pub fn key_exists(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::KeyExists, None).with_context(format!("key already exists: {key}"))
    }

    /// Create a repo-not-found error
    pub fn repo_not_found(ident: impl fmt::Display) -> Self {
        Self::new(ErrorKind::RepoNotFound, None).with_context(format!("no repo for {ident}"))
    }

    /// Create an inactive-repo error
    pub fn inactive_repo(did: impl fmt::Display, status: impl fmt::Display) -> Self {
        Self::new(ErrorKind::InactiveRepo, None)
            .with_context(format!("repo {did} is {status}"))
            .with_help("deactivated repos can be loaded for sync but never mutated")
    }

    /// Create a conflicting-writes error
    pub fn conflicting_writes(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ConflictingWrites, None)
            .with_context(format!("multiple writes for key: {key}"))
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, Some(msg.into().into()))
    }

    /// Create a block-not-found error
    pub fn block_not_found(cid: impl fmt::Display) -> Self {
        Self::new(ErrorKind::BlockNotFound, None)
            .with_context(format!("block not found: {cid}"))
            .with_help("a missing referenced block indicates storage corruption")
    }

    /// Create an outdated-cursor error
    pub fn outdated_cursor(cursor: u64, earliest: u64) -> Self {
        Self::new(ErrorKind::OutdatedCursor, None)
            .with_context(format!(
                "cursor {cursor} is behind the rollback window (earliest replayable seq {earliest})"
            ))
            .with_help("resync with a full repo CAR export, then subscribe from a live cursor")
    }

    /// Create an invalid node error
    pub fn invalid_node(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidNode, Some(msg.into().into()))
            .with_help("MST nodes must keep same-height keys, sorted entries, no empty nodes")
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create a crypto error
    pub fn crypto(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Crypto, Some(Box::new(source)))
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a CAR archive error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Car, Some(Box::new(source)))
    }

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {src}")?;
        }

        Ok(())
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error)]
pub enum MstError {
    /// Empty key not allowed
    #[error("empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("invalid key characters: {key}")]
    InvalidKeyChars {
        /// The offending key
        key: String,
    },

    /// Key is not a two-segment `collection/rkey` path
    #[error("key is not a collection/rkey path: {key}")]
    InvalidKeyPath {
        /// The offending key
        key: String,
    },

    /// Node structure invalid
    #[error("node structure invalid: {0}")]
    InvalidNode(String),

    /// Serialization failed
    #[error("serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {len}/{max}"))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            MstError::InvalidKeyPath { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::invalid_node(msg),
            MstError::Serialization(e) => RepoError::new(ErrorKind::Serialization, Some(e)),
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Unsupported commit version
    #[error("unsupported commit version: {0}")]
    InvalidVersion(i64),

    /// Signature bytes malformed
    #[error("invalid signature format: {0}")]
    InvalidSignature(String),

    /// Signature did not verify
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// Serialization failed
    #[error("serialization failed")]
    Serialization(#[source] BoxError),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {v}"))
            }
            CommitError::InvalidSignature(msg) => RepoError::new(ErrorKind::Crypto, Some(msg.into()))
                .with_context("invalid signature format"),
            CommitError::SignatureVerificationFailed => RepoError::new(ErrorKind::Crypto, None)
                .with_context("signature verification failed"),
            CommitError::Serialization(e) => RepoError::new(ErrorKind::Serialization, Some(e)),
        }
    }
}
