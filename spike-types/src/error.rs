//! The typed error kinds surfaced by the SPIKE core.
//!
//! The persistence layer and the KEK manager return these kinds directly;
//! the peer-identity gate surfaces only [`SpikeError::AccessUnauthorized`]
//! with no additional detail. Service binaries wrap initialization failures
//! in `eyre` and treat them as fatal; runtime failures are not.

/// All error kinds of the SPIKE core.
#[derive(Debug, thiserror::Error)]
pub enum SpikeError {
    /// The caller identity is not on the allowlist for the route.
    ///
    /// Deliberately carries no payload: the gate never echoes the caller.
    #[error("access unauthorized")]
    AccessUnauthorized,

    /// The requested entity does not exist.
    #[error("entity not found")]
    EntityNotFound,

    /// The entity failed validation (e.g. an all-zero shard).
    #[error("entity invalid: {0}")]
    EntityInvalid(String),

    /// The entity exists but could not be loaded.
    #[error("entity load failed: {0}")]
    EntityLoadFailed(String),

    /// A backing-store query failed.
    #[error("entity query failed: {0}")]
    EntityQueryFailed(String),

    /// Serializing data for storage or the wire failed.
    #[error("data marshal failure: {0}")]
    DataMarshalFailure(String),

    /// Deserializing stored or received data failed.
    #[error("data unmarshal failure: {0}")]
    DataUnmarshalFailure(String),

    /// Drawing random bytes for a nonce failed.
    #[error("nonce generation failed")]
    CryptoNonceGenerationFailed,

    /// A stored nonce does not match the cipher's nonce size.
    #[error("nonce size mismatch: expected {expected}, got {actual}")]
    CryptoNonceSizeMismatch {
        /// The cipher's nonce size in bytes.
        expected: usize,
        /// The size of the offending nonce.
        actual: usize,
    },

    /// AEAD sealing failed.
    #[error("encryption failed")]
    CryptoEncryptionFailed,

    /// AEAD opening failed (wrong key, truncated or tampered ciphertext).
    #[error("decryption failed")]
    CryptoDecryptionFailed,

    /// Shamir reconstruction failed (too few or inconsistent shares).
    #[error("secret recovery failed")]
    CryptoRecoverFailed,

    /// The component was already initialized and refuses to re-initialize.
    #[error("already initialized")]
    StateAlreadyInitialized,

    /// A stored record violates a structural invariant.
    #[error("state integrity check failed: {0}")]
    StateIntegrityCheck(String),

    /// Closing the backing store failed.
    #[error("store close failed: {0}")]
    StoreCloseFailed(String),

    /// Opening a transaction failed.
    #[error("transaction begin failed: {0}")]
    TransactionBeginFailed(String),

    /// Committing a transaction failed.
    #[error("transaction commit failed: {0}")]
    TransactionCommitFailed(String),

    /// Rolling back a transaction failed.
    #[error("transaction rollback failed: {0}")]
    TransactionRollbackFailed(String),

    /// Creating a directory on the filesystem failed.
    #[error("directory creation failed: {0}")]
    FsDirectoryCreationFailed(String),

    /// Opening a file failed.
    #[error("file open failed: {0}")]
    FsFileOpenFailed(String),

    /// Closing (flushing) a file failed.
    #[error("file close failed: {0}")]
    FsFileCloseFailed(String),
}
