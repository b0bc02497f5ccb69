//! # Error Types
//!
//! Defines a structured error hierarchy for the backup engine using `thiserror`.
//! The hierarchy mirrors the taxonomy in the design spec: each kind maps to a
//! stable process exit code and, where well-defined, carries a remediation
//! line that the CLI prints alongside the banner/footer.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type encompassing all failure modes in the backup system.
#[derive(Error, Debug)]
pub enum ProxSaveError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    #[error("backup failed in phase '{phase}': {message}")]
    Backup {
        phase: Phase,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("storage error on target '{target}' during {op}: {message}")]
    Storage {
        target: String,
        op: String,
        message: String,
    },

    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// Interactive recipient setup was aborted before any recipient was added.
    /// The orchestrator treats this as a graceful exit, not a failure.
    #[error("encryption setup aborted")]
    EncryptionSetupAborted,

    #[error("restore aborted by user")]
    RestoreAborted,

    #[error("decrypt aborted by user")]
    DecryptAborted,

    #[error("another backup is already running (lock held at {0})")]
    LockBusy(PathBuf),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("internal panic: {0}")]
    InternalPanic(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pipeline stage identifiers, used both for `BackupError::Phase` and for
/// `EarlyErrorState`/`BackupStats::phase` reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Lock,
    Checks,
    Keys,
    Collect,
    Archive,
    Compress,
    Checksum,
    Manifest,
    Encrypt,
    Bundle,
    Replicate,
    Retain,
    Notify,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Lock => "lock",
            Phase::Checks => "checks",
            Phase::Keys => "keys",
            Phase::Collect => "collect",
            Phase::Archive => "archive",
            Phase::Compress => "compress",
            Phase::Checksum => "checksum",
            Phase::Manifest => "manifest",
            Phase::Encrypt => "encrypt",
            Phase::Bundle => "bundle",
            Phase::Replicate => "replicate",
            Phase::Retain => "retain",
            Phase::Notify => "notify",
        };
        write!(f, "{s}")
    }
}

impl ProxSaveError {
    /// Constructs a `Backup` error for a given phase with no underlying source.
    pub fn backup(phase: Phase, message: impl Into<String>) -> Self {
        ProxSaveError::Backup {
            phase,
            message: message.into(),
            source: None,
        }
    }

    /// Constructs a `Storage` error for a given target/operation pair.
    pub fn storage(target: impl Into<String>, op: impl Into<String>, message: impl Into<String>) -> Self {
        ProxSaveError::Storage {
            target: target.into(),
            op: op.into(),
            message: message.into(),
        }
    }

    /// Maps an error to the stable exit code contract (see spec §6).
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxSaveError::Config(_) => 2,
            ProxSaveError::Environment(_) => 3,
            ProxSaveError::Security(_) | ProxSaveError::Crypto(_) => 4,
            ProxSaveError::Backup { .. } | ProxSaveError::Storage { .. } => 5,
            ProxSaveError::InternalPanic(_) => 6,
            ProxSaveError::Cancelled => 130,
            // User-initiated aborts: 0 if no destructive work occurred, which is
            // always true for these sentinels (they fire before any write).
            ProxSaveError::EncryptionSetupAborted
            | ProxSaveError::RestoreAborted
            | ProxSaveError::DecryptAborted => 0,
            ProxSaveError::LockBusy(_) => 1,
            ProxSaveError::NetworkUnavailable(_) => 1,
            ProxSaveError::Io(_) | ProxSaveError::Other(_) => 1,
        }
    }

    /// A human-readable remediation suggestion, when one is well-defined.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            ProxSaveError::LockBusy(_) => {
                Some("another run is in progress; wait for it to finish or remove a stale lock file")
            }
            ProxSaveError::NetworkUnavailable(_) => {
                Some("network-dependent features were disabled for this run; check connectivity")
            }
            ProxSaveError::Storage { target, .. } if target == "cloud" => {
                Some("cloud unreachable: check rclone config")
            }
            ProxSaveError::Crypto(CryptoError::NoRecipients) => {
                Some("run with --newkey to configure an encryption recipient")
            }
            ProxSaveError::Security(SecurityError::IdentityMismatch) => {
                Some("this host's identity does not match the stored identity file; delete it to regenerate")
            }
            _ => None,
        }
    }

    /// Whether this error is a user-initiated abort sentinel.
    pub fn is_user_abort(&self) -> bool {
        matches!(
            self,
            ProxSaveError::EncryptionSetupAborted
                | ProxSaveError::RestoreAborted
                | ProxSaveError::DecryptAborted
        )
    }
}

/// Configuration parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found (searched: {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to parse config at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid config: {message}")]
    Validation { message: String },

    #[error("config file already exists: {0}")]
    AlreadyExists(PathBuf),
}

/// Host/process environment errors (missing binaries, unwritable paths, etc).
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("required binary not found on PATH: {0}")]
    MissingBinary(String),

    #[error("insufficient disk space on {path}: need {need_mb} MiB, have {have_mb} MiB")]
    InsufficientSpace {
        path: PathBuf,
        need_mb: u64,
        have_mb: u64,
    },

    #[error("directory does not exist or is not writable: {0}")]
    DirectoryUnusable(PathBuf),

    #[error("base directory is not set")]
    BaseDirUnset,
}

/// Host-identity and tamper-detection errors.
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("identity file is corrupted or tampered: {0}")]
    Tampered(String),

    #[error("identity does not belong to this host")]
    IdentityMismatch,

    #[error("identity file not found at {0}")]
    IdentityMissing(PathBuf),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("no encryption recipients configured")]
    NoRecipients,

    #[error("invalid age recipient: {0}")]
    InvalidRecipient(String),

    #[error("invalid age identity: {0}")]
    InvalidIdentity(String),

    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    #[error("key derivation failed")]
    KeyDerivation,
}

pub type Result<T> = std::result::Result<T, ProxSaveError>;
