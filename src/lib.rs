//! # proxsave
//!
//! Operational backup tool for Proxmox VE/PBS hosts. The library surface
//! below is what the `proxsave` binary drives; it is also usable directly by
//! anything that wants to embed a backup run (tests, a daemon wrapper, etc).

pub mod checker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod notify;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;

pub use config::Config;
pub use error::{ProxSaveError, Result};
pub use identity::IdentityInfo;
pub use orchestrator::{run as run_backup, TargetStats};
pub use pipeline::BackupStats;
pub use storage::StorageTarget;
