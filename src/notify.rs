//! # Notifier Contract
//!
//! The concrete transports (email relay, Telegram, Gotify, webhooks) are
//! out of scope for the core; they are plug-in channels invoked through this
//! single contract. Dispatch is best-effort and concurrent — a slow or
//! failing channel never blocks another (§4.7, §5).

use crate::error::Result;
use crate::pipeline::BackupStats;
use std::sync::Arc;

/// One notification channel. Implementations must be safe to call from a
/// detached worker thread per dispatch.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, stats: &BackupStats) -> Result<()>;
}

/// Discards every notification; used when no channel is configured.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn name(&self) -> &str {
        "null"
    }

    fn notify(&self, _stats: &BackupStats) -> Result<()> {
        Ok(())
    }
}

/// Emits a single structured `tracing` event per run; useful as a
/// zero-configuration default and in tests that exercise the dispatch path
/// without a real transport.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, stats: &BackupStats) -> Result<()> {
        tracing::info!(
            host = %stats.host,
            exit_code = stats.exit_code,
            files_collected = stats.files_collected,
            files_failed = stats.files_failed,
            encrypted = stats.encrypted,
            "backup run completed"
        );
        Ok(())
    }
}

/// Builds the notifier set enabled in config. Concrete transports are not
/// implemented here (§1); an enabled channel with no built-in transport logs
/// a warning so the gap is visible instead of silently dropping the intent.
pub fn build_notifiers(config: &crate::config::Config) -> Vec<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];

    for (flag, label) in [
        ("NOTIFY_EMAIL_ENABLED", "email"),
        ("NOTIFY_TELEGRAM_ENABLED", "telegram"),
        ("NOTIFY_GOTIFY_ENABLED", "gotify"),
        ("NOTIFY_WEBHOOK_ENABLED", "webhook"),
    ] {
        if config.get_bool(flag, false) {
            tracing::warn!(channel = label, "notification channel enabled in config but no transport is wired into this build");
        }
    }

    notifiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Phase;
    use crate::error::ProxSaveError;

    #[test]
    fn null_notifier_always_succeeds() {
        let stats = BackupStats::early_error("host1", Phase::Checks, &ProxSaveError::Cancelled);
        assert!(NullNotifier.notify(&stats).is_ok());
    }

    #[test]
    fn log_notifier_always_succeeds() {
        let stats = BackupStats::new("host1");
        assert!(LogNotifier.notify(&stats).is_ok());
    }
}
