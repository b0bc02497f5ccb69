//! Interactive recipient setup protocol.
//!
//! The engine never drives a prompt loop itself. Instead it exposes a
//! pull-based callback contract — `next_recipient()` — that an interactive
//! wizard collaborator implements (see design spec §9: this replaces any
//! callback-stack/event-loop pattern with a narrow, testable seam).

use super::recipients::{self, RecipientSource};
use crate::error::{ProxSaveError, Result};
use std::path::Path;

/// Implemented by the interactive collaborator (out of scope for the core —
/// see spec §1). The engine only depends on this trait.
pub trait RecipientProvider {
    /// Returns the next recipient to add, `Ok(None)` when setup is complete,
    /// or `Err(ProxSaveError::EncryptionSetupAborted)` if the user aborts.
    fn next_recipient(&mut self) -> Result<Option<RecipientSource>>;
}

/// A non-interactive provider that adds a single fixed recipient source.
/// Used by `--newkey <passphrase>`-style non-interactive invocations and by
/// tests.
pub struct FixedProvider {
    remaining: Vec<RecipientSource>,
}

impl FixedProvider {
    pub fn new(sources: Vec<RecipientSource>) -> Self {
        Self { remaining: sources }
    }
}

impl RecipientProvider for FixedProvider {
    fn next_recipient(&mut self) -> Result<Option<RecipientSource>> {
        if self.remaining.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.remaining.remove(0)))
        }
    }
}

/// Runs the setup protocol against a provider, deriving and deduplicating
/// recipients, and persisting the final set atomically. Nothing is written
/// to disk if the provider aborts before producing a complete set — partial
/// progress is never persisted.
pub fn run_setup(provider: &mut dyn RecipientProvider, recipient_file: &Path) -> Result<Vec<String>> {
    let mut existing = recipients::read_recipients(recipient_file)?;

    loop {
        match provider.next_recipient() {
            Ok(Some(source)) => {
                let recipient = recipients::derive_recipient(&source)?;
                recipients::add_recipient(&mut existing, recipient);
            }
            Ok(None) => break,
            Err(e) if e.is_user_abort() => return Err(ProxSaveError::EncryptionSetupAborted),
            Err(e) => return Err(e),
        }
    }

    if existing.is_empty() {
        return Err(ProxSaveError::EncryptionSetupAborted);
    }

    recipients::write_recipients(recipient_file, &existing)?;
    Ok(existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn setup_with_passphrase_persists_recipient() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recipient.txt");
        let mut provider = FixedProvider::new(vec![RecipientSource::Passphrase("abc123".into())]);
        let result = run_setup(&mut provider, &path).unwrap();
        assert_eq!(result.len(), 1);
        assert!(path.exists());
    }

    struct AbortingProvider;
    impl RecipientProvider for AbortingProvider {
        fn next_recipient(&mut self) -> Result<Option<RecipientSource>> {
            Err(ProxSaveError::EncryptionSetupAborted)
        }
    }

    #[test]
    fn aborted_setup_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recipient.txt");
        let mut provider = AbortingProvider;
        let result = run_setup(&mut provider, &path);
        assert!(matches!(result, Err(ProxSaveError::EncryptionSetupAborted)));
        assert!(!path.exists());
    }
}
