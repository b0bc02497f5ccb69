//! Age recipient-file management.
//!
//! The engine reads a plaintext `recipient.txt` under
//! `<base_dir>/identity/age/`. Each non-empty, non-comment line is one age
//! X25519 recipient. Encryption always uses the full deduplicated set — any
//! matching private key can decrypt.

use super::kdf;
use crate::error::{CryptoError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The three ways a caller can hand the engine a new recipient (§4.5).
pub enum RecipientSource {
    ExistingPublicKey(String),
    Passphrase(String),
    PrivateKey(String),
}

/// Returns the default recipient-file path under a base directory.
pub fn default_recipient_file(base_dir: &Path) -> PathBuf {
    base_dir.join("identity").join("age").join("recipient.txt")
}

/// Reads the deduplicated, order-preserving set of recipients from a file.
/// A missing file yields an empty set (not an error) — the caller decides
/// whether an empty set requires the setup protocol.
pub fn read_recipients(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if seen.insert(line.to_string()) {
            out.push(line.to_string());
        }
    }
    Ok(out)
}

/// Writes the recipient set atomically with mode 0600.
pub fn write_recipients(path: &Path, recipients: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::from("# ProxSave age recipients — one per line\n");
    for r in recipients {
        content.push_str(r);
        content.push('\n');
    }
    crate::config::atomic_write(path, content.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    Ok(())
}

/// Validates an age X25519 recipient string of the form `age1...`.
pub fn validate_recipient_str(s: &str) -> Result<String> {
    age::x25519::Recipient::from_str(s)
        .map(|r| r.to_string())
        .map_err(|e| CryptoError::InvalidRecipient(format!("{s}: {e}")).into())
}

/// Derives the age recipient string for one `RecipientSource`, per the
/// three variants in §4.5.
pub fn derive_recipient(source: &RecipientSource) -> Result<String> {
    match source {
        RecipientSource::ExistingPublicKey(s) => validate_recipient_str(s),

        RecipientSource::Passphrase(pass) => {
            let scalar = kdf::derive_x25519_scalar(pass)?;
            let identity = scalar_to_identity(&scalar)?;
            Ok(identity.to_public().to_string())
        }

        RecipientSource::PrivateKey(s) => {
            let identity = age::x25519::Identity::from_str(s)
                .map_err(|e| CryptoError::InvalidIdentity(format!("{e}")))?;
            Ok(identity.to_public().to_string())
        }
    }
}

/// Encodes a raw 32-byte X25519 scalar as an age identity string (bech32,
/// HRP `age-secret-key-`, displayed uppercase per age's convention) and
/// parses it back through age's own identity parser. This avoids reaching
/// into age's private constructors while still producing a deterministic
/// identity from raw key material.
pub fn scalar_to_identity(scalar: &[u8; 32]) -> Result<age::x25519::Identity> {
    use bech32::ToBase32;

    let encoded = bech32::encode("age-secret-key-", scalar.to_base32(), bech32::Variant::Bech32)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let identity_str = encoded.to_uppercase();

    age::x25519::Identity::from_str(&identity_str)
        .map_err(|e| CryptoError::InvalidIdentity(format!("{e}")).into())
}

/// Adds one recipient to the existing set, deduplicating, and returns the
/// updated set (does not write to disk).
pub fn add_recipient(existing: &mut Vec<String>, recipient: String) {
    if !existing.contains(&recipient) {
        existing.push(recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let a = derive_recipient(&RecipientSource::Passphrase("hunter2-hunter2".into())).unwrap();
        let b = derive_recipient(&RecipientSource::Passphrase("hunter2-hunter2".into())).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("age1"));
    }

    #[test]
    fn different_passphrases_yield_different_recipients() {
        let a = derive_recipient(&RecipientSource::Passphrase("alpha".into())).unwrap();
        let b = derive_recipient(&RecipientSource::Passphrase("beta".into())).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_public_key_rejected() {
        let result = derive_recipient(&RecipientSource::ExistingPublicKey("not-a-key".into()));
        assert!(result.is_err());
    }

    #[test]
    fn read_write_round_trip_dedups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recipient.txt");
        let recipient = derive_recipient(&RecipientSource::Passphrase("abc".into())).unwrap();
        write_recipients(&path, &[recipient.clone(), recipient.clone()]).unwrap();
        let read_back = read_recipients(&path).unwrap();
        assert_eq!(read_back, vec![recipient]);
    }

    #[test]
    fn missing_file_yields_empty_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        assert!(read_recipients(&path).unwrap().is_empty());
    }
}
