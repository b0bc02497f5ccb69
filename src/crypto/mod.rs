//! # Encryption Engine (C5)
//!
//! Manages the age recipient file, encrypts archive streams against the
//! full recipient set, and exposes the deterministic passphrase→recipient
//! derivation and pull-based setup protocol as submodules.

pub mod kdf;
pub mod recipients;
pub mod setup;

use crate::error::{CryptoError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Encrypts `input_path` to `<input_path>.age` using every recipient in
/// `recipient_strs`. Confirms the output is non-empty after writing.
pub fn encrypt_file(input_path: &Path, output_path: &Path, recipient_strs: &[String]) -> Result<()> {
    if recipient_strs.is_empty() {
        return Err(CryptoError::NoRecipients.into());
    }

    let mut boxed_recipients: Vec<Box<dyn age::Recipient + Send>> = Vec::new();
    for r in recipient_strs {
        let recipient = age::x25519::Recipient::from_str(r)
            .map_err(|e| CryptoError::InvalidRecipient(format!("{r}: {e}")))?;
        boxed_recipients.push(Box::new(recipient));
    }

    let encryptor = age::Encryptor::with_recipients(boxed_recipients)
        .ok_or(CryptoError::NoRecipients)?;

    let mut input = File::open(input_path)?;
    let output = File::create(output_path)?;
    let mut writer = encryptor
        .wrap_output(output)
        .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;
    }
    writer
        .finish()
        .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;

    let out_meta = std::fs::metadata(output_path)?;
    if out_meta.len() == 0 {
        return Err(CryptoError::EncryptFailed("encrypted output is empty".into()).into());
    }

    Ok(())
}

/// Decrypts `input_path` using one of the supplied age identities. Used by
/// the (out-of-scope) restore/decrypt CLI paths and by tests validating the
/// encrypt/decrypt contract.
pub fn decrypt_file(input_path: &Path, output_path: &Path, identity_strs: &[String]) -> Result<()> {
    let identities: Vec<age::x25519::Identity> = identity_strs
        .iter()
        .map(|s| {
            age::x25519::Identity::from_str(s)
                .map_err(|e| CryptoError::InvalidIdentity(format!("{e}")))
        })
        .collect::<std::result::Result<_, _>>()?;

    let input = File::open(input_path)?;
    let decryptor = match age::Decryptor::new(input)
        .map_err(|e| CryptoError::DecryptFailed(e.to_string()))?
    {
        age::Decryptor::Recipients(d) => d,
        _ => return Err(CryptoError::DecryptFailed("not a recipients-encrypted file".into()).into()),
    };

    let identity_refs: Vec<&dyn age::Identity> = identities
        .iter()
        .map(|i| i as &dyn age::Identity)
        .collect();

    let mut reader = decryptor
        .decrypt(identity_refs.into_iter())
        .map_err(|e| CryptoError::DecryptFailed(e.to_string()))?;

    let mut output = File::create(output_path)?;
    std::io::copy(&mut reader, &mut output).map_err(|e| CryptoError::DecryptFailed(e.to_string()))?;
    Ok(())
}

/// Removes a plaintext file after successful encryption.
///
/// Overwrite-and-unlink ("shred") is used only when the underlying
/// filesystem is neither a network filesystem nor copy-on-write (per
/// `DetectFilesystem`); otherwise a plain unlink is used, since overwriting
/// in place on COW/network filesystems does not reliably destroy old
/// extents/replicas.
pub fn remove_plaintext(path: &Path, supports_shred: bool) -> Result<()> {
    if supports_shred {
        if let Ok(meta) = std::fs::metadata(path) {
            let len = meta.len();
            if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open(path) {
                let zeros = vec![0u8; 64 * 1024];
                let mut remaining = len;
                while remaining > 0 {
                    let chunk = remaining.min(zeros.len() as u64) as usize;
                    let _ = f.write_all(&zeros[..chunk]);
                    remaining -= chunk as u64;
                }
                let _ = f.sync_all();
            }
        }
    }
    std::fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::recipients::RecipientSource;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let dir = tempdir().unwrap();
        let plaintext_path = dir.path().join("archive.tar");
        std::fs::write(&plaintext_path, b"hello encrypted world").unwrap();

        let scalar = kdf::derive_x25519_scalar("round-trip-pass").unwrap();
        let identity = recipients::scalar_to_identity(&scalar).unwrap();
        let recipient = identity.to_public().to_string();
        let identity_str = recipient_identity_string(&scalar);

        let encrypted_path = dir.path().join("archive.tar.age");
        encrypt_file(&plaintext_path, &encrypted_path, &[recipient]).unwrap();
        assert!(std::fs::metadata(&encrypted_path).unwrap().len() > 0);

        let decrypted_path = dir.path().join("archive.tar.decrypted");
        decrypt_file(&encrypted_path, &decrypted_path, &[identity_str]).unwrap();

        let original = std::fs::read(&plaintext_path).unwrap();
        let round_tripped = std::fs::read(&decrypted_path).unwrap();
        assert_eq!(original, round_tripped);
    }

    #[test]
    fn empty_recipients_rejected() {
        let dir = tempdir().unwrap();
        let plaintext_path = dir.path().join("archive.tar");
        std::fs::write(&plaintext_path, b"data").unwrap();
        let out = dir.path().join("archive.tar.age");
        let result = encrypt_file(&plaintext_path, &out, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn remove_plaintext_unlinks_without_shred() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tar");
        std::fs::write(&path, b"secret data").unwrap();
        remove_plaintext(&path, false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_plaintext_shreds_then_unlinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tar");
        std::fs::write(&path, b"secret data").unwrap();
        remove_plaintext(&path, true).unwrap();
        assert!(!path.exists());
    }

    fn recipient_identity_string(scalar: &[u8; 32]) -> String {
        // Re-derive the bech32 identity string the same way
        // `scalar_to_identity` does internally, for round-trip testing.
        use bech32::ToBase32;
        let encoded =
            bech32::encode("age-secret-key-", scalar.to_base32(), bech32::Variant::Bech32).unwrap();
        encoded.to_uppercase()
    }

    #[test]
    fn setup_then_encrypt_end_to_end() {
        let dir = tempdir().unwrap();
        let recipient_file = dir.path().join("recipient.txt");
        let mut provider =
            setup::FixedProvider::new(vec![RecipientSource::Passphrase("e2e-pass".into())]);
        let recipients_set = setup::run_setup(&mut provider, &recipient_file).unwrap();

        let plaintext_path = dir.path().join("archive.tar");
        std::fs::write(&plaintext_path, b"end to end").unwrap();
        let encrypted_path = dir.path().join("archive.tar.age");
        encrypt_file(&plaintext_path, &encrypted_path, &recipients_set).unwrap();
        assert!(encrypted_path.exists());
    }
}
