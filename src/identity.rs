//! # Server Identity Store (C2)
//!
//! Derives and persists a stable 16-digit `ServerID` bound to machine-id,
//! hostname, and the host's MAC set, in a tamper-resistant file format.
//!
//! ## v2 file format
//!
//! ```text
//! # Format: proxsave-identity-v2
//! SYSTEM_CONFIG_DATA="<base64>"
//! ```
//!
//! The base64 payload decodes to `serverID:timestamp:keyField:checksumPrefix`
//! where `keyField` is a comma-separated set of `label=prefix8hex` entries
//! derived from `sha256(machine-id ‖ hostname[:8] ‖ salt)` for each of the
//! salts enumerated in the design spec (mac / mac_nohost / mac_altN / uuid /
//! uuid_nohost), and `checksumPrefix` is the first 8 hex chars of
//! `sha256(serverID:timestamp:keyField)`.

use crate::error::{Result, SecurityError};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const V2_HEADER: &str = "# Format: proxsave-identity-v2";
pub const V1_HEADER: &str = "# Format: proxsave-identity-v1";

/// Immutable record describing the host's identity, returned by decode/generate.
#[derive(Debug, Clone)]
pub struct IdentityInfo {
    pub server_id: String,
    pub primary_mac: String,
    pub observed_macs: Vec<String>,
    pub identity_file: PathBuf,
}

/// A single network interface as enumerated from `/sys/class/net`.
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub mac: String,
    pub is_wireless: bool,
    pub is_bridge: bool,
    pub is_vmbr: bool,
    pub is_permanent: bool,
}

/// Returns the identity file path for a given base directory.
///
/// Fails with `EnvironmentError::BaseDirUnset`-style behavior if `base_dir`
/// is empty — the core never silently falls back to `/tmp`.
pub fn identity_file_path(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.as_os_str().is_empty() {
        return Err(crate::error::EnvironmentError::BaseDirUnset.into());
    }
    Ok(base_dir.join("identity").join(".server_identity"))
}

/// Enumerates non-loopback network interfaces via `/sys/class/net`.
pub fn enumerate_interfaces() -> Vec<NetInterface> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir("/sys/class/net") else {
        return out;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" {
            continue;
        }
        let dir = entry.path();
        let mac = fs::read_to_string(dir.join("address"))
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if mac.is_empty() || mac == "00:00:00:00:00:00" {
            continue;
        }

        let is_wireless = dir.join("wireless").exists();
        let is_bridge = dir.join("bridge").exists();
        let is_vmbr = name.starts_with("vmbr");
        // address_assign_type == 0 means permanent (kernel/netlink convention).
        let is_permanent = fs::read_to_string(dir.join("address_assign_type"))
            .map(|s| s.trim() == "0")
            .unwrap_or(true);

        out.push(NetInterface {
            name,
            mac,
            is_wireless,
            is_bridge,
            is_vmbr,
            is_permanent,
        });
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Selects the preferred primary MAC from a set of interfaces.
///
/// Tie-break order: wired > vmbr bridge > other bridge > wireless > other;
/// within a category, permanent beats randomized; within that, lowest name
/// then lowest MAC wins.
pub fn select_primary(interfaces: &[NetInterface]) -> Option<&NetInterface> {
    fn category(i: &NetInterface) -> u8 {
        if i.is_vmbr {
            1
        } else if i.is_bridge {
            2
        } else if i.is_wireless {
            4
        } else if !i.is_bridge && !i.is_wireless && !i.is_vmbr {
            0 // plain wired
        } else {
            3
        }
    }

    interfaces.iter().min_by(|a, b| {
        category(a)
            .cmp(&category(b))
            .then(b.is_permanent.cmp(&a.is_permanent))
            .then(a.name.cmp(&b.name))
            .then(a.mac.cmp(&b.mac))
    })
}

fn machine_id() -> String {
    fs::read_to_string("/etc/machine-id")
        .or_else(|_| fs::read_to_string("/var/lib/dbus/machine-id"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Reads the short hostname from `/etc/hostname`, the same source used to
/// derive the identity's key field. Falls back to a fixed placeholder rather
/// than failing, since a missing hostname must never block a backup run.
pub fn hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn dmi_uuid() -> String {
    fs::read_to_string("/sys/class/dmi/id/product_uuid")
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn proc_version() -> String {
    fs::read_to_string("/proc/version").unwrap_or_default()
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hex::encode(hasher.finalize())
}

fn hostname_prefix8(hostname: &str) -> String {
    hostname.chars().take(8).collect()
}

/// Derives the labeled `label=prefix8hex` set for the current host, given a
/// primary MAC and the set of alternate MACs.
fn derive_key_field(machine_id: &str, hostname: &str, primary_mac: &str, alt_macs: &[String]) -> String {
    let host8 = hostname_prefix8(hostname);
    let uuid = dmi_uuid();

    let mut entries = Vec::new();

    let prefix = |salt: String| -> String {
        sha256_hex(&[machine_id.as_bytes(), host8.as_bytes(), salt.as_bytes()])[..8].to_string()
    };

    entries.push(format!("mac={}", prefix(format!("mac={primary_mac}"))));
    entries.push(format!(
        "mac_nohost={}",
        sha256_hex(&[machine_id.as_bytes(), format!("mac_nohost={primary_mac}").as_bytes()])[..8]
            .to_string()
    ));
    for (i, mac) in alt_macs.iter().enumerate() {
        entries.push(format!("mac_alt{}={}", i + 1, prefix(format!("mac_alt={mac}"))));
    }
    if !uuid.is_empty() {
        entries.push(format!("uuid={}", prefix(format!("uuid={uuid}"))));
        entries.push(format!(
            "uuid_nohost={}",
            sha256_hex(&[machine_id.as_bytes(), format!("uuid_nohost={uuid}").as_bytes()])[..8]
                .to_string()
        ));
    }

    entries.join(",")
}

/// Computes the current candidate labeled prefixes for membership testing
/// during decode: one prefix per (label, mac-or-uuid) combination currently
/// observable on this host.
fn current_candidate_prefixes(machine_id: &str, hostname: &str, interfaces: &[NetInterface]) -> Vec<(String, String)> {
    let host8 = hostname_prefix8(hostname);
    let uuid = dmi_uuid();
    let mut out = Vec::new();

    for iface in interfaces {
        let p = sha256_hex(&[
            machine_id.as_bytes(),
            host8.as_bytes(),
            format!("mac={}", iface.mac).as_bytes(),
        ])[..8]
            .to_string();
        out.push((iface.mac.clone(), p));

        let p_nohost = sha256_hex(&[
            machine_id.as_bytes(),
            format!("mac_nohost={}", iface.mac).as_bytes(),
        ])[..8]
            .to_string();
        out.push((iface.mac.clone(), p_nohost));

        let p_alt = sha256_hex(&[
            machine_id.as_bytes(),
            host8.as_bytes(),
            format!("mac_alt={}", iface.mac).as_bytes(),
        ])[..8]
            .to_string();
        out.push((iface.mac.clone(), p_alt));
    }

    if !uuid.is_empty() {
        let p = sha256_hex(&[
            machine_id.as_bytes(),
            host8.as_bytes(),
            format!("uuid={uuid}").as_bytes(),
        ])[..8]
            .to_string();
        out.push(("uuid".to_string(), p));

        let p_nohost = sha256_hex(&[
            machine_id.as_bytes(),
            format!("uuid_nohost={uuid}").as_bytes(),
        ])[..8]
            .to_string();
        out.push(("uuid".to_string(), p_nohost));
    }

    out
}

fn payload_checksum(server_id: &str, timestamp: &str, key_field: &str) -> String {
    sha256_hex(&[
        format!("{server_id}:{timestamp}:{key_field}").as_bytes(),
    ])[..8]
        .to_string()
}

/// Builds the v2 payload string (pre-base64) for a server ID and key field.
fn build_payload(server_id: &str, timestamp: &str, key_field: &str) -> String {
    let checksum = payload_checksum(server_id, timestamp, key_field);
    format!("{server_id}:{timestamp}:{key_field}:{checksum}")
}

/// Generates a brand-new 16-digit server ID from system identifiers.
fn generate_server_id(machine_id: &str, macs_joined: &str, hostname: &str, uuid: &str, timestamp: &str) -> String {
    let digest = sha256_hex(&[
        timestamp.as_bytes(),
        machine_id.as_bytes(),
        macs_joined.as_bytes(),
        hostname.as_bytes(),
        uuid.as_bytes(),
        proc_version().as_bytes(),
    ]);

    // Hex-decimalize: take the hex digest as a big number's worth of digits
    // by mapping each hex nibble into a decimal digit stream, then normalize
    // to exactly 16 digits.
    let mut digits = String::new();
    for ch in digest.chars() {
        let nibble = ch.to_digit(16).unwrap_or(0);
        digits.push_str(&(nibble % 10).to_string());
    }

    normalize_to_16_digits(&digits)
}

fn normalize_to_16_digits(digits: &str) -> String {
    if digits.len() >= 16 {
        digits[..16].to_string()
    } else {
        format!("{:0>16}", digits)
    }
}

/// Generates a fresh identity for this host and persists it at
/// `<base_dir>/identity/.server_identity`.
pub fn generate(base_dir: &Path) -> Result<IdentityInfo> {
    let path = identity_file_path(base_dir)?;
    let interfaces = enumerate_interfaces();
    let primary = select_primary(&interfaces)
        .map(|i| i.mac.clone())
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
    let alt_macs: Vec<String> = interfaces
        .iter()
        .map(|i| i.mac.clone())
        .filter(|m| m != &primary)
        .collect();

    let mid = machine_id();
    let host = hostname();
    let uuid = dmi_uuid();
    let macs_joined = interfaces
        .iter()
        .map(|i| i.mac.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let timestamp = now_timestamp();

    let server_id = generate_server_id(&mid, &macs_joined, &host, &uuid, &timestamp);
    let key_field = derive_key_field(&mid, &host, &primary, &alt_macs);
    let payload = build_payload(&server_id, &timestamp, &key_field);

    write_identity_file(&path, &payload, V2_HEADER)?;

    Ok(IdentityInfo {
        server_id,
        primary_mac: primary,
        observed_macs: interfaces.into_iter().map(|i| i.mac).collect(),
        identity_file: path,
    })
}

/// Loads the identity file, decoding and validating it against the current
/// host. Transparently upgrades a v1 file to v2 on successful decode.
pub fn load_or_generate(base_dir: &Path) -> Result<IdentityInfo> {
    let path = identity_file_path(base_dir)?;
    if !path.exists() {
        return generate(base_dir);
    }
    decode_file(&path)
}

/// Read-only counterpart to `load_or_generate`: decodes the identity file if
/// one exists, but never generates or persists one. Returns `Ok(None)` when
/// no identity file is present yet, so diagnostic callers (e.g. `--support`)
/// never have the side effect of minting a new identity.
pub fn decode(base_dir: &Path) -> Result<Option<IdentityInfo>> {
    let path = identity_file_path(base_dir)?;
    if !path.exists() {
        return Ok(None);
    }
    decode_file(&path).map(Some)
}

fn read_payload(content: &str) -> Result<(String, bool)> {
    let is_v1 = content.contains(V1_HEADER);
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SYSTEM_CONFIG_DATA=") {
            let quoted = rest.trim_matches('"');
            return Ok((quoted.to_string(), is_v1));
        }
    }
    Err(SecurityError::Tampered("missing SYSTEM_CONFIG_DATA line".into()).into())
}

fn decode_file(path: &Path) -> Result<IdentityInfo> {
    use base64::Engine as _;

    let content = std::fs::read_to_string(path)
        .map_err(|_| SecurityError::IdentityMissing(path.to_path_buf()))?;
    let (b64, is_v1) = read_payload(&content)?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(b64.as_bytes())
        .map_err(|e| SecurityError::Tampered(format!("invalid base64: {e}")))?;
    let payload = String::from_utf8(decoded)
        .map_err(|e| SecurityError::Tampered(format!("invalid utf8: {e}")))?;

    let parts: Vec<&str> = payload.splitn(4, ':').collect();
    if parts.len() != 4 {
        return Err(SecurityError::Tampered("malformed payload".into()).into());
    }
    let (server_id, timestamp, key_field, checksum) = (parts[0], parts[1], parts[2], parts[3]);

    if server_id.len() != 16 || !server_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(SecurityError::Tampered("server ID is not 16 ASCII digits".into()).into());
    }

    let expected = payload_checksum(server_id, timestamp, key_field);
    if expected != checksum {
        return Err(SecurityError::Tampered("checksum mismatch".into()).into());
    }

    let mid = machine_id();
    let host = hostname();
    let interfaces = enumerate_interfaces();

    let matched_mac = if is_v1 {
        // v1: key_field is a single unlabeled 8-hex prefix derived from
        // machine-id + hostname[:8] + the primary MAC only.
        let host8 = hostname_prefix8(&host);
        interfaces.iter().find(|i| {
            let p = sha256_hex(&[
                mid.as_bytes(),
                host8.as_bytes(),
                format!("mac={}", i.mac).as_bytes(),
            ])[..8]
                .to_string();
            p == key_field
        })
    } else {
        let candidates = current_candidate_prefixes(&mid, &host, &interfaces);
        let label_prefixes: Vec<&str> = key_field
            .split(',')
            .filter_map(|e| e.split('=').nth(1))
            .collect();

        candidates
            .iter()
            .find(|(_, p)| label_prefixes.contains(&p.as_str()))
            .and_then(|(mac, _)| interfaces.iter().find(|i| &i.mac == mac))
    };

    let matched = matched_mac.ok_or(SecurityError::IdentityMismatch)?;

    let info = IdentityInfo {
        server_id: server_id.to_string(),
        primary_mac: matched.mac.clone(),
        observed_macs: interfaces.iter().map(|i| i.mac.clone()).collect(),
        identity_file: path.to_path_buf(),
    };

    if is_v1 {
        upgrade_to_v2(path, &info, &mid, &host)?;
    }

    Ok(info)
}

/// Rewrites a decoded v1 identity as v2, adding alternate-MAC and UUID
/// labels so future runs survive NIC changes.
fn upgrade_to_v2(path: &Path, info: &IdentityInfo, machine_id: &str, hostname: &str) -> Result<()> {
    let alt_macs: Vec<String> = info
        .observed_macs
        .iter()
        .filter(|m| *m != &info.primary_mac)
        .cloned()
        .collect();

    let timestamp = now_timestamp();
    let key_field = derive_key_field(machine_id, hostname, &info.primary_mac, &alt_macs);
    let payload = build_payload(&info.server_id, &timestamp, &key_field);
    write_identity_file(path, &payload, V2_HEADER)
}

fn write_identity_file(path: &Path, payload: &str, header: &str) -> Result<()> {
    use base64::Engine as _;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let b64 = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
    let content = format!("{header}\nSYSTEM_CONFIG_DATA=\"{b64}\"\n");

    crate::config::atomic_write(path, content.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    set_immutable_best_effort(path);

    Ok(())
}

/// Sets the Linux immutable attribute on the identity file, best-effort.
/// Absence of `chattr` or insufficient privilege is silently ignored.
fn set_immutable_best_effort(path: &Path) {
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("chattr")
            .arg("+i")
            .arg(path)
            .output();
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
    }
}

fn now_timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

// ─── Test-only encode/decode helpers ─────────────────────────────────────
//
// The production path always reads live system sources (/etc/machine-id,
// /sys/class/net, ...), which aren't controllable in unit tests. These
// helpers expose the same payload/checksum/candidate-matching logic against
// caller-supplied inputs so the round-trip and tamper-resistance properties
// can be verified deterministically.
#[cfg(test)]
pub mod testing {
    use super::*;

    pub fn encode_v2(
        server_id: &str,
        machine_id: &str,
        hostname: &str,
        primary_mac: &str,
        alt_macs: &[String],
    ) -> String {
        let timestamp = "1700000000";
        let key_field = derive_key_field(machine_id, hostname, primary_mac, alt_macs);
        let payload = build_payload(server_id, timestamp, &key_field);
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
        format!("{V2_HEADER}\nSYSTEM_CONFIG_DATA=\"{b64}\"\n")
    }

    pub fn decode_v2_str(
        content: &str,
        machine_id: &str,
        hostname: &str,
        interfaces: &[NetInterface],
    ) -> Result<(String, String)> {
        use base64::Engine as _;
        let (b64, _) = read_payload(content)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64.as_bytes())
            .map_err(|e| SecurityError::Tampered(format!("invalid base64: {e}")))?;
        let payload = String::from_utf8(decoded)
            .map_err(|e| SecurityError::Tampered(format!("invalid utf8: {e}")))?;
        let parts: Vec<&str> = payload.splitn(4, ':').collect();
        if parts.len() != 4 {
            return Err(SecurityError::Tampered("malformed payload".into()).into());
        }
        let (server_id, _timestamp, key_field, checksum) = (parts[0], parts[1], parts[2], parts[3]);

        if server_id.len() != 16 || !server_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(SecurityError::Tampered("server ID is not 16 ASCII digits".into()).into());
        }
        let expected = payload_checksum(server_id, parts[1], key_field);
        if expected != checksum {
            return Err(SecurityError::Tampered("checksum mismatch".into()).into());
        }

        let candidates = current_candidate_prefixes(machine_id, hostname, interfaces);
        let label_prefixes: Vec<&str> = key_field
            .split(',')
            .filter_map(|e| e.split('=').nth(1))
            .collect();
        let matched = candidates
            .iter()
            .find(|(_, p)| label_prefixes.contains(&p.as_str()))
            .ok_or(SecurityError::IdentityMismatch)?;

        Ok((server_id.to_string(), matched.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn iface(mac: &str) -> NetInterface {
        NetInterface {
            name: "eth0".to_string(),
            mac: mac.to_string(),
            is_wireless: false,
            is_bridge: false,
            is_vmbr: false,
            is_permanent: true,
        }
    }

    #[test]
    fn round_trip_decodes_with_primary_mac() {
        let mid = "machine-abc";
        let host = "hostname1";
        let primary = "aa:bb:cc:dd:ee:01";
        let content = encode_v2("1234567890123456", mid, host, primary, &[]);

        let interfaces = vec![iface(primary)];
        let (server_id, matched) = decode_v2_str(&content, mid, host, &interfaces).unwrap();
        assert_eq!(server_id, "1234567890123456");
        assert_eq!(matched, primary);
    }

    #[test]
    fn decodes_after_primary_mac_rotation_to_alternate() {
        let mid = "machine-abc";
        let host = "hostname1";
        let primary = "aa:bb:cc:dd:ee:01";
        let alt = "aa:bb:cc:dd:ee:02".to_string();
        let content = encode_v2("1234567890123456", mid, host, primary, std::slice::from_ref(&alt));

        // Host now only has the alternate MAC (primary NIC removed).
        let interfaces = vec![iface(&alt)];
        let (server_id, matched) = decode_v2_str(&content, mid, host, &interfaces).unwrap();
        assert_eq!(server_id, "1234567890123456");
        assert_eq!(matched, alt);
    }

    #[test]
    fn fails_when_machine_id_and_all_macs_differ() {
        let content = encode_v2(
            "1234567890123456",
            "machine-abc",
            "hostname1",
            "aa:bb:cc:dd:ee:01",
            &[],
        );
        let interfaces = vec![iface("ff:ff:ff:ff:ff:ff")];
        let result = decode_v2_str(&content, "different-machine", "hostname1", &interfaces);
        assert!(result.is_err());
    }

    #[test]
    fn single_byte_tamper_breaks_decode() {
        let content = encode_v2(
            "1234567890123456",
            "machine-abc",
            "hostname1",
            "aa:bb:cc:dd:ee:01",
            &[],
        );
        let mut bytes = content.into_bytes();
        // Flip a bit inside the base64 payload.
        let idx = bytes
            .iter()
            .position(|&b| b == b'"')
            .map(|i| i + 5)
            .unwrap();
        bytes[idx] ^= 0x01;
        let tampered = String::from_utf8_lossy(&bytes).to_string();

        let interfaces = vec![iface("aa:bb:cc:dd:ee:01")];
        let result = decode_v2_str(&tampered, "machine-abc", "hostname1", &interfaces);
        assert!(result.is_err());
    }

    #[test]
    fn primary_selection_prefers_wired_over_wireless() {
        let wired = NetInterface {
            is_wireless: false,
            ..iface("aa:aa:aa:aa:aa:01")
        };
        let wireless = NetInterface {
            is_wireless: true,
            ..iface("bb:bb:bb:bb:bb:01")
        };
        let chosen = select_primary(&[wireless, wired.clone()]).unwrap();
        assert_eq!(chosen.mac, wired.mac);
    }

    #[test]
    fn normalize_pads_short_digit_strings() {
        assert_eq!(normalize_to_16_digits("123"), "0000000000000123");
        assert_eq!(normalize_to_16_digits(&"9".repeat(20))[..16].len(), 16);
    }
}
