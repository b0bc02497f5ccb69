//! # Configuration Model (C1)
//!
//! Parses and validates the `backup.env` `KEY=VALUE` environment file, and
//! reconciles a user's file against the embedded template on upgrade.
//!
//! ## File format
//!
//! Lines are one of: blank, a comment starting with `#`, or `KEY=VALUE`.
//! Values may be bare or double-quoted; a trailing `# comment` on a value
//! line is preserved verbatim when the file is rewritten. Order is
//! preserved on read and on upgrade (template order for template keys,
//! then any custom keys at the tail, in their original order).

use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::{fs, io};

/// One parsed line: either a structured `KEY=VALUE` entry or passthrough text
/// (blank line or comment) that must round-trip byte-for-byte on rewrite.
#[derive(Debug, Clone)]
enum Line {
    Entry {
        key: String,
        value: String,
        quoted: bool,
        trailing_comment: Option<String>,
    },
    Passthrough(String),
}

/// An ordered, typed view over a parsed `backup.env` file.
#[derive(Debug, Clone)]
pub struct Config {
    lines: Vec<Line>,
    values: BTreeMap<String, String>,
    pub path: PathBuf,
}

/// Supported compression backends (`COMPRESSION_TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    Zstd,
    Gzip,
    Xz,
    None,
}

impl CompressionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Some(Self::Zstd),
            "gzip" => Some(Self::Gzip),
            "xz" => Some(Self::Xz),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::None => "none",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zstd => "tar.zst",
            Self::Gzip => "tar.gz",
            Self::Xz => "tar.xz",
            Self::None => "tar",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `POLICY` retention kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicyKind {
    Simple,
    Gfs,
}

/// A GFS retention schedule: negative one means unbounded for that bucket.
#[derive(Debug, Clone, Copy)]
pub struct GfsCounts {
    pub daily: i64,
    pub weekly: i64,
    pub monthly: i64,
    pub yearly: i64,
}

/// The embedded default template: (key, default value, optional comment).
/// Order here is the canonical template order used during upgrade-merge.
fn template() -> Vec<(&'static str, &'static str, Option<&'static str>)> {
    vec![
        ("BACKUP_PATH", "/var/backups/proxsave/primary", Some("Primary local backup directory")),
        ("LOG_PATH", "/var/log/proxsave", None),
        ("SECONDARY_ENABLED", "false", Some("Enable the secondary (local/NFS) storage tier")),
        ("SECONDARY_PATH", "", None),
        ("SECONDARY_LOG_PATH", "", None),
        ("CLOUD_ENABLED", "false", Some("Enable the cloud storage tier via rclone")),
        ("CLOUD_REMOTE", "", Some("rclone remote, e.g. myremote:bucket/path")),
        ("CLOUD_LOG_PATH", "", None),
        ("LOCK_PATH", "/var/run/proxsave", None),
        ("BASE_DIR", "/var/lib/proxsave", None),
        ("ADDITIONAL_BACKUP_PATHS", "", Some("comma-separated extra paths to include in Collect")),
        ("EXCLUDE_PATTERNS", "", Some("comma-separated glob patterns excluded from Collect")),
        ("COMPRESSION_TYPE", "zstd", Some("zstd, gzip, xz, or none")),
        ("COMPRESSION_LEVEL", "3", Some("1-22 for zstd, compressor-specific range otherwise")),
        ("COMPRESSION_MODE", "balanced", Some("fast, balanced, or best")),
        ("COMPRESSION_THREADS", "1", None),
        ("CHUNKING_ENABLED", "false", None),
        ("DEDUP_ENABLED", "false", Some("Deduplicate identical file content within one archive")),
        ("PREFILTER_ENABLED", "false", None),
        ("PREFILTER_MAX_FILE_SIZE_MB", "1024", None),
        ("RETENTION_POLICY", "simple", Some("simple or gfs")),
        ("RETENTION_SIMPLE_KEEP", "7", None),
        ("RETENTION_GFS_DAILY", "7", None),
        ("RETENTION_GFS_WEEKLY", "4", None),
        ("RETENTION_GFS_MONTHLY", "6", None),
        ("RETENTION_GFS_YEARLY", "2", None),
        ("ENCRYPT_ARCHIVE", "false", None),
        ("AGE_RECIPIENT_FILE", "", Some("defaults under BASE_DIR/identity/age/recipient.txt")),
        ("KEEP_PLAINTEXT_ARCHIVE", "false", None),
        ("NOTIFY_EMAIL_ENABLED", "false", None),
        ("NOTIFY_EMAIL_TO", "", None),
        ("EMAIL_FALLBACK_SENDMAIL", "true", None),
        ("NOTIFY_TELEGRAM_ENABLED", "false", None),
        ("NOTIFY_TELEGRAM_TOKEN", "", None),
        ("NOTIFY_TELEGRAM_CHAT_ID", "", None),
        ("NOTIFY_GOTIFY_ENABLED", "false", None),
        ("NOTIFY_GOTIFY_URL", "", None),
        ("NOTIFY_GOTIFY_TOKEN", "", None),
        ("NOTIFY_WEBHOOK_ENABLED", "false", None),
        ("NOTIFY_WEBHOOK_URL", "", None),
        ("DRY_RUN", "false", None),
        ("SET_BACKUP_PERMISSIONS", "true", None),
        ("PROFILING_ENABLED", "false", None),
        ("DISABLE_NETWORK_PREFLIGHT", "false", None),
        ("MIN_DISK_PRIMARY_GB", "5", None),
        ("MIN_DISK_SECONDARY_GB", "5", None),
        ("MIN_DISK_CLOUD_GB", "1", None),
    ]
}

/// Result of planning an upgrade without writing anything.
#[derive(Debug, Default)]
pub struct UpgradePlan {
    pub missing_keys: Vec<String>,
    pub extra_keys: Vec<String>,
    pub preserved_values: Vec<String>,
    pub changed: bool,
}

impl Config {
    /// Loads and validates a config file from a specific path.
    pub fn load(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProxSaveErrorIoContext(path, e).into_err())?;
        let cfg = Self::parse(path, &content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(path: &Path, content: &str) -> Result<Config> {
        let mut lines = Vec::new();
        let mut values = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let trimmed = raw.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(Line::Passthrough(raw.to_string()));
                continue;
            }

            let eq = trimmed.find('=').ok_or_else(|| {
                ConfigError::Parse {
                    line: idx + 1,
                    message: format!("expected KEY=VALUE, got: {trimmed}"),
                }
            })?;

            let key = trimmed[..eq].trim().to_string();
            let rest = trimmed[eq + 1..].trim();

            let (value, quoted, trailing_comment) = split_value_and_comment(rest);

            values.insert(key.clone(), value.clone());
            lines.push(Line::Entry {
                key,
                value,
                quoted,
                trailing_comment,
            });
        }

        Ok(Config {
            lines,
            values,
            path: path.to_path_buf(),
        })
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.secondary_enabled() && self.get("SECONDARY_PATH").unwrap_or_default().is_empty() {
            return Err(ConfigError::Validation {
                message: "SECONDARY_ENABLED=true requires a non-empty SECONDARY_PATH".into(),
            });
        }
        if self.cloud_enabled() && self.get("CLOUD_REMOTE").unwrap_or_default().is_empty() {
            return Err(ConfigError::Validation {
                message: "CLOUD_ENABLED=true requires a non-empty CLOUD_REMOTE".into(),
            });
        }
        if self.get("BACKUP_PATH").unwrap_or_default().is_empty() {
            return Err(ConfigError::Validation {
                message: "BACKUP_PATH must be non-empty".into(),
            });
        }

        let level = self.compression_level();
        if !(1..=22).contains(&level) {
            return Err(ConfigError::Validation {
                message: format!("COMPRESSION_LEVEL must be between 1 and 22, got {level}"),
            });
        }

        match self.compression_type() {
            Some(_) => {}
            None => {
                return Err(ConfigError::Validation {
                    message: format!(
                        "COMPRESSION_TYPE must be one of zstd, gzip, xz, none, got '{}'",
                        self.get("COMPRESSION_TYPE").unwrap_or_default()
                    ),
                });
            }
        }

        Ok(())
    }

    /// Raw string accessor.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|s| !s.is_empty()).map(PathBuf::from)
    }

    /// Overrides a value in memory only, without touching the file on disk.
    /// Used by the CLI to apply flags such as `--dry-run` that take priority
    /// over whatever the config file says for the duration of one run.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn secondary_enabled(&self) -> bool {
        self.get_bool("SECONDARY_ENABLED", false)
    }

    pub fn cloud_enabled(&self) -> bool {
        self.get_bool("CLOUD_ENABLED", false)
    }

    pub fn encrypt_archive(&self) -> bool {
        self.get_bool("ENCRYPT_ARCHIVE", false)
    }

    pub fn keep_plaintext_archive(&self) -> bool {
        self.get_bool("KEEP_PLAINTEXT_ARCHIVE", false)
    }

    pub fn dry_run(&self) -> bool {
        self.get_bool("DRY_RUN", false)
    }

    pub fn disable_network_preflight(&self) -> bool {
        self.get_bool("DISABLE_NETWORK_PREFLIGHT", false)
    }

    pub fn compression_type(&self) -> Option<CompressionType> {
        CompressionType::parse(&self.get("COMPRESSION_TYPE").unwrap_or_else(|| "zstd".into()))
    }

    pub fn compression_level(&self) -> i64 {
        self.get_i64("COMPRESSION_LEVEL", 3)
    }

    pub fn compression_threads(&self) -> u64 {
        self.get_u64("COMPRESSION_THREADS", 1)
    }

    pub fn retention_policy(&self) -> RetentionPolicyKind {
        match self.get("RETENTION_POLICY").as_deref() {
            Some("gfs") => RetentionPolicyKind::Gfs,
            _ => RetentionPolicyKind::Simple,
        }
    }

    pub fn retention_simple_keep(&self) -> usize {
        self.get_i64("RETENTION_SIMPLE_KEEP", 7).max(0) as usize
    }

    pub fn retention_gfs(&self) -> GfsCounts {
        GfsCounts {
            daily: self.get_i64("RETENTION_GFS_DAILY", 7),
            weekly: self.get_i64("RETENTION_GFS_WEEKLY", 4),
            monthly: self.get_i64("RETENTION_GFS_MONTHLY", 6),
            yearly: self.get_i64("RETENTION_GFS_YEARLY", 2),
        }
    }

    pub fn base_dir(&self) -> Option<PathBuf> {
        self.get_path("BASE_DIR")
    }

    pub fn prefilter_max_file_size_mb(&self) -> u64 {
        self.get_u64("PREFILTER_MAX_FILE_SIZE_MB", 1024)
    }

    pub fn prefilter_enabled(&self) -> bool {
        self.get_bool("PREFILTER_ENABLED", false)
    }

    pub fn dedup_enabled(&self) -> bool {
        self.get_bool("DEDUP_ENABLED", false)
    }

    pub fn additional_backup_paths(&self) -> Vec<PathBuf> {
        self.get("ADDITIONAL_BACKUP_PATHS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    pub fn exclude_patterns(&self) -> Vec<String> {
        self.get("EXCLUDE_PATTERNS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Resolves the cloud log path per the §9 open-question resolution:
    /// a path containing `:` is a standalone rclone target; otherwise it is
    /// interpreted relative to `CLOUD_REMOTE`.
    pub fn resolve_cloud_log_path(&self) -> Option<String> {
        let raw = self.get("CLOUD_LOG_PATH").filter(|s| !s.is_empty())?;
        if raw.contains(':') {
            Some(raw)
        } else {
            let remote = self.get("CLOUD_REMOTE")?;
            let remote = remote.trim_end_matches('/');
            Some(format!("{remote}/{raw}"))
        }
    }

    /// Plans an upgrade against the embedded template without writing.
    pub fn plan_upgrade(path: &Path) -> Result<UpgradePlan> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProxSaveErrorIoContext(path, e).into_err())?;
        let current = Self::parse(path, &content)?;
        let mut plan = UpgradePlan::default();

        let template_keys: Vec<&str> = template().iter().map(|(k, _, _)| *k).collect();

        for (key, _, _) in template() {
            if !current.values.contains_key(key) {
                plan.missing_keys.push(key.to_string());
            }
        }

        for key in current.values.keys() {
            if !template_keys.contains(&key.as_str()) {
                plan.extra_keys.push(key.clone());
            }
        }

        for key in &template_keys {
            if let Some(v) = current.values.get(*key) {
                plan.preserved_values.push(format!("{key}={v}"));
            }
        }

        plan.changed = !plan.missing_keys.is_empty();
        Ok(plan)
    }

    /// Upgrades a config file in place: writes a `.bak` sibling, then
    /// atomically replaces the original with the merged content.
    ///
    /// Missing template keys are appended with template defaults (in
    /// template order); existing values are preserved verbatim; keys not in
    /// the template are preserved at the tail in their original order.
    pub fn upgrade(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| ProxSaveErrorIoContext(path, e).into_err())?;
        let current = Self::parse(path, &content)?;

        let bak_path = path.with_extension("env.bak");
        fs::write(&bak_path, &content)?;

        let mut out = String::new();
        let mut written_keys = std::collections::HashSet::new();

        for (key, default, comment) in template() {
            if let Some(existing) = current.values.get(key) {
                write_entry(&mut out, key, existing, comment);
            } else {
                write_entry(&mut out, key, default, comment);
            }
            written_keys.insert(key.to_string());
        }

        // Preserve custom keys at the tail, in original file order.
        for line in &current.lines {
            if let Line::Entry { key, value, .. } = line {
                if !written_keys.contains(key) {
                    write_entry(&mut out, key, value, None);
                    written_keys.insert(key.clone());
                }
            }
        }

        atomic_write(path, out.as_bytes())?;
        let merged = Self::parse(path, &out)?;
        merged.validate()?;
        Ok(merged)
    }
}

fn write_entry(out: &mut String, key: &str, value: &str, comment: Option<&str>) {
    let _ = write!(out, "{key}={value}");
    if let Some(c) = comment {
        let _ = write!(out, "  # {c}");
    }
    out.push('\n');
}

/// Splits a value tail into `(value, was_quoted, trailing_comment)`.
fn split_value_and_comment(rest: &str) -> (String, bool, Option<String>) {
    if let Some(stripped) = rest.strip_prefix('"') {
        if let Some(end) = stripped.find('"') {
            let value = stripped[..end].to_string();
            let after = stripped[end + 1..].trim_start();
            let comment = after.strip_prefix('#').map(|c| c.trim().to_string());
            return (value, true, comment);
        }
    }

    // Unquoted: value runs until an unescaped `#`.
    if let Some(hash) = rest.find('#') {
        let value = rest[..hash].trim().to_string();
        let comment = rest[hash + 1..].trim().to_string();
        (value, false, Some(comment))
    } else {
        (rest.trim().to_string(), false, None)
    }
}

/// Writes `data` to `path` atomically: write to `path.tmp`, fsync, rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    let mut f = fs::File::create(&tmp_path)?;
    use io::Write;
    f.write_all(data)?;
    f.sync_all()?;
    drop(f);
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Generates a default configuration file at the given path.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()).into());
    }

    let mut out = String::new();
    out.push_str("# ProxSave configuration — see docs for the full key reference.\n\n");
    for (key, default, comment) in template() {
        write_entry(&mut out, key, default, comment);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, out)?;
    Ok(())
}

/// Standard configuration file search paths, in descending priority order.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/proxsave/backup.env")];
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/proxsave/backup.env")));
    }
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/proxsave/backup.env")));
    }
    paths.push(PathBuf::from("backup.env"));
    paths
}

/// Loads configuration from the first found file in the search path.
pub fn load_config() -> Result<Config> {
    let search = config_search_paths();
    for path in &search {
        if path.exists() {
            return Config::load(path);
        }
    }
    Err(ConfigError::NotFound { searched: search }.into())
}

struct ProxSaveErrorIoContext<'a>(&'a Path, io::Error);
impl<'a> ProxSaveErrorIoContext<'a> {
    fn into_err(self) -> crate::error::ProxSaveError {
        anyhow::anyhow!("failed to read {}: {}", self.0.display(), self.1).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_basic_keyvalue() {
        let dir = tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "backup.env",
            "BACKUP_PATH=/var/backups\nLOG_PATH=\"/var/log/x\"  # trailing comment\n",
        );
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.get("BACKUP_PATH").unwrap(), "/var/backups");
        assert_eq!(cfg.get("LOG_PATH").unwrap(), "/var/log/x");
    }

    #[test]
    fn rejects_empty_secondary_path_when_enabled() {
        let dir = tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "backup.env",
            "BACKUP_PATH=/var/backups\nSECONDARY_ENABLED=true\nSECONDARY_PATH=\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn upgrade_appends_missing_keys_and_preserves_existing() {
        let dir = tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "backup.env",
            "BACKUP_PATH=/custom/path\nCUSTOM_KEY=hello\n",
        );
        let upgraded = Config::upgrade(&path).unwrap();
        assert_eq!(upgraded.get("BACKUP_PATH").unwrap(), "/custom/path");
        assert_eq!(upgraded.get("CUSTOM_KEY").unwrap(), "hello");
        assert_eq!(upgraded.get("COMPRESSION_TYPE").unwrap(), "zstd");
        assert!(dir.path().join("backup.env.bak").exists());
    }

    #[test]
    fn upgrade_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "backup.env", "BACKUP_PATH=/custom/path\n");
        Config::upgrade(&path).unwrap();
        let content_after_first = fs::read_to_string(&path).unwrap();
        Config::upgrade(&path).unwrap();
        let content_after_second = fs::read_to_string(&path).unwrap();
        assert_eq!(content_after_first, content_after_second);
    }

    #[test]
    fn plan_upgrade_reports_missing_and_extra_keys() {
        let dir = tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "backup.env",
            "BACKUP_PATH=/x\nWEIRD_CUSTOM_KEY=1\n",
        );
        let plan = Config::plan_upgrade(&path).unwrap();
        assert!(plan.missing_keys.contains(&"COMPRESSION_TYPE".to_string()));
        assert!(plan.extra_keys.contains(&"WEIRD_CUSTOM_KEY".to_string()));
        assert!(plan.changed);
    }

    #[test]
    fn cloud_log_path_resolution() {
        let dir = tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "backup.env",
            "BACKUP_PATH=/x\nCLOUD_REMOTE=myremote:bucket\nCLOUD_LOG_PATH=logs\n",
        );
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.resolve_cloud_log_path().unwrap(), "myremote:bucket/logs");

        let path2 = write_file(
            dir.path(),
            "backup2.env",
            "BACKUP_PATH=/x\nCLOUD_REMOTE=myremote:bucket\nCLOUD_LOG_PATH=other:standalone/path\n",
        );
        let cfg2 = Config::load(&path2).unwrap();
        assert_eq!(
            cfg2.resolve_cloud_log_path().unwrap(),
            "other:standalone/path"
        );
    }
}
