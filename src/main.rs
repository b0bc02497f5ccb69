//! # proxsave
//!
//! Operational backup tool for Proxmox VE/PBS hosts: staged pipeline,
//! multi-tier replication, age encryption, and retention.
//!
//! Implements the subset of the CLI contract that drives the core directly.
//! Interactive installer/wizard flows, TUI, legacy-config migration, and
//! self-update are out of scope and are represented only as rejected
//! branches with a remediation message.

use clap::Parser;
use proxsave::config::Config;
use proxsave::crypto::recipients::{default_recipient_file, RecipientSource};
use proxsave::crypto::setup::{run_setup, FixedProvider};
use proxsave::error::{ProxSaveError, Result};
use proxsave::identity;
use proxsave::{notify, orchestrator};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "proxsave",
    version,
    about = "Operational backup tool for Proxmox VE/PBS hosts"
)]
struct Cli {
    /// Path to the backup.env configuration file (overrides the default search)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the full pipeline without writing any replicated/retained output
    #[arg(long)]
    dry_run: bool,

    /// Minimum tracing level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configure a new encryption recipient interactively and exit
    #[arg(long)]
    newkey: bool,

    /// Dump a diagnostic bundle (config, identity, last report, filesystem info) and exit
    #[arg(long)]
    support: bool,

    /// Rejected: interactive installer is out of scope for this build
    #[arg(long)]
    install: bool,
    /// Rejected: interactive installer is out of scope for this build
    #[arg(long)]
    new_install: bool,
    /// Rejected: config reconciliation wizard is out of scope for this build
    #[arg(long)]
    upgrade: bool,
    #[arg(long)]
    upgrade_config: bool,
    #[arg(long)]
    upgrade_config_dry_run: bool,
    /// Rejected: legacy-config migration is out of scope for this build
    #[arg(long)]
    env_migration: bool,
    #[arg(long)]
    env_migration_dry_run: bool,
    /// Rejected: restore of VM disks is explicitly out of scope (see Non-goals)
    #[arg(long)]
    restore: bool,
    /// Rejected: standalone decrypt is out of scope for this build
    #[arg(long)]
    decrypt: bool,
    /// Rejected: the interactive TUI is out of scope for this build
    #[arg(long)]
    cli: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            print_banner_footer(&e);
            std::process::exit(e.exit_code());
        }
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run(cli: &Cli) -> Result<()> {
    reject_out_of_scope(cli)?;

    if cli.support {
        return cmd_support(cli);
    }

    let mut config = load_config(cli)?;
    if cli.dry_run {
        force_dry_run(&mut config);
    }

    if cli.newkey {
        return cmd_newkey(&config);
    }

    cmd_run(&config)
}

/// Mirrors spec.md §6's mutual-exclusion matrix: these flags name features
/// this build does not implement, so they are rejected up front rather than
/// silently ignored.
fn reject_out_of_scope(cli: &Cli) -> Result<()> {
    let rejected = [
        (cli.install, "--install"),
        (cli.new_install, "--new-install"),
        (cli.upgrade, "--upgrade"),
        (cli.upgrade_config, "--upgrade-config"),
        (cli.upgrade_config_dry_run, "--upgrade-config-dry-run"),
        (cli.env_migration, "--env-migration"),
        (cli.env_migration_dry_run, "--env-migration-dry-run"),
        (cli.restore, "--restore"),
        (cli.decrypt, "--decrypt"),
        (cli.cli, "--cli"),
    ];
    for (set, name) in rejected {
        if set {
            return Err(ProxSaveError::Config(proxsave::error::ConfigError::Validation {
                message: format!("{name} is not implemented by this build"),
            }));
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => proxsave::config::load_config(),
    }
}

fn force_dry_run(config: &mut Config) {
    config.set("DRY_RUN", "true");
}

fn cmd_run(config: &Config) -> Result<()> {
    let host = identity::hostname();
    eprintln!(
        "{} proxsave v{} — backup run for {}",
        colored::Colorize::bold(colored::Colorize::cyan("▶")),
        env!("CARGO_PKG_VERSION"),
        colored::Colorize::bold(host.as_str())
    );

    let notifiers = notify::build_notifiers(config);
    let stats = orchestrator::run(config, &host, &notifiers)?;

    eprintln!(
        "{} {} files collected, {} failed, archive {} ({})",
        colored::Colorize::bold(colored::Colorize::green("✓")),
        stats.files_collected,
        stats.files_failed,
        format_size(stats.archive_size),
        stats.compression_effective,
    );
    if let Some(report) = &stats.report_path {
        eprintln!("  report: {}", report.display());
    }
    Ok(())
}

fn cmd_newkey(config: &Config) -> Result<()> {
    let base_dir = config
        .base_dir()
        .ok_or(proxsave::error::EnvironmentError::BaseDirUnset)?;
    let recipient_file = default_recipient_file(&base_dir);

    eprintln!("{} configuring a new encryption recipient", colored::Colorize::bold(colored::Colorize::cyan("▶")));
    eprint!("  enter a passphrase (blank to abort): ");
    io::stderr().flush().ok();

    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line).map_err(ProxSaveError::Io)?;
    let passphrase = line.trim().to_string();

    if passphrase.is_empty() {
        return Err(ProxSaveError::EncryptionSetupAborted);
    }

    let mut provider = FixedProvider::new(vec![RecipientSource::Passphrase(passphrase)]);
    let recipients = run_setup(&mut provider, &recipient_file)?;

    eprintln!(
        "{} recipient set now has {} entr{}",
        colored::Colorize::bold(colored::Colorize::green("✓")),
        recipients.len(),
        if recipients.len() == 1 { "y" } else { "ies" }
    );
    Ok(())
}

/// Diagnostic dump per SPEC_FULL.md §C: current config (secrets redacted),
/// identity decode result, last stats report if any, and per-target
/// filesystem detection — written to stdout as JSON.
fn cmd_support(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let base_dir = config.base_dir();

    let identity_result = match &base_dir {
        Some(dir) => match identity::decode(dir) {
            Ok(Some(info)) => serde_json::json!({
                "server_id": info.server_id,
                "primary_mac": info.primary_mac,
                "observed_macs": info.observed_macs,
                "identity_file": info.identity_file,
            }),
            Ok(None) => serde_json::json!({ "status": "not yet generated" }),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        },
        None => serde_json::json!({ "error": "BASE_DIR not set" }),
    };

    let last_report = config
        .get_path("LOG_PATH")
        .and_then(|dir| latest_report_path(&dir))
        .and_then(|path| std::fs::read_to_string(&path).ok())
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok());

    let targets = proxsave::storage::build_targets(&config).unwrap_or_default();
    let filesystem_info: Vec<_> = targets
        .iter()
        .map(|t| {
            let fs = t.detect_filesystem();
            serde_json::json!({
                "target": t.name(),
                "location": t.location().to_string(),
                "filesystem": fs.map(|f| format!("{:?}", f.kind)),
            })
        })
        .collect();

    let dump = serde_json::json!({
        "config": redact_config(&config),
        "identity": identity_result,
        "last_report": last_report,
        "filesystem_info": filesystem_info,
    });

    println!("{}", serde_json::to_string_pretty(&dump).unwrap_or_default());
    Ok(())
}

fn redact_config(config: &Config) -> serde_json::Value {
    let sensitive = [
        "NOTIFY_TELEGRAM_TOKEN",
        "NOTIFY_GOTIFY_TOKEN",
        "NOTIFY_WEBHOOK_URL",
        "CLOUD_REMOTE",
    ];
    let mut map = serde_json::Map::new();
    for key in [
        "BACKUP_PATH", "LOG_PATH", "SECONDARY_ENABLED", "SECONDARY_PATH", "CLOUD_ENABLED",
        "LOCK_PATH", "BASE_DIR", "COMPRESSION_TYPE", "COMPRESSION_LEVEL", "RETENTION_POLICY",
        "ENCRYPT_ARCHIVE", "DRY_RUN",
    ] {
        if let Some(value) = config.get(key) {
            map.insert(key.to_string(), serde_json::Value::String(value));
        }
    }
    for key in sensitive {
        if config.get(key).is_some() {
            map.insert(key.to_string(), serde_json::Value::String("<redacted>".into()));
        }
    }
    serde_json::Value::Object(map)
}

fn latest_report_path(log_dir: &std::path::Path) -> Option<PathBuf> {
    std::fs::read_dir(log_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

/// Prints the red/yellow/green/magenta banner footer per spec.md §7.
fn print_banner_footer(err: &ProxSaveError) {
    let label = if matches!(err, ProxSaveError::Cancelled) {
        colored::Colorize::bold(colored::Colorize::magenta("interrupted"))
    } else {
        colored::Colorize::bold(colored::Colorize::red("error"))
    };
    eprintln!("{label}: {err}");
    if let Some(remediation) = err.remediation() {
        eprintln!("  {}", colored::Colorize::yellow(remediation));
    }
}
