use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use sealbox_core::{
    DownloadCoordinator, MetadataResolver, Passphrase, TransferConfig, TransferSession,
    UploadCoordinator,
};
use transport_http::{HttpRemote, RemoteStore, Url};

#[derive(Parser, Debug)]
#[command(name = "sealbox", version, about = "Sealbox Encrypted File Transfer")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Remote store base URL (or SEALBOX_SERVER)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Passphrase (or SEALBOX_PASSPHRASE; prompted when absent)
    #[arg(long, global = true)]
    passphrase: Option<String>,

    /// Plaintext bytes per sealed frame
    #[arg(long, global = true, default_value_t = 256 * 1024)]
    chunk_size: usize,

    /// Retries allowed after a failed attempt
    #[arg(long, global = true, default_value_t = 3)]
    retries: u32,

    /// Base backoff delay between retries, in milliseconds
    #[arg(long, global = true, default_value_t = 250)]
    retry_delay_ms: u64,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seal a file and upload it
    Send {
        /// File to send
        #[arg(long)]
        file: PathBuf,
    },

    /// Download a record and decrypt it
    Get {
        /// Transfer ID (32 hex characters)
        #[arg(long)]
        id: String,

        /// Destination path (defaults to the stored filename)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show what the server knows about a record
    Info {
        /// Transfer ID (32 hex characters)
        #[arg(long)]
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let config = TransferConfig {
        chunk_size: cli.chunk_size,
        max_retries: cli.retries,
        retry_delay_ms: cli.retry_delay_ms,
    };
    config.validate()?;

    match cli.cmd {
        Commands::Send { file } => {
            let server = resolve_server(cli.server.as_deref())?;
            let passphrase = resolve_passphrase(cli.passphrase.as_deref())?;
            send_file(server, config, &file, passphrase).await?;
        }

        Commands::Get { id, output } => {
            let server = resolve_server(cli.server.as_deref())?;
            let passphrase = resolve_passphrase(cli.passphrase.as_deref())?;
            get_file(server, config, &id, output, passphrase).await?;
        }

        Commands::Info { id, json } => {
            let server = resolve_server(cli.server.as_deref())?;
            show_info(server, config, &id, json).await?;
        }
    }

    Ok(())
}

async fn send_file(
    server: Url,
    config: TransferConfig,
    file: &Path,
    passphrase: Passphrase,
) -> Result<()> {
    let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemote::new(server)?);
    let coordinator = UploadCoordinator::new(remote, config)?;
    let session = TransferSession::new();
    wire_ctrl_c(&session);

    tracing::info!(file = %file.display(), "sending file");
    println!("Sealing and uploading: {}", file.display());
    let report = coordinator.push_file(file, &passphrase, &session).await?;

    println!("✓ Upload complete");
    println!("  Transfer ID: {}", report.transfer_id);
    println!(
        "  Size: {} bytes ({} sealed)",
        report.plaintext_len, report.sealed_len
    );
    if report.attempts > 1 {
        println!("  Attempts: {}", report.attempts);
    }
    println!();
    println!("Share the transfer ID and the passphrase over separate channels.");
    Ok(())
}

async fn get_file(
    server: Url,
    config: TransferConfig,
    id: &str,
    output: Option<PathBuf>,
    passphrase: Passphrase,
) -> Result<()> {
    let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemote::new(server)?);
    let coordinator = DownloadCoordinator::new(remote.clone(), config.clone())?;
    let session = TransferSession::new();
    wire_ctrl_c(&session);

    // Default destination is the stored filename, resolved up front so the
    // user sees where bytes will land before the transfer starts.
    let dest = match output {
        Some(path) => path,
        None => {
            let resolver = MetadataResolver::new(remote, config);
            let meta = resolver.resolve(id, &session).await?;
            PathBuf::from(sanitize_filename(&meta.filename))
        }
    };

    tracing::info!(id, dest = %dest.display(), "fetching record");
    println!("Downloading {} to {}", id, dest.display());
    let report = coordinator
        .fetch_to_path(id, &passphrase, &dest, &session)
        .await?;

    println!("✓ Download complete");
    println!("  File: {}", dest.display());
    println!("  Size: {} bytes", report.plaintext_len);
    if report.attempts > 1 {
        println!("  Fetch attempts: {}", report.attempts);
    }
    Ok(())
}

async fn show_info(server: Url, config: TransferConfig, id: &str, json: bool) -> Result<()> {
    let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemote::new(server)?);
    let resolver = MetadataResolver::new(remote, config);
    let session = TransferSession::new();
    let meta = resolver.resolve(id, &session).await?;

    if json {
        let value = serde_json::json!({
            "transferId": meta.transfer_id.to_string(),
            "filename": meta.filename,
            "sizeBytes": meta.size_bytes,
            "mimeType": meta.mime_type,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Record information:");
        println!("  Transfer ID: {}", meta.transfer_id);
        println!("  Stored name: {}", meta.filename);
        match meta.size_bytes {
            Some(n) => println!("  Size: {} bytes", n),
            None => println!("  Size: unknown"),
        }
        if let Some(mime) = &meta.mime_type {
            println!("  Content type: {}", mime);
        }
    }
    Ok(())
}

fn resolve_server(flag: Option<&str>) -> Result<Url> {
    let raw = match flag {
        Some(s) => s.to_string(),
        None => std::env::var("SEALBOX_SERVER")
            .context("no server address: pass --server or set SEALBOX_SERVER")?,
    };
    Url::parse(&raw).with_context(|| format!("invalid server address: {raw}"))
}

fn resolve_passphrase(flag: Option<&str>) -> Result<Passphrase> {
    if let Some(p) = flag {
        return Ok(Passphrase::new(p));
    }
    if let Ok(p) = std::env::var("SEALBOX_PASSPHRASE") {
        if !p.is_empty() {
            return Ok(Passphrase::new(p));
        }
    }

    // Interactive fallback; the prompt does not echo.
    let line = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
    if line.is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    Ok(Passphrase::new(line))
}

/// First Ctrl+C cancels cooperatively; a second aborts the process, since
/// registering the tokio handler replaces the default disposition for good.
fn wire_ctrl_c(session: &TransferSession) {
    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!();
        eprintln!("✗ Cancelling...");
        tracing::warn!("cancellation requested");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("✗ Aborting");
            std::process::exit(130);
        }
    });
}

/// Server-supplied names become plain file names: no separators, no control
/// characters, no leading dots.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\') && !c.is_control())
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "download.bin".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_paths_and_dots() {
        assert_eq!(sanitize_filename("notes.txt"), "notes.txt");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("dir\\name.bin"), "dirname.bin");
        assert_eq!(sanitize_filename("..."), "download.bin");
        assert_eq!(sanitize_filename(""), "download.bin");
    }

    // Without a terminal the prompt path cannot resolve a passphrase, so a
    // success here proves the flag and env sources short-circuit it.
    #[test]
    fn passphrase_flag_short_circuits_the_prompt() {
        assert!(resolve_passphrase(Some("hunter2")).is_ok());
    }

    #[test]
    fn passphrase_env_var_is_used_when_no_flag_is_given() {
        std::env::set_var("SEALBOX_PASSPHRASE", "from-env");
        let resolved = resolve_passphrase(None);
        std::env::remove_var("SEALBOX_PASSPHRASE");
        assert!(resolved.is_ok());
    }
}
