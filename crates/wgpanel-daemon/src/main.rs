// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{error, info, warn};
use wgpanel_daemon::{bridge, fsutil, roaming, startup, store, wg};
use wgpanel_types::{Document, LogLevel};

fn init_tracing(level: LogLevel) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = match level {
        LogLevel::Error => "error",
        LogLevel::Info => "info",
        LogLevel::Verbose => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt().with_env_filter(filter).init();
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "WireGuard management control plane")]
struct Cli {
    /// Path to the configuration document
    #[arg(short = 'c', long, default_value = "./config.json")]
    config: PathBuf,

    /// Set a new admin password in the configuration document and exit
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Remove every interface and firewall rule this panel created, then
    /// exit
    #[arg(long)]
    cleanup: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = absolute(&cli.config)?;
    let (doc, created) = load_or_create_document(&config_path).await?;

    init_tracing(doc.log_level);
    if created {
        info!(path = %config_path.display(), "created new configuration document");
    }

    if let Some(password) = cli.password {
        return rotate_password(&config_path, doc, &password).await;
    }

    info!(
        version = env!("GIT_VERSION"),
        config = %config_path.display(),
        panel_id = %doc.panel_id,
        "starting wgpanel daemon"
    );

    // Dependency injection order: the responder has no dependencies, the
    // roaming engine feeds it, the store publishes to both.
    let pbs = bridge::PseudoBridgeService::new();
    let srs = roaming::SnatRoamingService::new(pbs.clone());
    let wg_service = std::sync::Arc::new(wg::WgService::new(doc.wireguard_config_path.clone()));
    let store = store::Store::new(&config_path, doc, pbs.clone(), srs.clone());

    if cli.cleanup {
        startup::shutdown_cleanup(&store, &wg_service).await;
        srs.stop().await;
        pbs.stop();
        info!("cleanup completed, exiting");
        return Ok(());
    }

    let warnings = startup::system_checks().await;
    if !warnings.is_empty() {
        warn!(count = warnings.len(), "system checks reported issues");
    }

    store.clean_expired_sessions();
    startup::cleanup_orphaned_rules(&store).await;
    startup::initialize_interfaces(&store, &wg_service).await;
    store.sync_to_internal_service().await;

    {
        let doc = store.snapshot();
        info!(
            listen_ip = %doc.listen_ip,
            listen_port = doc.listen_port,
            interfaces = doc.interfaces.len(),
            "control plane ready"
        );
    }

    shutdown_signal().await;
    info!("received shutdown signal, starting graceful teardown");

    pbs.stop();
    srs.stop().await;
    startup::shutdown_cleanup(&store, &wg_service).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to register SIGTERM handler");
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Load the document, or bootstrap a fresh one with a random password
/// (printed once) and a random panel identifier.
async fn load_or_create_document(path: &Path) -> Result<(Document, bool), Box<dyn std::error::Error>> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            let mut doc: Document = serde_json::from_slice(&data)?;
            let mut dirty = false;
            if doc.base_path.is_empty() {
                doc.base_path = "/".to_owned();
                dirty = true;
            }
            if doc.api_prefix.is_empty() {
                doc.api_prefix = "/api".to_owned();
                dirty = true;
            }
            if doc.panel_id.is_empty() {
                doc.panel_id = fsutil::random_string("", 6);
                dirty = true;
            }
            if dirty {
                persist(path, &doc).await?;
            }
            Ok((doc, false))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let password = fsutil::random_string("", 16);
            let hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)?;

            let doc = Document {
                wireguard_config_path: "/etc/wireguard".to_owned(),
                wg_if_prefix: "wg-".to_owned(),
                log_level: LogLevel::Info,
                user: "admin".to_owned(),
                password: hash,
                listen_ip: "0.0.0.0".to_owned(),
                listen_port: 5000,
                base_path: "/".to_owned(),
                api_prefix: "/api".to_owned(),
                panel_id: fsutil::random_string("", 6),
                interfaces: HashMap::new(),
                sessions: HashMap::new(),
            };
            persist(path, &doc).await?;

            // Printed exactly once; only the bcrypt hash is stored.
            println!("Generated admin password: {password}");
            Ok((doc, true))
        }
        Err(e) => Err(e.into()),
    }
}

async fn rotate_password(
    path: &Path,
    mut doc: Document,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    doc.password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
    persist(path, &doc).await?;
    println!("Password updated successfully");
    Ok(())
}

async fn persist(path: &Path, doc: &Document) -> Result<(), Box<dyn std::error::Error>> {
    let data = serde_json::to_vec_pretty(doc)?;
    fsutil::write_file_atomic(path, &data, 0o600).await?;
    Ok(())
}
