//! Bastion control plane - main entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bastion_common::CertId;
use bastion_config::{
    AdminSettings, CertificateBindings, ConfigRevision, MemoryStore, RevisionManager, Topology,
};
use bastion_control::acme::{AcmeClient, ChallengeMap};
use bastion_control::blob::FsBlobStore;
use bastion_control::certs::CertificateManager;
use bastion_control::dns::{LuaCompiler, ProviderRegistry};
use bastion_control::settings::Settings;

/// Bastion - certificate and configuration control plane
#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "BASTION_CONFIG")]
    config: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

/// Exit code asking the supervisor to restart us with the new listener set.
const EXIT_RESTART: i32 = 64;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Settings::default(),
    };

    init_tracing(&settings, cli.verbose);

    if cli.test {
        println!("configuration OK");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    let exit = runtime.block_on(run(settings))?;
    if exit != 0 {
        std::process::exit(exit);
    }
    Ok(())
}

fn init_tracing(settings: &Settings, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose {
        "debug".to_string()
    } else {
        settings.log.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if settings.log.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(settings: Settings) -> Result<i32> {
    info!(version = env!("CARGO_PKG_VERSION"), "bastion starting");
    let shutdown = CancellationToken::new();

    let blobs = Arc::new(
        FsBlobStore::open(settings.storage.blob_path.clone())
            .await
            .context("opening blob store")?,
    );
    let store = Arc::new(MemoryStore::new());

    // DNS provider scripts compile at startup so the operator sees
    // diagnostics immediately instead of at the next renewal.
    let registry = Arc::new(ProviderRegistry::new(Arc::new(LuaCompiler::new())));
    for provider in &settings.dns.providers {
        let source = std::fs::read_to_string(&provider.script_path).with_context(|| {
            format!(
                "reading DNS provider script {}",
                provider.script_path.display()
            )
        })?;
        match registry.get_or_compile(provider.id, &provider.name, &source) {
            Ok(_) => {}
            Err(err) => warn!(provider = %provider.name, error = %err, "DNS provider rejected"),
        }
    }

    let revisions = RevisionManager::start(
        store.clone(),
        store.clone(),
        seed_revision(&settings),
        shutdown.clone(),
    )
    .await
    .context("starting revision manager")?;

    let challenges = Arc::new(ChallengeMap::new());
    let acme = Arc::new(
        AcmeClient::new(
            settings.acme.providers.clone(),
            store.clone(),
            blobs.clone(),
            challenges,
            registry,
        )
        .context("building ACME client")?,
    );

    let certificates = CertificateManager::new(
        store.clone(),
        blobs,
        acme,
        revisions.running(),
        shutdown.clone(),
    )
    .await
    .context("building certificate manager")?;

    let manager_task = tokio::spawn(Arc::clone(&certificates).run(revisions.subscribe()));

    let restart = revisions.restart_token();
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            0
        }
        _ = sigterm() => {
            info!("termination requested, shutting down");
            0
        }
        _ = restart.cancelled() => {
            info!("listener set changed, restarting to apply");
            EXIT_RESTART
        }
    };

    shutdown.cancel();
    if let Err(err) = manager_task.await {
        error!(error = %err, "certificate manager task failed");
    }
    info!("bastion stopped");
    Ok(exit_code)
}

/// Revision 1 when the store is empty: admin listener only, no bindings.
fn seed_revision(settings: &Settings) -> ConfigRevision {
    ConfigRevision {
        revision: 1,
        based_on_revision: 0,
        committed: false,
        confirmed: false,
        reverted: false,
        revert_reason: None,
        committed_at: None,
        confirm_seconds: settings.admin.confirm_seconds,
        admin: AdminSettings {
            listen_any: settings.admin.listen_any,
            port: settings.admin.port,
            cert_id: CertId::new(),
        },
        bindings: CertificateBindings {
            fallback_cert: None,
            sni: vec![],
        },
        topology: Topology::default(),
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            error!(error = %err, "SIGTERM handler failed to install");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
