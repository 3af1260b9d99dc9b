//! toolbridge: serve a worker's operations as JSON-RPC tools over stdio.
//!
//! Usage:
//!   toolbridge --manifest tools.json
//!   TOOLBRIDGE_MANIFEST=tools.json toolbridge --eager-spawn

mod logging;
mod manifest;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use toolbridge::{Dispatcher, OrchestratorConfig, ServerConfig, orchestrator};

use crate::manifest::{BridgeSection, Manifest};

#[derive(Parser)]
#[command(name = "toolbridge", version)]
#[command(about = "Stdio JSON-RPC tool server backed by a persistent worker process")]
struct Cli {
    /// Path to the service manifest (JSON)
    #[arg(long, env = "TOOLBRIDGE_MANIFEST")]
    manifest: PathBuf,

    /// Seconds to wait for a worker reply before failing the call
    #[arg(long)]
    call_timeout_secs: Option<u64>,

    /// Maximum calls outstanding at the worker; further calls are rejected
    #[arg(long)]
    max_pending: Option<usize>,

    /// Start the worker during the initialize handshake
    #[arg(long)]
    eager_spawn: bool,

    /// Largest request frame accepted, in bytes
    #[arg(long)]
    max_frame_bytes: Option<usize>,
}

impl Cli {
    fn bridge_overrides(&self) -> BridgeSection {
        BridgeSection {
            call_timeout_secs: self.call_timeout_secs,
            max_pending: self.max_pending,
            eager_spawn: self.eager_spawn.then_some(true),
            exit_grace_secs: None,
        }
    }

    fn server_config(&self) -> ServerConfig {
        match self.max_frame_bytes {
            Some(len) => ServerConfig::default().with_max_frame_len(len),
            None => ServerConfig::default(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();

    let manifest = Manifest::load(&cli.manifest)?;
    let bridge = manifest.bridge.clone().merged(&cli.bridge_overrides());

    let config = bridge.apply(OrchestratorConfig::new(Arc::new(manifest.spawner())));
    info!(
        service = manifest.display_name(),
        program = %manifest.worker.program,
        tools = manifest.tools.len(),
        call_timeout = ?config.call_timeout,
        max_pending = config.max_pending,
        eager_spawn = bridge.eager_spawn(),
        "Starting tool bridge"
    );

    let client = orchestrator::start(config);
    let registry = manifest.registry(&client)?;
    let mut dispatcher = Dispatcher::new(registry);
    if bridge.eager_spawn() {
        dispatcher = dispatcher.with_warm_up(client.clone());
    }

    let served = toolbridge::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        Arc::new(dispatcher),
        cli.server_config(),
    )
    .await;

    info!("Input closed, stopping worker");
    client.shutdown().await;
    served.context("stdio server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_become_overrides() {
        let cli = Cli::parse_from([
            "toolbridge",
            "--manifest",
            "tools.json",
            "--call-timeout-secs",
            "5",
            "--eager-spawn",
        ]);
        assert_eq!(cli.manifest, PathBuf::from("tools.json"));
        assert_eq!(
            cli.bridge_overrides(),
            BridgeSection {
                call_timeout_secs: Some(5),
                max_pending: None,
                eager_spawn: Some(true),
                exit_grace_secs: None,
            }
        );
    }

    #[test]
    fn absent_eager_flag_keeps_manifest_choice() {
        let cli = Cli::parse_from(["toolbridge", "--manifest", "tools.json"]);
        assert_eq!(cli.bridge_overrides().eager_spawn, None);
        assert_eq!(cli.server_config().max_frame_len, ServerConfig::default().max_frame_len);
    }

    #[test]
    fn frame_limit_flag_reaches_server_config() {
        let cli = Cli::parse_from([
            "toolbridge",
            "--manifest",
            "tools.json",
            "--max-frame-bytes",
            "1024",
        ]);
        assert_eq!(cli.server_config().max_frame_len, 1024);
    }
}
