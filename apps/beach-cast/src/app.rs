use std::sync::Arc;

use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::cli::Cli;
use crate::error::CliError;
use crate::sidecar::{self, SidecarBridge, SidecarWorkspace};
use crate::transport::WebSocketTransport;

const HOST_EVENT_CAPACITY: usize = 1024;

/// Connects to the relay and streams host events read from stdin until stdin closes.
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.to_config()?;
    let workspace = SidecarWorkspace::with_ignore_patterns(&cli.stream.ignore)?;
    workspace.set_workspace_folders(cli.stream.workspace_folders.clone());

    info!(
        target: "beach_cast::app",
        relay = %config.relay,
        room = %config.room,
        paused = cli.stream.paused,
        "starting broadcaster"
    );

    let mut broadcaster = Broadcaster::new(
        config,
        Arc::new(WebSocketTransport::new()),
        Arc::new(workspace.clone()),
    );

    let (tx, rx) = mpsc::channel(HOST_EVENT_CAPACITY);
    let reader = tokio::spawn(async move {
        let mut bridge = SidecarBridge::new(workspace);
        let stdin = BufReader::new(tokio::io::stdin());
        match sidecar::pump_lines(stdin, &mut bridge, &tx).await {
            Ok(count) => info!(target: "beach_cast::app", events = count, "host input closed"),
            Err(err) => warn!(target: "beach_cast::app", error = %err, "host input failed"),
        }
    });
    let abort = reader.abort_handle();
    broadcaster.register_disposer(move || abort.abort());

    if !cli.stream.paused {
        broadcaster.start().await;
    }
    broadcaster.run(rx).await;
    Ok(())
}
