//! Local intake socket.
//!
//! One JSON update descriptor per connection. The client half-closes after
//! writing; the reply is the JSON outcome once the update finishes, or a
//! rejection right away.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use chute_pipeline::{UpdateDescriptor, UpdateManager};

/// Largest descriptor accepted on the socket.
const MAX_DESCRIPTOR: u64 = 4 * 1024 * 1024;

pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // A stale socket from a previous run would make bind fail.
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale intake socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

pub async fn serve(
    listener: UnixListener,
    manager: UpdateManager,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!("intake listening");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("intake shutting down");
                return;
            }

            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "intake accept failed");
                        continue;
                    }
                };
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle(stream, manager).await {
                        tracing::warn!(error = %e, "intake connection failed");
                    }
                });
            }
        }
    }
}

async fn handle(mut stream: UnixStream, manager: UpdateManager) -> Result<()> {
    let mut body = Vec::new();
    (&mut stream)
        .take(MAX_DESCRIPTOR)
        .read_to_end(&mut body)
        .await
        .context("failed to read descriptor")?;

    let reply = match serde_json::from_slice::<UpdateDescriptor>(&body) {
        Err(e) => rejection(format!("malformed descriptor: {e}")),
        Ok(descriptor) => match manager.add(descriptor, None) {
            Err(e) => rejection(e.to_string()),
            Ok(ticket) => {
                tracing::debug!(update = ticket.id, tok = ticket.tok, "intake accepted update");
                match ticket.wait().await {
                    Ok(outcome) => serde_json::to_value(&outcome)?,
                    Err(e) => rejection(e.to_string()),
                }
            }
        },
    };

    stream.write_all(&serde_json::to_vec(&reply)?).await?;
    stream.shutdown().await?;
    Ok(())
}

fn rejection(message: String) -> serde_json::Value {
    json!({ "success": false, "message": message })
}
