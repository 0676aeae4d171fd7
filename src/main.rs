use std::sync::Arc;

use roomstream::{ChannelConfig, HttpTransport, SessionRegistry};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = ChannelConfig::from_env().expect("invalid channel configuration");
    let transport = HttpTransport::new(&config).expect("HTTP transport init failed");
    let registry = SessionRegistry::new(Arc::new(transport), &config);

    let mut events = registry.subscribe();
    for room in &config.rooms {
        if !registry.join(room) {
            tracing::warn!(%room, "duplicate room ignored");
        }
    }
    tracing::info!(sessions = registry.len(), "roomstream started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "event serialization failed"),
                },
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event consumer lagging"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                for id in registry.session_ids() {
                    if let Some(s) = registry.snapshot(&id) {
                        tracing::info!(session_id = %s.id, last_sequence = s.last_sequence, "stopping session");
                    }
                }
                break;
            }
        }
    }

    registry.shutdown().await;
}
