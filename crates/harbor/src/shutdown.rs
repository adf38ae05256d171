//! Coordinated shutdown.
//!
//! On SIGINT/SIGTERM the server stops accepting connections, then the
//! registry is drained: in-flight turns are cancelled (the runner signals,
//! waits, then force-kills), temp image dirs are released, and PTYs are
//! killed. Cleanup failures are logged and swallowed.

use std::time::Duration;

use log::{info, warn};

use crate::registry::SessionRegistry;

/// Grace period for cancelled children to exit before the process leaves.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Resolves when the process receives a termination signal.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Drain every live session out of the registry.
pub async fn drain(registry: &SessionRegistry) {
    let agents = registry.agents().await;
    let shells = registry.shells().await;
    info!(
        "Draining {} agent session(s) and {} shell(s)",
        agents.len(),
        shells.len()
    );

    for session in agents {
        session.close().await;
        registry.remove_agent(&session.session_id).await;
    }
    for shell in shells {
        shell.kill();
        registry.remove_shell(&shell.id).await;
    }

    tokio::time::sleep(DRAIN_GRACE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentSession;

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let registry = SessionRegistry::new();
        registry
            .put_agent(AgentSession::new("s1", "u1", "p1", "/tmp"))
            .await;

        drain(&registry).await;
        assert!(registry.agents().await.is_empty());
    }
}
