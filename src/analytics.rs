// Analytics layer (spec §1 "external collaborator", §6.5): an append-only `session_events`
// table, written from the session-cleared broadcast every (user, cluster, ide) key emits on.
// Detailed analytics schema is explicitly out of scope (spec §1 Non-goals); this crate only
// guarantees the write path exists and never blocks the launch/stop critical path.  The
// subscriber runs on its own task and logs (rather than propagates) write failures.

use sqlx::SqlitePool;
use tracing::warn;

use crate::session::{EndReason, SessionKey, SessionManager};

pub fn spawn_session_event_sink(pool: SqlitePool, manager: &SessionManager) {
    let mut rx = manager.subscribe_cleared();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok((key, reason)) => {
                    if let Err(e) = record_cleared(&pool, &key, reason).await {
                        warn!(error = %e, "failed to write session_events row");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session-cleared analytics subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn record_cleared(pool: &SqlitePool, key: &SessionKey, reason: EndReason) -> Result<(), sqlx::Error> {
    let event = match reason {
        EndReason::Cancelled => "cancelled",
        EndReason::Timeout => "timeout",
        EndReason::TunnelLost => "tunnel_lost",
    };
    sqlx::query(
        "INSERT INTO session_events (occurred_at, username, cluster, ide, event, job_id) \
         VALUES (?, ?, ?, ?, ?, NULL)",
    )
    .bind(crate::time::now_iso8601())
    .bind(&key.user)
    .bind(&key.cluster)
    .bind(key.ide.as_str())
    .bind(event)
    .execute(pool)
    .await?;
    Ok(())
}
