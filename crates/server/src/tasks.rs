//! Long-lived background tasks.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ubergang_common::{Db, Error, Session};

const ACCESS_DEBOUNCE: Duration = Duration::from_secs(60);

/// Debounce session access updates to at most one write per session per
/// minute. The returned sender is the only way in.
pub fn spawn_session_access_updater(db: Db) -> mpsc::Sender<Session> {
    let (tx, mut rx) = mpsc::channel::<Session>(64);
    tokio::spawn(async move {
        let (flush_tx, mut flush_rx) = mpsc::channel::<Session>(64);
        let mut pending: HashMap<String, DateTime<Utc>> = HashMap::new();
        loop {
            tokio::select! {
                session = rx.recv() => {
                    let Some(session) = session else { return };
                    if !pending.contains_key(&session.id) {
                        let flush_tx = flush_tx.clone();
                        let queued = session.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(ACCESS_DEBOUNCE).await;
                            let _ = flush_tx.send(queued).await;
                        });
                    }
                    pending.insert(session.id.clone(), Utc::now());
                }
                session = flush_rx.recv() => {
                    let Some(session) = session else { return };
                    let Some(accessed_at) = pending.remove(&session.id) else { continue };
                    let result = db.update_session(&session.id, move |old| {
                        let mut session = old.ok_or_else(|| Error::not_found("session", "gone"))?;
                        session.accessed_at = Some(accessed_at);
                        Ok(session)
                    });
                    if let Err(e) = result {
                        warn!("Failed to update session access time: {e}");
                    }
                }
            }
        }
    });
    tx
}

/// Periodic gzip backups of the raw database into `directory`.
pub fn spawn_periodic_backups(db: Db, directory: PathBuf, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let filename = "ubergang-backup.db.gz";
            match db.snapshot_gz() {
                Ok((original, compressed)) => {
                    let path = directory.join(filename);
                    match tokio::fs::write(&path, &compressed).await {
                        Ok(()) => info!(
                            "Database backed up as {filename} ({original} -> {} bytes compressed)",
                            compressed.len()
                        ),
                        Err(e) => warn!("Failed to write database backup: {e}"),
                    }
                }
                Err(e) => warn!("Failed to backup database: {e}"),
            }
        }
    });
}
