//! Periodic removal of stale session tables and upload directories.

use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::store::{SessionStore, SweepReport};

/// Run one sweep of `store`, logging what was removed.
pub fn run_sweep_once(store: &SessionStore, max_age: Duration) -> Result<SweepReport> {
    let report = store.sweep(max_age)?;
    if report.files_removed + report.dirs_removed > 0 {
        log::info!(
            "sweep removed {} file(s) and {} dir(s) from {}",
            report.files_removed,
            report.dirs_removed,
            store.dir().display()
        );
    }
    Ok(report)
}

/// Sweep `store` every `interval` until the returned task is aborted.
/// The first sweep runs immediately.
pub fn spawn_sweeper(store: SessionStore, interval: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || run_sweep_once(&store, max_age)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::warn!("sweep failed: {e}"),
                Err(e) => log::error!("sweep task panicked: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn sweeper_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.db"), b"x").unwrap();
        fs::create_dir(dir.path().join("upload")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = spawn_sweeper(SessionStore::new(dir.path()), Duration::from_millis(10), Duration::ZERO);
        for _ in 0..100 {
            if fs::read_dir(dir.path()).unwrap().next().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn sweep_once_keeps_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("new.db"), b"x").unwrap();

        let report = run_sweep_once(&SessionStore::new(dir.path()), Duration::from_secs(3600)).unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(dir.path().join("new.db").exists());
    }
}
