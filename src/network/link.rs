//! Carrier detection by polling sysfs.

use crate::client::LinkState;
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn carrier_path(interface: &str) -> PathBuf {
    PathBuf::from(format!("/sys/class/net/{interface}/carrier"))
}

pub async fn read_carrier(path: &Path) -> io::Result<LinkState> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(if text.trim() == "1" {
        LinkState::Up
    } else {
        LinkState::Down
    })
}

/// Polls `path` and reports every change of carrier state on `tx`.
///
/// Returns once the receiver is gone.
pub async fn watch_carrier(path: PathBuf, interval: Duration, tx: mpsc::Sender<LinkState>) {
    let mut last = None;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let state = match read_carrier(&path).await {
            Ok(state) => state,
            Err(e) => {
                // An interface that is down may refuse the read.
                trace!("reading {}: {}", path.display(), e);
                LinkState::Down
            }
        };
        if last == Some(state) {
            continue;
        }
        debug!("{}: carrier {:?}", path.display(), state);
        last = Some(state);
        if tx.send(state).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_changes_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carrier");
        std::fs::write(&path, "1\n").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let watcher = tokio::spawn(watch_carrier(
            path.clone(),
            Duration::from_millis(10),
            tx,
        ));

        assert_eq!(rx.recv().await, Some(LinkState::Up));
        std::fs::write(&path, "0\n").unwrap();
        assert_eq!(rx.recv().await, Some(LinkState::Down));
        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(rx.recv().await, Some(LinkState::Up));

        drop(rx);
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_carrier(&dir.path().join("nope")).await.is_err());
    }
}
