//! Finding the heartbeat-enabled process
//!
//! Every application that emits heartbeats registers an entry named after its
//! pid in the heartbeat directory. The governor serves exactly one.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use cadence_common::{DiscoveryError, ProcessId};

/// The single pid registered in `dir`
pub fn discover_target_pid(dir: &Path) -> Result<ProcessId, DiscoveryError> {
    let entries = std::fs::read_dir(dir).map_err(|e| DiscoveryError::InvalidEntry {
        dir: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut pids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DiscoveryError::InvalidEntry {
            dir: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let name = entry.file_name();
        match name.to_str().and_then(|n| n.parse::<u32>().ok()) {
            Some(pid) => pids.push(pid),
            None => debug!(entry = ?name, "ignoring non-pid entry"),
        }
    }
    pids.sort_unstable();

    match pids.len() {
        0 => Err(DiscoveryError::NotFound {
            dir: dir.display().to_string(),
        }),
        1 => Ok(ProcessId(pids[0])),
        count => Err(DiscoveryError::MultipleTargets { count, pids }),
    }
}

/// Poll `dir` until exactly one process registers.
///
/// An empty directory is retried every `interval` until `stop` is set, which
/// yields `Ok(None)`; anything else that goes wrong is returned.
pub async fn wait_for_target(
    dir: &Path,
    interval: Duration,
    stop: &AtomicBool,
) -> Result<Option<ProcessId>, DiscoveryError> {
    let mut announced = false;
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match discover_target_pid(dir) {
            Ok(pid) => {
                info!(%pid, dir = %dir.display(), "monitoring process");
                return Ok(Some(pid));
            }
            Err(DiscoveryError::NotFound { .. }) => {
                if !announced {
                    info!(dir = %dir.display(), "waiting for a heartbeat-enabled process");
                    announced = true;
                }
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_single_pid() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("4242"), b"").unwrap();
        fs::write(dir.path().join("4242.log"), b"1\t0.0\n").unwrap();
        fs::write(dir.path().join("README"), b"").unwrap();

        assert_eq!(discover_target_pid(dir.path()).unwrap(), ProcessId(4242));
    }

    #[test]
    fn test_empty_and_multiple() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_target_pid(dir.path()),
            Err(DiscoveryError::NotFound { .. })
        ));

        fs::write(dir.path().join("20"), b"").unwrap();
        fs::write(dir.path().join("10"), b"").unwrap();
        match discover_target_pid(dir.path()) {
            Err(DiscoveryError::MultipleTargets { count, pids }) => {
                assert_eq!(count, 2);
                assert_eq!(pids, vec![10, 20]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            discover_target_pid(&missing),
            Err(DiscoveryError::InvalidEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_late_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                fs::write(path.join("77"), b"").unwrap();
            })
        };

        let stop = AtomicBool::new(false);
        let pid = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_target(&path, Duration::from_millis(5), &stop),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(pid, Some(ProcessId(77)));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_gives_up_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let stop = AtomicBool::new(true);
        let pid = wait_for_target(dir.path(), Duration::from_millis(5), &stop)
            .await
            .unwrap();
        assert_eq!(pid, None);
    }
}
