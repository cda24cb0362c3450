//! Block device arrival and removal as a refresh trigger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::error::DaemonError;
use crate::paths::DEBOUNCE_WINDOW;
use crate::refresh::RefreshCoalescer;

const DEVICE_PREFIXES: &[&str] = &[
    "sd", "vd", "xvd", "hd", "nvme", "dm-", "md", "loop", "nbd", "mmcblk",
];

pub(crate) async fn watcher_task(
    paths: Vec<PathBuf>,
    refresh: Arc<RefreshCoalescer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched = 0usize;
    for path in &paths {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "watch path missing, skipping");
            continue;
        }
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %path.display(), "watching for device changes");
        watched += 1;
    }
    if watched == 0 {
        tracing::warn!("no device paths could be watched; event-driven refresh disabled");
    }

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if !is_device_node(&path, &paths) {
                        continue;
                    }
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }
                    tracing::info!(device = %path.display(), kind = ?event.kind, "device change");
                    refresh.request("udev");
                }
            }
        }
    }

    Ok(())
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Remove(_))
}

/// Entries directly inside a watched directory that look like disks,
/// partitions or device-mapper nodes.
fn is_device_node(path: &Path, roots: &[PathBuf]) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    let Some(root) = roots.iter().find(|root| parent == root.as_path()) else {
        return false;
    };
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name == "control" {
        return false;
    }
    root.ends_with("mapper") || DEVICE_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_events() {
        let threshold = Duration::from_millis(100);
        let mut debounce = HashMap::<PathBuf, Instant>::new();
        let path = PathBuf::from("/dev/sdb");
        let mut triggers = 0usize;

        for _ in 0..5 {
            if should_process_event_with_threshold(&mut debounce, &path, Instant::now(), threshold)
            {
                triggers += 1;
            }
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(triggers, 1, "a burst of udev events should trigger once");

        advance(Duration::from_millis(150)).await;
        assert!(should_process_event_with_threshold(
            &mut debounce,
            &path,
            Instant::now(),
            threshold
        ));
    }

    #[test]
    fn device_filter() {
        let roots = vec![PathBuf::from("/dev"), PathBuf::from("/dev/mapper")];
        assert!(is_device_node(Path::new("/dev/sdb"), &roots));
        assert!(is_device_node(Path::new("/dev/nvme0n1p2"), &roots));
        assert!(is_device_node(Path::new("/dev/dm-3"), &roots));
        assert!(is_device_node(Path::new("/dev/mapper/vg0-data"), &roots));
        assert!(!is_device_node(Path::new("/dev/mapper/control"), &roots));
        assert!(!is_device_node(Path::new("/dev/tty1"), &roots));
        assert!(!is_device_node(Path::new("/dev/.udev"), &roots));
        assert!(!is_device_node(Path::new("/dev/disk/by-id/wwn-1"), &roots));
    }

    #[test]
    fn only_arrivals_and_removals_matter() {
        use notify::event::{CreateKind, ModifyKind, RemoveKind};
        assert!(is_relevant_event_kind(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant_event_kind(&EventKind::Remove(RemoveKind::Any)));
        assert!(!is_relevant_event_kind(&EventKind::Modify(ModifyKind::Any)));
    }
}
