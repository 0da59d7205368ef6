use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A filesystem change on a watched path.
#[derive(Clone, Debug)]
pub struct Event {
    pub path: PathBuf,
}

type Subscribers = Arc<RwLock<HashMap<PathBuf, Vec<mpsc::Sender<Event>>>>>;

/// A multiplexed filesystem notifier shared across supervisors: each
/// subscriber registers its own channel per path, and an event on `p`
/// is delivered to every subscriber whose registered path is a prefix
/// of the cleaned `p`.
pub struct FileWatcher {
    inner: Mutex<RecommendedWatcher>,
    watches: Subscribers,
    closed: AtomicBool,
}

impl FileWatcher {
    pub fn new() -> anyhow::Result<Self> {
        let watches: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let dispatch = Arc::clone(&watches);
        let inner =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        if is_metadata_only(&event.kind) {
                            return;
                        }
                        for path in &event.paths {
                            deliver(&dispatch, path);
                        }
                    }
                    Err(err) => warn!(error = %err, "watcher error"),
                }
            })?;
        Ok(Self {
            inner: Mutex::new(inner),
            watches,
            closed: AtomicBool::new(false),
        })
    }

    /// Register `ch` for notifications under `path`. Registering the
    /// same (path, channel) pair twice is a no-op.
    pub fn add(&self, path: &Path, ch: &mpsc::Sender<Event>) -> anyhow::Result<()> {
        let path = clean_path(path);
        let mut watches = self.watches.write();
        let subscribers = watches.entry(path.clone()).or_default();
        if subscribers.iter().any(|c| c.same_channel(ch)) {
            return Ok(());
        }
        if subscribers.is_empty() {
            self.inner.lock().watch(&path, RecursiveMode::NonRecursive)?;
        }
        subscribers.push(ch.clone());
        Ok(())
    }

    /// Detach `ch` from `path`, removing exactly one entry. The OS
    /// watch is released once no subscriber remains.
    pub fn remove(&self, path: &Path, ch: &mpsc::Sender<Event>) {
        let path = clean_path(path);
        let mut watches = self.watches.write();
        if let Some(subscribers) = watches.get_mut(&path) {
            if let Some(i) = subscribers.iter().position(|c| c.same_channel(ch)) {
                subscribers.remove(i);
            }
            if subscribers.is_empty() {
                watches.remove(&path);
                let _ = self.inner.lock().unwatch(&path);
            }
        }
    }

    /// Release every OS-level watch. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut watches = self.watches.write();
        let mut inner = self.inner.lock();
        for path in watches.keys() {
            let _ = inner.unwatch(path);
        }
        watches.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn deliver(watches: &Subscribers, path: &Path) {
    let cleaned = clean_path(path);
    let watches = watches.read();
    for (key, subscribers) in watches.iter() {
        if !cleaned.starts_with(key) {
            continue;
        }
        for ch in subscribers {
            match ch.try_send(Event {
                path: cleaned.clone(),
            }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // The subscriber debounces; a dropped event is fine.
                    debug!(path = %cleaned.display(), "unable to notify");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Events whose only effect is a permission or metadata change carry
/// no content the supervisor cares about.
fn is_metadata_only(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

/// Lexically normalize a path: drop `.` components, resolve `..`.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{MetadataKind, ModifyKind};
    use std::time::Duration;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("a/./b")), PathBuf::from("a/b"));
        assert_eq!(clean_path(Path::new("")), PathBuf::from("."));
    }

    #[test]
    fn test_metadata_only_kinds_are_suppressed() {
        assert!(is_metadata_only(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_metadata_only(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_metadata_only(&EventKind::Create(
            notify::event::CreateKind::File
        )));
    }

    #[tokio::test]
    async fn test_add_same_channel_twice_is_noop() {
        let watcher = FileWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);

        watcher.add(dir.path(), &tx).unwrap();
        watcher.add(dir.path(), &tx).unwrap();

        assert_eq!(
            watcher.watches.read().get(&clean_path(dir.path())).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_events_reach_prefix_subscribers() {
        let watcher = FileWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        watcher.add(dir.path(), &tx).unwrap();

        let file = dir.path().join("index.html");
        std::fs::write(&file, "<html></html>").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        assert!(event.path.starts_with(clean_path(dir.path())));
    }

    #[tokio::test]
    async fn test_removed_subscriber_gets_nothing() {
        let watcher = FileWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        watcher.add(dir.path(), &tx).unwrap();
        watcher.remove(dir.path(), &tx);

        std::fs::write(dir.path().join("late.txt"), "x").unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(result.is_err(), "expected no delivery after removal");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let watcher = FileWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        watcher.add(dir.path(), &tx).unwrap();

        watcher.close();
        watcher.close();
        assert!(watcher.is_closed());
        assert!(watcher.watches.read().is_empty());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_absorbed() {
        let watcher = FileWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(4);
        watcher.add(dir.path(), &tx).unwrap();
        drop(rx);

        // Must not panic or wedge the dispatcher.
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
