//! `FromFiles`: file-path watcher. Multiple inputs may share one watched
//! path; the watch is removed once its last subscriber unsubscribes.

use crate::error::{PubSubError, Result};
use crate::registered::RegisteredInputs;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct WatchedPath {
    _watcher: RecommendedWatcher,
    subscribers: Vec<String>,
}

/// Fans filesystem change events out to every input subscribed to the
/// changed path.
pub struct FromFiles {
    inputs: Arc<RegisteredInputs>,
    watched: Mutex<HashMap<PathBuf, WatchedPath>>,
}

impl FromFiles {
    #[must_use]
    pub fn new(inputs: Arc<RegisteredInputs>) -> Arc<Self> {
        Arc::new(Self {
            inputs,
            watched: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve `path`: `~`-prefixed paths expand against the current user's
    /// home, relative paths are made absolute against the current directory.
    #[must_use]
    pub fn resolve_path(path: &str) -> PathBuf {
        let expanded = if let Some(rest) = path.strip_prefix('~') {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.join(rest.trim_start_matches('/'))
        } else {
            PathBuf::from(path)
        };

        if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(expanded)
        }
    }

    /// Subscribe `input_id` to changes on `path`, starting a watcher if this
    /// is the path's first subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::SourceUnavailable`] if `path` does not exist,
    /// or if the underlying watcher cannot be started.
    pub fn subscribe(self: &Arc<Self>, input_id: &str, path: &str) -> Result<PathBuf> {
        let resolved = Self::resolve_path(path);
        if !resolved.exists() {
            return Err(PubSubError::SourceUnavailable(resolved.display().to_string()));
        }

        let mut watched = self.watched.lock().expect("watched paths poisoned");
        if let Some(entry) = watched.get_mut(&resolved) {
            if !entry.subscribers.iter().any(|id| id == input_id) {
                entry.subscribers.push(input_id.to_string());
            }
            return Ok(resolved);
        }

        let this = self.clone();
        let watched_path = resolved.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            if let Ok(event) = result {
                if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    this.dispatch(&watched_path);
                }
            }
        })
        .map_err(|e| PubSubError::SourceUnavailable(e.to_string()))?;
        watcher
            .watch(&resolved, RecursiveMode::NonRecursive)
            .map_err(|e| PubSubError::SourceUnavailable(e.to_string()))?;

        watched.insert(
            resolved.clone(),
            WatchedPath {
                _watcher: watcher,
                subscribers: vec![input_id.to_string()],
            },
        );
        Ok(resolved)
    }

    /// Unsubscribe `input_id` from `path`. The watcher is dropped once its
    /// last subscriber leaves.
    pub fn unsubscribe(&self, input_id: &str, path: &str) {
        let resolved = Self::resolve_path(path);
        let mut watched = self.watched.lock().expect("watched paths poisoned");
        if let Some(entry) = watched.get_mut(&resolved) {
            entry.subscribers.retain(|id| id != input_id);
            if entry.subscribers.is_empty() {
                watched.remove(&resolved);
            }
        }
    }

    fn dispatch(&self, path: &Path) {
        let subscribers = {
            let watched = self.watched.lock().expect("watched paths poisoned");
            watched.get(path).map(|entry| entry.subscribers.clone())
        };
        let Some(subscribers) = subscribers else {
            return;
        };
        let path_str = path.display().to_string();
        for input_id in subscribers {
            self.inputs.notify_input_handler(&input_id, "", &path_str);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{DataType, Input};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn subscribe_fails_for_nonexistent_path() {
        let inputs = Arc::new(RegisteredInputs::new("test", "pub1"));
        let source = FromFiles::new(inputs);
        assert!(source.subscribe("n1.img.0", "/nonexistent/path/img.jpg").is_err());
    }

    #[test]
    fn scenario_s6_file_write_triggers_handler_with_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("img.jpg");
        std::fs::write(&file_path, b"initial").unwrap();

        let inputs = Arc::new(RegisteredInputs::new("test", "pub1"));
        let count = StdArc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        inputs
            .create(
                Input::new("n1", "n1", "img", "0", DataType::Bytes),
                Some(std::sync::Arc::new(move |_input, sender: &str, _value: &str| {
                    assert_eq!(sender, "");
                    count_clone.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let source = FromFiles::new(inputs);
        let resolved = source
            .subscribe("n1.img.0", file_path.to_str().unwrap())
            .unwrap();
        assert!(resolved.is_absolute());

        let mut file = std::fs::OpenOptions::new().write(true).open(&file_path).unwrap();
        writeln!(file, "changed").unwrap();
        drop(file);

        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn unsubscribe_removes_watch_on_last_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("img.jpg");
        std::fs::write(&file_path, b"initial").unwrap();

        let inputs = Arc::new(RegisteredInputs::new("test", "pub1"));
        let source = FromFiles::new(inputs);
        source
            .subscribe("n1.img.0", file_path.to_str().unwrap())
            .unwrap();
        source.unsubscribe("n1.img.0", file_path.to_str().unwrap());
        assert!(source.watched.lock().unwrap().is_empty());
    }

    #[test]
    fn resolve_path_expands_tilde_against_home() {
        if let Some(home) = dirs::home_dir() {
            let resolved = FromFiles::resolve_path("~/img.jpg");
            assert_eq!(resolved, home.join("img.jpg"));
        }
    }
}
