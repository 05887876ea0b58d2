//! File watcher that wakes the control loop.
//!
//! Watches the orchestration document, workflow records and activity signals.
//! The execution record is left out: the loop writes it every time it backs
//! off, and waking on its own writes would spin. Edits to it by other tools
//! are seen at the next poll timeout.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use super::init::OrchestratorPaths;
use crate::wakeup::WakeupRegistry;

#[derive(Debug, Clone)]
struct WatchedPaths {
    state_path: PathBuf,
    workflows_dir: PathBuf,
    activity_dir: PathBuf,
}

impl WatchedPaths {
    fn wakes_loop(&self, event: &NotifyEvent) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }
        event.paths.iter().any(|path| {
            path == &self.state_path
                || path.starts_with(&self.workflows_dir)
                || path.starts_with(&self.activity_dir)
        })
    }
}

/// Keeps the watcher alive; dropping it stops the wakeups.
pub struct StateWatcher {
    _watcher: PollWatcher,
}

/// Start watching `paths` and notify `registry` for `orchestration_id`.
pub fn watch_orchestration(
    paths: &OrchestratorPaths,
    orchestration_id: &str,
    registry: Arc<WakeupRegistry>,
    poll_interval: Duration,
) -> Result<StateWatcher> {
    let watched = WatchedPaths {
        state_path: paths.state_path.clone(),
        workflows_dir: paths.workflows_dir.clone(),
        activity_dir: paths.activity_dir.clone(),
    };
    let id = orchestration_id.to_string();
    let filter = watched.clone();
    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| match res {
            Ok(event) if filter.wakes_loop(&event) => {
                debug!(paths = ?event.paths, "state change observed");
                registry.notify(&id);
            }
            Ok(_) => {}
            Err(err) => warn!(err = %err, "file watcher error"),
        },
        notify::Config::default().with_poll_interval(poll_interval),
    )
    .context("create file watcher")?;

    watch_dir(&mut watcher, &paths.state_dir, RecursiveMode::NonRecursive)?;
    watch_dir(&mut watcher, &watched.workflows_dir, RecursiveMode::Recursive)?;
    watch_dir(&mut watcher, &watched.activity_dir, RecursiveMode::Recursive)?;
    Ok(StateWatcher { _watcher: watcher })
}

fn watch_dir(watcher: &mut PollWatcher, dir: &Path, mode: RecursiveMode) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    watcher
        .watch(dir, mode)
        .with_context(|| format!("watch {}", dir.display()))?;
    info!(path = %dir.display(), "watching directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modify_event(path: PathBuf) -> NotifyEvent {
        NotifyEvent {
            kind: EventKind::Modify(notify::event::ModifyKind::Any),
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    fn watched() -> (OrchestratorPaths, WatchedPaths) {
        let paths = OrchestratorPaths::new("/project");
        let watched = WatchedPaths {
            state_path: paths.state_path.clone(),
            workflows_dir: paths.workflows_dir.clone(),
            activity_dir: paths.activity_dir.clone(),
        };
        (paths, watched)
    }

    #[test]
    fn state_and_workflow_changes_wake_the_loop() {
        let (paths, watched) = watched();
        assert!(watched.wakes_loop(&modify_event(paths.state_path.clone())));
        assert!(watched.wakes_loop(&modify_event(paths.workflows_dir.join("wf-1.json"))));
        assert!(watched.wakes_loop(&modify_event(paths.activity_dir.join("orch-1.jsonl"))));
    }

    #[test]
    fn loop_owned_files_do_not_wake_the_loop() {
        let (paths, watched) = watched();
        assert!(!watched.wakes_loop(&modify_event(paths.execution_path.clone())));
        assert!(!watched.wakes_loop(&modify_event(paths.spawn_intent_path.clone())));
        assert!(!watched.wakes_loop(&modify_event(paths.spawn_lock_path.clone())));
    }

    #[test]
    fn access_events_are_ignored() {
        let (paths, watched) = watched();
        let event = NotifyEvent {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![paths.state_path.clone()],
            attrs: Default::default(),
        };
        assert!(!watched.wakes_loop(&event));
    }
}
