//! Live filesystem watcher feeding the episode recorder.
//!
//! notify delivers events on its own thread; each translated event is handed
//! to the tokio runtime as an independent task. Recording runs on the blocking
//! pool behind a semaphore, so a slow append never holds up event delivery.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::authorizer::PathAuthorizer;
use crate::episode::Episode;
use crate::recorder::EpisodeRecorder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    Created { path: PathBuf, is_dir: bool },
    Modified { path: PathBuf, is_dir: bool },
    Deleted { path: PathBuf, is_dir: bool },
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Created { path, .. } | FsEvent::Modified { path, .. } | FsEvent::Deleted { path, .. } => path,
        }
    }
}

#[derive(Debug)]
pub enum EventOutcome {
    Recorded(Episode),
    Denied,
    Ignored,
    Failed,
}

/// Map a raw notify event onto the three events the recorder understands.
pub fn translate(event: &Event) -> Vec<FsEvent> {
    let created = |path: &PathBuf, hint: Option<bool>| FsEvent::Created {
        path: path.clone(),
        is_dir: hint.unwrap_or_else(|| path.is_dir()),
    };
    let deleted = |path: &PathBuf, is_dir: bool| FsEvent::Deleted { path: path.clone(), is_dir };

    match &event.kind {
        EventKind::Create(kind) => {
            let hint = match kind {
                CreateKind::Folder => Some(true),
                CreateKind::File => Some(false),
                _ => None,
            };
            event.paths.iter().map(|p| created(p, hint)).collect()
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [from, to, ..]) => vec![deleted(from, to.is_dir()), created(to, None)],
            (RenameMode::From, paths) => paths.iter().map(|p| deleted(p, false)).collect(),
            (RenameMode::To, paths) => paths.iter().map(|p| created(p, None)).collect(),
            // Backends that cannot pair renames report each side on its own; what
            // is still on disk was the target.
            (_, paths) => paths
                .iter()
                .map(|p| if p.exists() { created(p, None) } else { deleted(p, false) })
                .collect(),
        },
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| FsEvent::Modified { path: p.clone(), is_dir: p.is_dir() })
            .collect(),
        EventKind::Remove(kind) => {
            let is_dir = matches!(kind, RemoveKind::Folder);
            event.paths.iter().map(|p| deleted(p, is_dir)).collect()
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Apply one event. Denied paths are dropped silently; failures end in a log line.
pub fn handle_event(authorizer: &PathAuthorizer, recorder: &EpisodeRecorder, event: &FsEvent) -> EventOutcome {
    let path = event.path();
    if !authorizer.is_allowed(path) {
        debug!(path = %path.display(), "event outside allowed roots");
        return EventOutcome::Denied;
    }
    let parent = path.parent().unwrap_or(path);
    let result = match event {
        FsEvent::Created { is_dir: true, .. } => recorder.record_directory(path, Some(parent)),
        FsEvent::Created { is_dir: false, .. } | FsEvent::Modified { is_dir: false, .. } => recorder.record_file(path, parent),
        FsEvent::Modified { is_dir: true, .. } => return EventOutcome::Ignored,
        FsEvent::Deleted { .. } => recorder.record_deletion(path),
    };
    match EpisodeRecorder::log_outcome(result) {
        Some(episode) => EventOutcome::Recorded(episode),
        None => EventOutcome::Failed,
    }
}

/// Hands events to the runtime, at most `workers` recordings at a time.
///
/// Only the number of concurrent recordings is bounded. Every dispatched
/// event becomes a task right away, so a burst of events queues up as tasks
/// waiting on a permit.
#[derive(Clone)]
pub struct EventDispatcher {
    authorizer: Arc<PathAuthorizer>,
    recorder: Arc<EpisodeRecorder>,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl EventDispatcher {
    pub fn new(authorizer: Arc<PathAuthorizer>, recorder: Arc<EpisodeRecorder>, workers: usize, runtime: Handle) -> Self {
        Self { authorizer, recorder, permits: Arc::new(Semaphore::new(workers.max(1))), runtime }
    }

    pub fn dispatch(&self, event: FsEvent) -> tokio::task::JoinHandle<Option<EventOutcome>> {
        let this = self.clone();
        self.runtime.spawn(async move {
            let _permit = this.permits.clone().acquire_owned().await.ok()?;
            let (authorizer, recorder) = (this.authorizer.clone(), this.recorder.clone());
            match tokio::task::spawn_blocking(move || handle_event(&authorizer, &recorder, &event)).await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    error!(error = %err, "recording task panicked");
                    None
                }
            }
        })
    }
}

/// Owns the notify watcher and the thread draining its channel.
pub struct LiveWatcher {
    _watcher: RecommendedWatcher,
    _pump: thread::JoinHandle<()>,
}

impl LiveWatcher {
    pub fn start(roots: &[PathBuf], dispatcher: EventDispatcher) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(tx).context("creating filesystem watcher")?;
        for root in roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => info!(root = %root.display(), "watching"),
                Err(err) => warn!(root = %root.display(), error = %err, "cannot watch root"),
            }
        }

        let pump = thread::Builder::new()
            .name("fs-watcher".into())
            .spawn(move || {
                for res in rx {
                    match res {
                        Ok(event) => {
                            for fs_event in translate(&event) {
                                dispatcher.dispatch(fs_event);
                            }
                        }
                        Err(err) => warn!(error = %err, "watch error"),
                    }
                }
                debug!("watcher channel closed");
            })
            .context("spawning watcher thread")?;

        Ok(Self { _watcher: watcher, _pump: pump })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeKind;
    use crate::recorder::tests::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        store: Arc<MemoryStore>,
        auth: Arc<PathAuthorizer>,
        rec: Arc<EpisodeRecorder>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap().join("data");
        std::fs::create_dir_all(&root).unwrap();
        let store = Arc::new(MemoryStore::default());
        let rec = Arc::new(EpisodeRecorder::new(store.clone()));
        let auth = Arc::new(PathAuthorizer::new(vec![root.clone()]));
        Fixture { _temp: temp, root, store, auth, rec }
    }

    #[test]
    fn translate_maps_core_kinds() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("d");
        std::fs::create_dir(&dir).unwrap();
        let file = temp.path().join("f.txt");

        let create_dir = Event::new(EventKind::Create(CreateKind::Any)).add_path(dir.clone());
        assert_eq!(translate(&create_dir), vec![FsEvent::Created { path: dir.clone(), is_dir: true }]);

        let create_file = Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone());
        assert_eq!(translate(&create_file), vec![FsEvent::Created { path: file.clone(), is_dir: false }]);

        let remove = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(dir.clone());
        assert_eq!(translate(&remove), vec![FsEvent::Deleted { path: dir, is_dir: true }]);

        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(file);
        assert!(translate(&access).is_empty());
    }

    #[test]
    fn rename_becomes_delete_then_create() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("old.txt");
        let to = temp.path().join("new.txt");
        std::fs::write(&to, b"x").unwrap();

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(from.clone())
            .add_path(to.clone());
        assert_eq!(
            translate(&rename),
            vec![FsEvent::Deleted { path: from, is_dir: false }, FsEvent::Created { path: to, is_dir: false }]
        );
    }

    #[test]
    fn unpaired_rename_halves_map_to_delete_or_create() {
        let temp = TempDir::new().unwrap();
        let gone = temp.path().join("gone.txt");
        let here = temp.path().join("here");
        std::fs::create_dir(&here).unwrap();

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path(gone.clone());
        assert_eq!(translate(&from), vec![FsEvent::Deleted { path: gone.clone(), is_dir: false }]);

        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(here.clone());
        assert_eq!(translate(&to), vec![FsEvent::Created { path: here.clone(), is_dir: true }]);

        let any = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(gone.clone())
            .add_path(here.clone());
        assert_eq!(
            translate(&any),
            vec![FsEvent::Deleted { path: gone, is_dir: false }, FsEvent::Created { path: here, is_dir: true }]
        );
    }

    #[test]
    fn created_file_and_directory_are_recorded() {
        let f = fixture();
        let sub = f.root.join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = f.root.join("a.txt");
        std::fs::write(&file, b"abc").unwrap();

        assert!(matches!(
            handle_event(&f.auth, &f.rec, &FsEvent::Created { path: sub, is_dir: true }),
            EventOutcome::Recorded(ref e) if e.kind == EpisodeKind::Directory
        ));
        assert!(matches!(
            handle_event(&f.auth, &f.rec, &FsEvent::Created { path: file, is_dir: false }),
            EventOutcome::Recorded(ref e) if e.kind == EpisodeKind::File
        ));
        assert_eq!(f.store.episodes.lock().unwrap().len(), 2);
    }

    #[test]
    fn directory_modification_is_ignored() {
        let f = fixture();
        let outcome = handle_event(&f.auth, &f.rec, &FsEvent::Modified { path: f.root.clone(), is_dir: true });
        assert!(matches!(outcome, EventOutcome::Ignored));
        assert!(f.store.episodes.lock().unwrap().is_empty());
    }

    #[test]
    fn events_outside_roots_are_dropped() {
        let f = fixture();
        let outside = TempDir::new().unwrap();
        let stray = outside.path().join("stray.txt");
        std::fs::write(&stray, b"x").unwrap();

        for event in [
            FsEvent::Created { path: stray.clone(), is_dir: false },
            FsEvent::Modified { path: stray.clone(), is_dir: false },
            FsEvent::Deleted { path: stray, is_dir: false },
        ] {
            assert!(matches!(handle_event(&f.auth, &f.rec, &event), EventOutcome::Denied));
        }
        assert!(f.store.episodes.lock().unwrap().is_empty());
    }

    #[test]
    fn deletion_is_recorded_even_when_path_never_existed() {
        let f = fixture();
        let ghost = f.root.join("ghost.txt");
        let outcome = handle_event(&f.auth, &f.rec, &FsEvent::Deleted { path: ghost.clone(), is_dir: false });
        let EventOutcome::Recorded(ep) = outcome else { panic!("expected a deletion episode") };
        let marker = ep.deletion_marker().unwrap();
        assert_eq!(marker.path, ghost.display().to_string());
        assert!(marker.deleted);
    }

    #[test]
    fn modification_of_vanished_file_fails_quietly() {
        let f = fixture();
        let outcome = handle_event(&f.auth, &f.rec, &FsEvent::Modified { path: f.root.join("gone.txt"), is_dir: false });
        assert!(matches!(outcome, EventOutcome::Failed));
        assert!(f.store.episodes.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatcher_runs_events_independently() {
        let f = fixture();
        let dispatcher = EventDispatcher::new(f.auth.clone(), f.rec.clone(), 2, Handle::current());
        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(dispatcher.dispatch(FsEvent::Deleted { path: f.root.join(format!("f{}.txt", i)), is_dir: false }));
        }
        for h in handles {
            assert!(matches!(h.await.unwrap(), Some(EventOutcome::Recorded(_))));
        }
        assert_eq!(f.store.episodes.lock().unwrap().len(), 8);
    }

    /// Scan, modify, delete: the history for the path only ever grows.
    #[test]
    fn scan_then_watch_history_is_append_only() {
        let f = fixture();
        let file = f.root.join("a.txt");
        std::fs::write(&file, vec![b'x'; 10]).unwrap();

        let report = crate::scanner::scan(&[f.root.clone()], &f.auth, &f.rec);
        assert_eq!(report.files, 1);

        std::fs::write(&file, vec![b'y'; 20]).unwrap();
        handle_event(&f.auth, &f.rec, &FsEvent::Modified { path: file.clone(), is_dir: false });
        std::fs::remove_file(&file).unwrap();
        handle_event(&f.auth, &f.rec, &FsEvent::Deleted { path: file.clone(), is_dir: false });

        let eps = f.store.episodes.lock().unwrap();
        assert_eq!(eps.len(), 3);
        assert_eq!(eps[0].name, "File_a.txt");
        assert_eq!(eps[0].file_entity().unwrap().size, 10);
        assert_eq!(eps[1].file_entity().unwrap().size, 20);
        let marker = eps[2].deletion_marker().unwrap();
        assert_eq!(marker.path, file.display().to_string());
        assert!(marker.deleted);
    }

    async fn wait_for(store: &MemoryStore, found: impl Fn(&[Episode]) -> bool) -> bool {
        for _ in 0..100 {
            {
                let eps = store.episodes.lock().unwrap();
                if found(eps.as_slice()) {
                    return true;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_watcher_records_changes_under_root() {
        let f = fixture();
        let dispatcher = EventDispatcher::new(f.auth.clone(), f.rec.clone(), 2, Handle::current());
        let watcher = LiveWatcher::start(&[f.root.clone()], dispatcher).unwrap();

        let file = f.root.join("live.txt");
        let path = file.display().to_string();
        std::fs::write(&file, b"first").unwrap();
        assert!(wait_for(&f.store, |eps| eps.iter().any(|e| e.kind == EpisodeKind::File && e.path == path)).await);

        std::fs::write(&file, b"second, longer").unwrap();
        assert!(
            wait_for(&f.store, |eps| eps
                .iter()
                .filter_map(Episode::file_entity)
                .any(|fe| fe.path == path && fe.size == 14))
            .await
        );

        std::fs::remove_file(&file).unwrap();
        assert!(
            wait_for(&f.store, |eps| eps
                .iter()
                .filter_map(Episode::deletion_marker)
                .any(|m| m.path == path && m.deleted))
            .await
        );
        drop(watcher);
    }
}
