//! Session-scoped artifact storage.
//!
//! Every pipeline run gets its own [`Session`] directory under the store's base
//! directory:
//!
//! ```text
//! {base_dir}/session_{id}/{audio,text,translation,cache}/...
//! ```
//!
//! The session records each path it hands out so that [`Session::cleanup`] can
//! remove exactly those files, once. Directories of sessions that were never
//! cleaned up (crashed runs) are reclaimed by [`sweep_expired`].

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SessionError;

const SESSION_DIR_PREFIX: &str = "session_";
const MAX_ID_ATTEMPTS: usize = 8;

/// Subdirectory an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    Audio,
    Text,
    Translation,
    Cache,
}

impl FileCategory {
    pub const ALL: [FileCategory; 4] = [
        FileCategory::Audio,
        FileCategory::Text,
        FileCategory::Translation,
        FileCategory::Cache,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            FileCategory::Audio => "audio",
            FileCategory::Text => "text",
            FileCategory::Translation => "translation",
            FileCategory::Cache => "cache",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            FileCategory::Audio => "wav",
            FileCategory::Text | FileCategory::Translation => "txt",
            FileCategory::Cache => "json",
        }
    }
}

/// Creates sessions under one base directory.
#[derive(Debug, Clone)]
pub struct SessionFileStore {
    base_dir: PathBuf,
    prefix: String,
}

impl SessionFileStore {
    pub fn new(base_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a fresh session directory tree. The session root is created
    /// exclusively, so two concurrent runs can never end up sharing one.
    pub fn new_session(&self) -> Result<Arc<Session>, SessionError> {
        fs::create_dir_all(&self.base_dir).map_err(|source| SessionError::CreateDir {
            path: self.base_dir.clone(),
            source,
        })?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let created_at = Local::now();
            let stamp = created_at.format("%Y%m%d_%H%M%S_%6f").to_string();
            let suffix: u32 = rand::thread_rng().gen();
            let id = format!("{stamp}_{suffix:08x}");
            let root_dir = self.base_dir.join(format!("{SESSION_DIR_PREFIX}{id}"));

            match fs::create_dir(&root_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Session id {} already taken, retrying", id);
                    continue;
                }
                Err(source) => {
                    return Err(SessionError::CreateDir { path: root_dir, source });
                }
            }

            for category in FileCategory::ALL {
                let dir = root_dir.join(category.dir_name());
                fs::create_dir_all(&dir)
                    .map_err(|source| SessionError::CreateDir { path: dir, source })?;
            }

            info!("Created session {} at {}", id, root_dir.display());
            return Ok(Arc::new(Session {
                id,
                created_at,
                stamp,
                root_dir,
                base_dir: self.base_dir.clone(),
                prefix: self.prefix.clone(),
                tracked: Mutex::new(HashSet::new()),
                files_created: AtomicUsize::new(0),
            }));
        }

        Err(SessionError::Exhausted(self.base_dir.clone(), MAX_ID_ATTEMPTS))
    }

    /// Remove every session directory under the base dir older than `max_age`.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        sweep_expired(&self.base_dir, max_age)
    }
}

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Local>,
    pub root_dir: PathBuf,
    pub files_created: usize,
    pub files_tracked: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// One pipeline run's artifact directory and the set of paths it handed out.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Local>,
    stamp: String,
    root_dir: PathBuf,
    base_dir: PathBuf,
    prefix: String,
    tracked: Mutex<HashSet<PathBuf>>,
    files_created: AtomicUsize,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn category_dir(&self, category: FileCategory) -> PathBuf {
        self.root_dir.join(category.dir_name())
    }

    /// Path for one unit's artifact of the given category, tracked for cleanup.
    /// Audio and text artifacts of the same unit share a file stem.
    pub fn path_for(&self, category: FileCategory, unit_index: usize) -> PathBuf {
        let name = format!(
            "{}_{}_{:06}.{}",
            self.prefix,
            self.stamp,
            unit_index,
            category.extension()
        );
        self.track(self.category_dir(category).join(name))
    }

    /// Path for a run-wide artifact (e.g. the translated text), tracked for cleanup.
    pub fn run_path(&self, category: FileCategory) -> PathBuf {
        let name = format!("{}_{}.{}", self.prefix, self.stamp, category.extension());
        self.track(self.category_dir(category).join(name))
    }

    fn track(&self, path: PathBuf) -> PathBuf {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        if tracked.insert(path.clone()) {
            self.files_created.fetch_add(1, Ordering::Relaxed);
        }
        path
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remove one consumed artifact ahead of session cleanup. Returns whether a
    /// file was deleted.
    pub fn release(&self, path: &Path) -> bool {
        let was_tracked = self
            .tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        was_tracked && remove_file_logged(path)
    }

    /// Delete every tracked file that still exists, then the empty category
    /// directories and the session root. Safe to call repeatedly; later calls
    /// find nothing tracked and return 0.
    pub fn cleanup(&self) -> usize {
        let paths: Vec<PathBuf> = {
            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            tracked.drain().collect()
        };

        let removed = paths.iter().filter(|p| remove_file_logged(p)).count();

        for category in FileCategory::ALL {
            remove_dir_if_empty(&self.category_dir(category));
        }
        remove_dir_if_empty(&self.root_dir);

        if removed > 0 {
            info!("Session {}: cleaned up {} file(s)", self.id, removed);
        }
        removed
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            root_dir: self.root_dir.clone(),
            files_created: self.files_created.load(Ordering::Relaxed),
            files_tracked: self.tracked_count(),
        }
    }

    /// Size of everything currently under the session root.
    pub fn disk_usage(&self) -> DiskUsage {
        let mut usage = DiskUsage::default();
        accumulate_usage(&self.root_dir, &mut usage);
        usage
    }

    /// URL for an artifact, relative to the store base dir and mounted under `url_prefix`.
    pub fn web_url(&self, path: &Path, url_prefix: &str) -> Result<String, SessionError> {
        let relative = path
            .strip_prefix(&self.base_dir)
            .map_err(|_| SessionError::OutsideStore(path.to_path_buf()))?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
                _ => return Err(SessionError::OutsideStore(path.to_path_buf())),
            }
        }
        Ok(format!("{}/{}", url_prefix.trim_end_matches('/'), segments.join("/")))
    }
}

/// Remove session directories under `base_dir` whose last modification is at
/// least `max_age` ago. Works on the file system alone, so it also reclaims
/// sessions left behind by crashed runs.
pub fn sweep_expired(base_dir: &Path, max_age: Duration) -> usize {
    let entries = match fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Cannot scan {} for expired sessions: {}", base_dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SESSION_DIR_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove expired session {}: {}", entry.path().display(), e),
        }
    }

    if removed > 0 {
        info!("Swept {} expired session(s) from {}", removed, base_dir.display());
    }
    removed
}

fn remove_file_logged(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

fn remove_dir_if_empty(dir: &Path) {
    let is_empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return,
    };
    if is_empty {
        if let Err(e) = fs::remove_dir(dir) {
            debug!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

fn accumulate_usage(dir: &Path, usage: &mut DiskUsage) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        if metadata.is_dir() {
            accumulate_usage(&entry.path(), usage);
        } else {
            usage.file_count += 1;
            usage.total_bytes += metadata.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn store(dir: &tempfile::TempDir) -> SessionFileStore {
        SessionFileStore::new(dir.path(), "output")
    }

    #[test]
    fn test_new_session_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let session = store(&dir).new_session().unwrap();

        assert!(session.root_dir().starts_with(dir.path()));
        let root_name = session.root_dir().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(root_name, format!("session_{}", session.id()));
        for category in FileCategory::ALL {
            assert!(session.category_dir(category).is_dir());
        }
    }

    #[test]
    fn test_concurrent_sessions_never_share_a_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.new_session().unwrap())
            })
            .collect();
        let roots: HashSet<PathBuf> = handles
            .into_iter()
            .map(|h| h.join().unwrap().root_dir().to_path_buf())
            .collect();
        assert_eq!(roots.len(), 16);
    }

    #[test]
    fn test_path_for_is_predictable_and_tracked_once() {
        let dir = tempfile::tempdir().unwrap();
        let session = store(&dir).new_session().unwrap();

        let audio = session.path_for(FileCategory::Audio, 3);
        let again = session.path_for(FileCategory::Audio, 3);
        let text = session.path_for(FileCategory::Text, 3);

        assert_eq!(audio, again);
        assert_eq!(session.tracked_count(), 2);
        assert_eq!(session.info().files_created, 2);
        assert!(audio.to_string_lossy().ends_with("_000003.wav"));
        assert_eq!(audio.file_stem(), text.file_stem());
        assert!(audio.starts_with(session.category_dir(FileCategory::Audio)));
        assert!(text.starts_with(session.category_dir(FileCategory::Text)));
        assert!(session.is_tracked(&audio));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = store(&dir).new_session().unwrap();

        for i in 0..3 {
            fs::write(session.path_for(FileCategory::Audio, i), b"RIFF").unwrap();
            fs::write(session.path_for(FileCategory::Text, i), b"w:0:1\n").unwrap();
        }
        // Tracked but never written
        session.path_for(FileCategory::Cache, 0);

        assert_eq!(session.cleanup(), 6);
        assert_eq!(session.cleanup(), 0);
        assert!(!session.root_dir().exists());
    }

    #[test]
    fn test_cleanup_leaves_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = store(&dir).new_session().unwrap();

        fs::write(session.path_for(FileCategory::Audio, 0), b"a").unwrap();
        let stray = session.category_dir(FileCategory::Audio).join("stray.wav");
        fs::write(&stray, b"b").unwrap();

        assert_eq!(session.cleanup(), 1);
        assert!(stray.exists());
        assert!(session.root_dir().exists());
    }

    #[test]
    fn test_release_removes_once() {
        let dir = tempfile::tempdir().unwrap();
        let session = store(&dir).new_session().unwrap();
        let path = session.path_for(FileCategory::Audio, 0);
        fs::write(&path, b"a").unwrap();

        assert!(session.release(&path));
        assert!(!path.exists());
        assert!(!session.release(&path));
        assert_eq!(session.cleanup(), 0);
    }

    #[test]
    fn test_sweep_expired_removes_old_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let session = store.new_session().unwrap();
        fs::write(session.path_for(FileCategory::Audio, 0), b"a").unwrap();
        fs::create_dir(dir.path().join("not_a_session")).unwrap();

        assert_eq!(store.sweep_expired(Duration::from_secs(3600)), 0);
        assert!(session.root_dir().exists());

        assert_eq!(store.sweep_expired(Duration::ZERO), 1);
        assert!(!session.root_dir().exists());
        assert!(dir.path().join("not_a_session").exists());

        // The live handle copes with its directory being gone
        assert_eq!(session.cleanup(), 0);
    }

    #[test]
    fn test_sweep_missing_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sweep_expired(&dir.path().join("missing"), Duration::ZERO), 0);
    }

    #[test]
    fn test_web_url_and_disk_usage() {
        let dir = tempfile::tempdir().unwrap();
        let session = store(&dir).new_session().unwrap();
        let path = session.path_for(FileCategory::Audio, 1);
        fs::write(&path, b"12345").unwrap();

        let url = session.web_url(&path, "/audio/").unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(url, format!("/audio/session_{}/audio/{}", session.id(), file_name));

        assert!(session.web_url(Path::new("/etc/passwd"), "/audio").is_err());

        let usage = session.disk_usage();
        assert_eq!(usage.file_count, 1);
        assert_eq!(usage.total_bytes, 5);
    }
}
