//! On-disk recording store
//!
//! Layout: `root/<path_prefix>/<fingerprint>/{key.json, meta.json, response.content}`.
//! A recording is complete once `meta.json` and a content artifact exist.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::fingerprint::{CanonicalKey, Fingerprint};
use crate::{Result, TapedeckError};

use super::meta::Meta;
use super::{LookupScope, CONTENT_FILE, KEY_FILE, LEGACY_CONTENT_FILE, META_FILE};

/// Handle to one recording directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingHandle {
    dir: PathBuf,
}

impl RecordingHandle {
    /// Wrap an existing directory path
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Recording directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `meta.json`
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// Path the content artifact is written to
    #[must_use]
    pub fn content_path(&self) -> PathBuf {
        self.dir.join(CONTENT_FILE)
    }

    /// Path of `key.json`
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Content artifact to replay from, accepting the legacy `content` name
    pub async fn content_artifact(&self) -> Option<PathBuf> {
        for name in [CONTENT_FILE, LEGACY_CONTENT_FILE] {
            let path = self.dir.join(name);
            if is_file(&path).await {
                return Some(path);
            }
        }
        None
    }

    /// First required artifact that is absent, if any
    pub async fn missing_artifact(&self) -> Option<&'static str> {
        if !is_file(&self.meta_path()).await {
            return Some(META_FILE);
        }
        if self.content_artifact().await.is_none() {
            return Some(CONTENT_FILE);
        }
        None
    }

    /// Whether both `meta.json` and a content artifact are present
    pub async fn exists(&self) -> bool {
        self.missing_artifact().await.is_none()
    }

    /// Read the response envelope
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::IncompleteRecording`] if `meta.json` is gone,
    /// or a storage/format error otherwise
    pub async fn read_meta(&self) -> Result<Meta> {
        let bytes = fs::read(self.meta_path())
            .await
            .map_err(|e| self.missing_or_storage(e, META_FILE))?;
        Meta::from_json(&bytes)
    }

    /// Open the content artifact for reading
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::IncompleteRecording`] if no content artifact exists
    pub async fn open_content(&self) -> Result<File> {
        let path = self
            .content_artifact()
            .await
            .ok_or_else(|| self.incomplete(CONTENT_FILE))?;
        File::open(path)
            .await
            .map_err(|e| self.missing_or_storage(e, CONTENT_FILE))
    }

    /// Read the stored key bytes
    ///
    /// # Errors
    ///
    /// Returns error if `key.json` cannot be read
    pub async fn read_key(&self) -> Result<Vec<u8>> {
        Ok(fs::read(self.key_path()).await?)
    }

    /// Create (or truncate) the content artifact for writing
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created
    pub async fn create_content(&self) -> Result<File> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.content_path())
            .await?;
        Ok(file)
    }

    /// Remove `meta.json` so the recording reads as incomplete
    ///
    /// # Errors
    ///
    /// Returns error if the file exists and cannot be removed
    pub async fn invalidate(&self) -> Result<()> {
        match fs::remove_file(self.meta_path()).await {
            Ok(()) => {
                debug!("Invalidated previous recording at {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the response envelope, replacing any previous one atomically
    ///
    /// # Errors
    ///
    /// Returns error if the write or rename fails
    pub async fn write_meta(&self, meta: &Meta) -> Result<()> {
        let tmp = self.dir.join(format!("{META_FILE}.tmp"));
        write_synced(&tmp, &meta.to_json()?).await?;
        fs::rename(&tmp, self.meta_path()).await?;
        Ok(())
    }

    /// Persist the canonical key bytes
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub async fn write_key(&self, key: &[u8]) -> Result<()> {
        write_synced(&self.key_path(), key).await
    }

    fn incomplete(&self, artifact: &'static str) -> TapedeckError {
        TapedeckError::IncompleteRecording {
            dir: self.dir.clone(),
            artifact,
        }
    }

    fn missing_or_storage(&self, err: io::Error, artifact: &'static str) -> TapedeckError {
        if err.kind() == io::ErrorKind::NotFound {
            self.incomplete(artifact)
        } else {
            err.into()
        }
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

/// Outcome of locating a recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A complete recording
    Complete(RecordingHandle),
    /// A directory matched but an artifact is missing
    Incomplete {
        /// Matched directory
        handle: RecordingHandle,
        /// File name of the first missing artifact
        artifact: &'static str,
    },
    /// Nothing matched
    Missing,
}

/// Recording directory found by [`RecordingStore::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEntry {
    /// Path namespace relative to the store root
    pub path_prefix: String,
    /// Directory fingerprint
    pub fingerprint: Fingerprint,
    /// Whether the recording can be replayed
    pub complete: bool,
    /// Recording directory
    pub dir: PathBuf,
}

/// Content-addressed store of recordings under one root directory
#[derive(Debug, Clone)]
pub struct RecordingStore {
    root: PathBuf,
    scope: LookupScope,
    verify_key: bool,
}

impl RecordingStore {
    /// Create a store rooted at `root`, with path-scoped lookup
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scope: LookupScope::default(),
            verify_key: false,
        }
    }

    /// Set the lookup scope
    #[must_use]
    pub fn with_scope(mut self, scope: LookupScope) -> Self {
        self.scope = scope;
        self
    }

    /// Require stored key bytes to equal the request's key on lookup
    #[must_use]
    pub fn with_key_verification(mut self, verify_key: bool) -> Self {
        self.verify_key = verify_key;
        self
    }

    /// Store root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lookup scope in effect
    #[must_use]
    pub fn scope(&self) -> LookupScope {
        self.scope
    }

    /// Directory for a recording, without touching the filesystem
    ///
    /// # Errors
    ///
    /// Returns [`TapedeckError::InvalidRequest`] if the prefix escapes the root
    pub fn recording_dir(&self, path_prefix: &str, fingerprint: Fingerprint) -> Result<PathBuf> {
        let mut dir = self.root.clone();
        for component in prefix_components(path_prefix)? {
            dir.push(component);
        }
        dir.push(fingerprint.to_hex());
        Ok(dir)
    }

    /// Ensure the recording directory exists and return its handle
    ///
    /// # Errors
    ///
    /// Returns error if the prefix is invalid or the directory cannot be made
    pub async fn create(
        &self,
        path_prefix: &str,
        fingerprint: Fingerprint,
    ) -> Result<RecordingHandle> {
        let dir = self.recording_dir(path_prefix, fingerprint)?;
        fs::create_dir_all(&dir).await?;
        Ok(RecordingHandle::new(dir))
    }

    /// Find a complete recording for a key
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub async fn lookup(
        &self,
        path_prefix: &str,
        key: &CanonicalKey,
    ) -> Result<Option<RecordingHandle>> {
        match self.locate(path_prefix, key).await? {
            Lookup::Complete(handle) => Ok(Some(handle)),
            Lookup::Incomplete { .. } | Lookup::Missing => Ok(None),
        }
    }

    /// Find a recording for a key, reporting incomplete matches
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub async fn locate(&self, path_prefix: &str, key: &CanonicalKey) -> Result<Lookup> {
        let candidates = match self.scope {
            LookupScope::Path => {
                let dir = self.recording_dir(path_prefix, key.fingerprint)?;
                if fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
                    vec![dir]
                } else {
                    Vec::new()
                }
            }
            LookupScope::Store => self.find_dirs_named(key.fingerprint).await?,
        };

        let mut first_incomplete = None;
        for dir in candidates {
            let handle = RecordingHandle::new(dir);
            if let Some(artifact) = handle.missing_artifact().await {
                first_incomplete.get_or_insert(Lookup::Incomplete { handle, artifact });
                continue;
            }
            if self.verify_key && !self.key_matches(&handle, key).await {
                continue;
            }
            return Ok(Lookup::Complete(handle));
        }

        Ok(first_incomplete.unwrap_or(Lookup::Missing))
    }

    async fn key_matches(&self, handle: &RecordingHandle, key: &CanonicalKey) -> bool {
        match handle.read_key().await {
            Ok(stored) if stored == key.bytes => true,
            Ok(_) => {
                warn!(
                    "Fingerprint {} collides with a different key in {}",
                    key.fingerprint,
                    handle.dir().display()
                );
                false
            }
            Err(e) => {
                warn!("Cannot verify key in {}: {}", handle.dir().display(), e);
                false
            }
        }
    }

    async fn find_dirs_named(&self, fingerprint: Fingerprint) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        let name = fingerprint.to_hex();
        tokio::task::spawn_blocking(move || walk_dirs(&root, |dir_name, _| dir_name == name))
            .await
            .map_err(|e| TapedeckError::Other(format!("Store walk panicked: {e}")))?
    }

    /// Enumerate every recording directory under the root
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failure
    pub async fn list(&self) -> Result<Vec<RecordingEntry>> {
        let root = self.root.clone();
        let dirs = tokio::task::spawn_blocking(move || {
            walk_dirs(&root, |dir_name, path| {
                dir_name.parse::<Fingerprint>().is_ok() && has_any_artifact(path)
            })
        })
        .await
        .map_err(|e| TapedeckError::Other(format!("Store walk panicked: {e}")))??;

        let mut entries = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let Some(fingerprint) = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<Fingerprint>().ok())
            else {
                continue;
            };
            let path_prefix = dir
                .parent()
                .and_then(|p| p.strip_prefix(&self.root).ok())
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();
            let complete = RecordingHandle::new(dir.clone()).exists().await;
            entries.push(RecordingEntry {
                path_prefix,
                fingerprint,
                complete,
                dir,
            });
        }
        Ok(entries)
    }
}

fn has_any_artifact(dir: &Path) -> bool {
    [META_FILE, CONTENT_FILE, LEGACY_CONTENT_FILE, KEY_FILE]
        .iter()
        .any(|name| dir.join(name).is_file())
}

fn walk_dirs<F>(root: &Path, mut keep: F) -> Result<Vec<PathBuf>>
where
    F: FnMut(&str, &Path) -> bool,
{
    let mut found = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(e) => return Err(io::Error::from(e).into()),
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if keep(name, entry.path()) {
                found.push(entry.path().to_path_buf());
            }
        }
    }
    Ok(found)
}

/// Split a path prefix into directory components
///
/// # Errors
///
/// Returns error if any component could escape the store root
fn prefix_components(path_prefix: &str) -> Result<Vec<&str>> {
    if path_prefix.contains('\0') {
        return Err(TapedeckError::InvalidRequest(
            "Path cannot contain null bytes".to_string(),
        ));
    }

    if path_prefix.contains('\\') {
        return Err(TapedeckError::InvalidRequest(
            "Path cannot contain backslashes".to_string(),
        ));
    }

    let components: Vec<&str> = path_prefix.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == "..") {
        return Err(TapedeckError::InvalidRequest(format!(
            "Path cannot contain '.' or '..' segments: {path_prefix}"
        )));
    }

    Ok(components)
}

/// Store namespace for a request path: decoded, without the leading `/`
///
/// # Errors
///
/// Returns error if the decoded path could escape the store root
pub fn path_prefix(request_path: &str) -> Result<String> {
    let decoded = urlencoding::decode(request_path)
        .map_err(|e| TapedeckError::InvalidRequest(format!("Path is not valid UTF-8: {e}")))?;
    let prefix = decoded.strip_prefix('/').unwrap_or(&decoded).to_string();
    prefix_components(&prefix)?;
    Ok(prefix)
}
