//! Durable state
//!
//! Every service writes its state through a [`StateStore`] before an
//! operation is reported as successful, and rebuilds itself from the store on
//! startup. Each [`Collection`] is one JSON document, except the audit
//! trail, which is a JSON-lines log that only ever grows by appends.

use guardrail_core::StoreError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Named documents held by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Intents,
    Principals,
    Leases,
    RollbackPacks,
    RollbackReceipts,
    Rollouts,
    Audit,
    /// State of the simulated deployment target
    Target,
}

impl Collection {
    /// File name used by [`FileStore`]
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Intents => "intents.json",
            Self::Principals => "principals.json",
            Self::Leases => "leases.json",
            Self::RollbackPacks => "rollback_packs.json",
            Self::RollbackReceipts => "rollback_receipts.json",
            Self::Rollouts => "rollouts.json",
            Self::Audit => "audit.jsonl",
            Self::Target => "target.json",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name().split('.').next().unwrap_or_default())
    }
}

/// Whole-document persistence
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Read a collection, `None` if it was never written
    ///
    /// # Errors
    /// Returns an error if the backing medium cannot be read.
    fn load(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace a collection atomically
    ///
    /// # Errors
    /// Returns an error if the document was not durably written.
    fn save(&self, collection: Collection, bytes: &[u8]) -> Result<(), StoreError>;

    /// Append one newline-terminated line to a collection
    ///
    /// # Errors
    /// Returns an error if the line was not durably written.
    fn append(&self, collection: Collection, line: &[u8]) -> Result<(), StoreError>;
}

/// Deserialize a collection
///
/// # Errors
/// Returns an error on I/O failure or malformed content.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    collection: Collection,
) -> Result<Option<T>, StoreError> {
    match store.load(collection)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and save a collection
///
/// # Errors
/// Returns an error on serialization or I/O failure.
pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    collection: Collection,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.save(collection, &bytes)
}

/// Lines of a JSON-lines collection
#[derive(Debug)]
pub struct JsonLines<T> {
    pub items: Vec<T>,
    /// The last line was cut short by an interrupted append and was dropped
    pub torn: bool,
}

/// Deserialize a JSON-lines collection, empty if it was never written
///
/// # Errors
/// Returns an error on I/O failure or a malformed complete line.
pub fn load_json_lines<T: DeserializeOwned>(
    store: &dyn StateStore,
    collection: Collection,
) -> Result<JsonLines<T>, StoreError> {
    let Some(bytes) = store.load(collection)? else {
        return Ok(JsonLines {
            items: Vec::new(),
            torn: false,
        });
    };
    let torn = bytes.last().is_some_and(|b| *b != b'\n');
    let mut lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    // Everything after the final newline: empty, or a torn tail
    lines.pop();
    let items = lines
        .into_iter()
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(serde_json::from_slice)
        .collect::<Result<Vec<T>, _>>()?;
    Ok(JsonLines { items, torn })
}

/// Serialize `value` onto one line and append it
///
/// # Errors
/// Returns an error on serialization or I/O failure.
pub fn append_json_line<T: Serialize>(
    store: &dyn StateStore,
    collection: Collection,
    value: &T,
) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    store.append(collection, &line)
}

/// Serialize every item as JSON lines and replace the collection
///
/// # Errors
/// Returns an error on serialization or I/O failure.
pub fn save_json_lines<T: Serialize>(
    store: &dyn StateStore,
    collection: Collection,
    items: &[T],
) -> Result<(), StoreError> {
    let mut bytes = Vec::new();
    for item in items {
        serde_json::to_writer(&mut bytes, item)?;
        bytes.push(b'\n');
    }
    store.save(collection, &bytes)
}

/// Volatile store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<Collection, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.documents.lock().get(&collection).cloned())
    }

    fn save(&self, collection: Collection, bytes: &[u8]) -> Result<(), StoreError> {
        self.documents.lock().insert(collection, bytes.to_vec());
        Ok(())
    }

    fn append(&self, collection: Collection, line: &[u8]) -> Result<(), StoreError> {
        self.documents
            .lock()
            .entry(collection)
            .or_default()
            .extend_from_slice(line);
        Ok(())
    }
}

/// One JSON file per collection under a state directory.
///
/// Writes go to a temporary file in the same directory which is synced and
/// then renamed over the target, so readers never see a torn document.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a state directory
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// State directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, collection: Collection) -> PathBuf {
        self.dir.join(collection.file_name())
    }
}

impl StateStore for FileStore {
    fn load(&self, collection: Collection) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(collection)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, collection: Collection, bytes: &[u8]) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path(collection)).map_err(|e| e.error)?;
        tracing::trace!(%collection, bytes = bytes.len(), "collection saved");
        Ok(())
    }

    fn append(&self, collection: Collection, line: &[u8]) -> Result<(), StoreError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(collection))?;
        file.write_all(line)?;
        file.sync_data()?;
        tracing::trace!(%collection, bytes = line.len(), "line appended");
        Ok(())
    }
}
