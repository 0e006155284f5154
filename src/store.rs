//! File-backed record store.
//!
//! One directory per collection, one JSON file per document. Collections in
//! use: `resolvers` (one document per [`ResolverConfig`]) and
//! `<resolver_id>/<qtype>` (one [`StoredMessage`] per qname). Writes go
//! through a temp file and rename so readers never observe a torn document.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::StoredMessage;
use crate::resolver::ResolverConfig;

/// Errors surfaced by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested document does not exist. Not a hard failure: lookup
    /// paths treat this as "no answer here".
    #[error("document not found")]
    NotFound,

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A document could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// True for the soft miss, false for hard failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Thread-safe handle to the document store.
///
/// The store is synchronous from the caller's perspective; documents are
/// small and mutations are rare relative to reads.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    root: PathBuf,
    // Serializes mutations against each other and against directory scans.
    lock: RwLock<()>,
}

impl Store {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                lock: RwLock::new(()),
            }),
        })
    }

    /// Persist one document under `collection`/`key`.
    pub fn write<T: Serialize>(
        &self,
        collection: &str,
        key: &str,
        document: &T,
    ) -> Result<(), StoreError> {
        let _guard = self.inner.lock.write();
        let dir = self.collection_path(collection);
        fs::create_dir_all(&dir)?;

        let body = serde_json::to_vec_pretty(document)?;
        let path = dir.join(file_name(key));
        let tmp = dir.join(format!("{}.tmp", file_name(key)));
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &path)?;
        debug!(collection, key, "wrote document");
        Ok(())
    }

    /// Read one document from `collection`/`key`.
    pub fn read<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<T, StoreError> {
        let _guard = self.inner.lock.read();
        let path = self.collection_path(collection).join(file_name(key));
        let body = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Delete one document. Missing documents are reported as
    /// [`StoreError::NotFound`].
    pub fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let _guard = self.inner.lock.write();
        let path = self.collection_path(collection).join(file_name(key));
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Read every document in a collection, sorted by file name. A missing
    /// collection is an empty list; undecodable documents are skipped with a
    /// warning rather than failing the scan.
    pub fn read_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, StoreError> {
        let _guard = self.inner.lock.read();
        let dir = self.collection_path(collection);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let body = fs::read(&path)?;
            match serde_json::from_slice(&body) {
                Ok(document) => documents.push(document),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable document");
                }
            }
        }
        Ok(documents)
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        // Collection names may carry one level of nesting (resolver_id/qtype).
        collection
            .split('/')
            .fold(self.inner.root.clone(), |path, part| {
                path.join(sanitize(part))
            })
    }
}

// Typed accessors for the two document families.
impl Store {
    const RESOLVERS: &'static str = "resolvers";

    /// Index a stored message under every `(resolver, qtype, qname)` it
    /// declares.
    pub fn write_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        for resolver_id in &message.resolvers {
            for question in &message.question {
                self.write(
                    &message_collection(resolver_id, question.qtype),
                    &question.qname,
                    message,
                )?;
            }
        }
        Ok(())
    }

    /// Remove the `(qtype, qname)` index entry of `question[0]` for every
    /// resolver the message declares.
    pub fn delete_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let question = message.question.first().ok_or(StoreError::NotFound)?;
        for resolver_id in &message.resolvers {
            self.delete(
                &message_collection(resolver_id, question.qtype),
                &question.qname,
            )?;
        }
        Ok(())
    }

    /// Look up the canned answer for `(resolver, qtype, qname)`.
    pub fn read_message(
        &self,
        resolver_id: &str,
        qtype: u16,
        qname: &str,
    ) -> Result<StoredMessage, StoreError> {
        self.read(&message_collection(resolver_id, qtype), qname)
    }

    /// Upsert a resolver configuration.
    pub fn write_resolver(&self, resolver: &ResolverConfig) -> Result<(), StoreError> {
        self.write(Self::RESOLVERS, &resolver.id, resolver)
    }

    /// Remove a resolver configuration by id.
    pub fn delete_resolver(&self, id: &str) -> Result<(), StoreError> {
        self.delete(Self::RESOLVERS, id)
    }

    /// Read every persisted resolver configuration, ordered by id.
    pub fn read_resolvers(&self) -> Result<Vec<ResolverConfig>, StoreError> {
        self.read_all(Self::RESOLVERS)
    }
}

fn message_collection(resolver_id: &str, qtype: u16) -> String {
    format!("{resolver_id}/{qtype}")
}

fn file_name(key: &str) -> String {
    format!("{}.json", sanitize(key))
}

// Document keys become file names; path separators must not escape the
// collection directory.
fn sanitize(part: &str) -> String {
    part.replace(['/', '\\'], "_")
}
