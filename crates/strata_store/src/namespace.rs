//! Named key-value namespaces for the environment indices.
//!
//! The environment indices (the by-file list and the by-unit metadata map)
//! live in dedicated sub-namespaces of the store's key space: a named
//! database in the shared environment, or a single serialized map file for
//! the file backend. Values are small and stored uncompressed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use heed3::types::Bytes;
use heed3::Database;

use crate::error::StoreError;
use crate::store::{BackendKind, Store};

enum Inner {
    Db {
        db: Database<Bytes, Bytes>,
    },
    File {
        path: PathBuf,
        map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
        dirty: AtomicBool,
    },
}

/// One named index namespace, opened once and kept for the session.
pub struct IndexStore {
    store: Arc<Store>,
    name: String,
    inner: OnceLock<Result<Inner, String>>,
}

impl IndexStore {
    /// Opens (creating if necessary) the namespace `name` on `store`.
    ///
    /// The backing storage is initialized lazily on first access, mirroring
    /// the lazy open of the record database itself.
    pub fn open(store: Arc<Store>, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
            inner: OnceLock::new(),
        }
    }

    fn inner(&self) -> Result<&Inner, StoreError> {
        let slot = self.inner.get_or_init(|| match self.store.kind() {
            BackendKind::Database => {
                let env = self.store.db()?;
                let mut wtxn = env.env().write_txn().map_err(|e| e.to_string())?;
                let db = env
                    .env()
                    .create_database(&mut wtxn, Some(self.name.as_str()))
                    .map_err(|e| e.to_string())?;
                wtxn.commit().map_err(|e| e.to_string())?;
                Ok(Inner::Db { db })
            }
            BackendKind::Files => {
                let path = self.store.base().join(format!("{}.idx", self.name));
                let map = match std::fs::read(&path) {
                    Ok(bytes) => {
                        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                            .map(|(map, _)| map)
                            .unwrap_or_else(|e| {
                                log::warn!(
                                    "discarding unreadable index {}: {e}",
                                    path.display()
                                );
                                HashMap::new()
                            })
                    }
                    Err(_) => HashMap::new(),
                };
                Ok(Inner::File {
                    path,
                    map: Mutex::new(map),
                    dirty: AtomicBool::new(false),
                })
            }
        });
        match slot {
            Ok(inner) => Ok(inner),
            Err(reason) => Err(StoreError::Backend {
                reason: reason.clone(),
            }),
        }
    }

    /// Looks up a key. Missing keys and backend failures both read as `None`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.inner().ok()? {
            Inner::Db { db } => {
                let env = self.store.db().ok()?;
                let rtxn = env.env().read_txn().ok()?;
                db.get(&rtxn, key).ok().flatten().map(<[u8]>::to_vec)
            }
            Inner::File { map, .. } => map.lock().unwrap().get(key).cloned(),
        }
    }

    /// Stores a key/value pair, replacing any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self.inner()? {
            Inner::Db { db } => {
                let env = self.store.db().map_err(|reason| StoreError::Backend { reason })?;
                let mut wtxn = env.env().write_txn()?;
                db.put(&mut wtxn, key, value)?;
                wtxn.commit()?;
                Ok(())
            }
            Inner::File { map, dirty, .. } => {
                map.lock().unwrap().insert(key.to_vec(), value.to_vec());
                dirty.store(true, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Removes a key. Returns `true` if it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        match self.inner()? {
            Inner::Db { db } => {
                let env = self.store.db().map_err(|reason| StoreError::Backend { reason })?;
                let mut wtxn = env.env().write_txn()?;
                let removed = db.delete(&mut wtxn, key)?;
                wtxn.commit()?;
                Ok(removed)
            }
            Inner::File { map, dirty, .. } => {
                let removed = map.lock().unwrap().remove(key).is_some();
                if removed {
                    dirty.store(true, Ordering::Relaxed);
                }
                Ok(removed)
            }
        }
    }

    /// Returns every key in the namespace (used by the final cleanup pass to
    /// scan environment records without loading units).
    pub fn keys(&self) -> Vec<Vec<u8>> {
        match self.inner() {
            Ok(Inner::Db { db }) => {
                let Ok(env) = self.store.db() else {
                    return Vec::new();
                };
                let Ok(rtxn) = env.env().read_txn() else {
                    return Vec::new();
                };
                let keys = match db.iter(&rtxn) {
                    Ok(iter) => iter
                        .filter_map(|entry| entry.ok().map(|(k, _)| k.to_vec()))
                        .collect(),
                    Err(_) => Vec::new(),
                };
                keys
            }
            Ok(Inner::File { map, .. }) => map.lock().unwrap().keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Persists the namespace. A no-op for the database backend (the shared
    /// environment syncs through [`Store::flush`]); rewrites the map file
    /// for the file backend when dirty.
    pub fn flush(&self) -> Result<(), StoreError> {
        match self.inner()? {
            Inner::Db { .. } => Ok(()),
            Inner::File { path, map, dirty } => {
                if !dirty.swap(false, Ordering::Relaxed) {
                    return Ok(());
                }
                let map = map.lock().unwrap();
                let bytes = bincode::serde::encode_to_vec(&*map, bincode::config::standard())
                    .map_err(|e| StoreError::Serialization {
                        reason: e.to_string(),
                    })?;
                std::fs::write(path, bytes).map_err(|e| StoreError::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        }
    }
}
