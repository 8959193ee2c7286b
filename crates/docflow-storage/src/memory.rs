//! In-memory storage backend for tests and local experiments.

use crate::keys::validate_key;
use crate::traits::{AreaStorage, StorageArea, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Storage operations, used to record calls and inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Upload,
    Download,
    Delete,
    Copy,
    SignedUrl,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(StorageArea, String), Bytes>,
    /// (op, target area) pairs that fail with a backend error
    failures: HashSet<(StorageOp, StorageArea)>,
    log: Vec<(StorageOp, StorageArea, String)>,
}

/// Thread-safe in-memory [`AreaStorage`].
///
/// Clones share the same objects, so a test can keep a handle for
/// assertions while the worker owns another.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place an object directly, bypassing the operation log.
    pub fn put(&self, area: StorageArea, key: &str, data: impl Into<Bytes>) {
        self.lock().objects.insert((area, key.to_string()), data.into());
    }

    pub fn get(&self, area: StorageArea, key: &str) -> Option<Bytes> {
        self.lock().objects.get(&(area, key.to_string())).cloned()
    }

    pub fn contains(&self, area: StorageArea, key: &str) -> bool {
        self.get(area, key).is_some()
    }

    /// Areas currently holding `key`.
    pub fn areas_of(&self, key: &str) -> Vec<StorageArea> {
        StorageArea::ALL
            .into_iter()
            .filter(|area| self.contains(*area, key))
            .collect()
    }

    /// Make every `op` targeting `area` fail until cleared.
    pub fn fail_on(&self, op: StorageOp, area: StorageArea) {
        self.lock().failures.insert((op, area));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Number of recorded `op` calls that targeted `area`.
    pub fn count(&self, op: StorageOp, area: StorageArea) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|(o, a, _)| *o == op && *a == area)
            .count()
    }

    fn record(&self, op: StorageOp, area: StorageArea, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        let mut inner = self.lock();
        inner.log.push((op, area, key.to_string()));
        if inner.failures.contains(&(op, area)) {
            return Err(StorageError::BackendError(format!(
                "injected {:?} failure in {}",
                op, area
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AreaStorage for MemoryStorage {
    async fn upload(
        &self,
        area: StorageArea,
        key: &str,
        data: Bytes,
        _content_type: Option<&str>,
    ) -> StorageResult<()> {
        self.record(StorageOp::Upload, area, key)?;
        self.put(area, key, data);
        Ok(())
    }

    async fn download(&self, area: StorageArea, key: &str) -> StorageResult<Bytes> {
        self.record(StorageOp::Download, area, key)?;
        self.get(area, key)
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", area, key)))
    }

    async fn delete(&self, area: StorageArea, key: &str) -> StorageResult<()> {
        self.record(StorageOp::Delete, area, key)?;
        self.lock().objects.remove(&(area, key.to_string()));
        Ok(())
    }

    async fn copy_between_areas(
        &self,
        src: StorageArea,
        dst: StorageArea,
        key: &str,
    ) -> StorageResult<()> {
        self.record(StorageOp::Copy, dst, key)?;
        let data = self
            .get(src, key)
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", src, key)))?;
        self.put(dst, key, data);
        Ok(())
    }

    async fn signed_url(
        &self,
        area: StorageArea,
        key: &str,
        ttl: Duration,
    ) -> StorageResult<String> {
        self.record(StorageOp::SignedUrl, area, key)?;
        Ok(format!("memory://{}/{}?ttl={}", area, key, ttl.as_secs()))
    }

    async fn exists(&self, area: StorageArea, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.contains(area, key))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
