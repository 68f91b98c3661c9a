use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use kiln::cache::{CacheError, RemoteCache, RemoteFuture};
use kiln::fingerprint::Fingerprint;

/// Remote tier backed by a map, standing in for a shared HTTP cache.
#[derive(Debug, Default)]
pub struct InMemoryRemoteCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    loads: AtomicUsize,
    hits: AtomicUsize,
    stores: AtomicUsize,
}

impl InMemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    /// Overwrite a stored payload, e.g. with garbage.
    pub fn replace(&self, hex: &str, payload: Vec<u8>) {
        self.entries.lock().unwrap().insert(hex.to_string(), payload);
    }
}

impl RemoteCache for InMemoryRemoteCache {
    fn load<'a>(&'a self, key: &'a Fingerprint) -> RemoteFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let found = self.entries.lock().unwrap().get(&key.to_hex()).cloned();
            if found.is_some() {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<_, CacheError>(found)
        })
    }

    fn store<'a>(&'a self, key: &'a Fingerprint, archive: Vec<u8>) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.stores.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().unwrap().insert(key.to_hex(), archive);
            Ok(())
        })
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}
