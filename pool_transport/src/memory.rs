//! In-memory transport backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{Cursor, Result, StreamEntry, StreamEntryId, Transport};

#[derive(Default)]
struct StreamState {
    next_id: u64,
    entries: VecDeque<StreamEntry>,
}

impl StreamState {
    fn last_id(&self) -> StreamEntryId {
        self.entries
            .back()
            .map(|e| e.id)
            .unwrap_or(StreamEntryId(self.next_id))
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    values: HashMap<String, Vec<u8>>,
}

/// A [`Transport`] backed by process memory.
///
/// Cloning yields another handle onto the same stores, so a pool and any
/// number of clients can share one instance within a process. Blocking reads
/// are woken through a watch channel that is bumped on every append.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    append_tx: Arc<watch::Sender<u64>>,
    append_rx: watch::Receiver<u64>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (append_tx, append_rx) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            append_tx: Arc::new(append_tx),
            append_rx,
        }
    }

    /// Current length of a stream, for inspection in tests and monitors.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn entries_after(state: &State, stream: &str, after: StreamEntryId) -> Vec<StreamEntry> {
        state
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| e.id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn append(&self, stream: &str, key: &str, value: Vec<u8>) -> Result<StreamEntryId> {
        let id = {
            let mut state = self.state.lock();
            let stream = state.streams.entry(stream.to_string()).or_default();
            stream.next_id += 1;
            let id = StreamEntryId(stream.next_id);
            stream.entries.push_back(StreamEntry {
                id,
                key: key.to_string(),
                value,
            });
            id
        };
        self.append_tx.send_modify(|v| *v += 1);
        Ok(id)
    }

    async fn read_blocking(
        &self,
        stream: &str,
        cursor: Cursor,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + timeout;
        let mut wake = self.append_rx.clone();
        // Resolve Head to the current tail so we only see entries appended
        // after this read began.
        let after = {
            let state = self.state.lock();
            match cursor {
                Cursor::After(id) => id,
                Cursor::Head => state
                    .streams
                    .get(stream)
                    .map(|s| s.last_id())
                    .unwrap_or_default(),
            }
        };

        loop {
            // Mark the current wake-counter value as seen before checking, so
            // an append between the check and the await is not missed.
            wake.borrow_and_update();
            {
                let state = self.state.lock();
                let batch = Self::entries_after(&state, stream, after);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            match tokio::time::timeout_at(deadline, wake.changed()).await {
                Ok(Ok(())) => continue,
                // Sender dropped or timeout: either way, nothing more to wait for.
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    fn supports_trim_min_id(&self) -> bool {
        true
    }

    async fn trim_min_id(&self, stream: &str, min_id: StreamEntryId) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream.entries.len();
        stream.entries.retain(|e| e.id >= min_id);
        Ok((before - stream.entries.len()) as u64)
    }

    async fn trim_max_len(&self, stream: &str, max_len: usize) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let mut removed = 0;
        while stream.entries.len() > max_len {
            stream.entries.pop_front();
            removed += 1;
        }
        Ok(removed)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        if let Some(hash) = self.state.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hash_clear(&self, key: &str) -> Result<()> {
        self.state.lock().hashes.remove(key);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn set_value(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.state.lock().values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().values.get(key).cloned())
    }

    async fn del_value(&self, key: &str) -> Result<()> {
        self.state.lock().values.remove(key);
        Ok(())
    }
}
