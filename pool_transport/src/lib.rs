//! The durable command transport shared by the connection pool and its clients.
//!
//! The pool process and the bridge process never talk to each other directly.
//! All communication goes through two ordered, durable, independently
//! trimmable append logs (one per direction) plus a handful of keyed stores,
//! so that either process can restart without the other noticing. This crate
//! defines that contract as the [`Transport`] trait and provides
//! [`MemoryTransport`], the reference backend used in tests and single-host
//! deployments. Production backends live outside this workspace.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
pub use memory::MemoryTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid stream entry id: {0}")]
    InvalidEntryId(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Identifies one entry within a stream. Ids are totally ordered and strictly
/// increasing in append order within a single stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StreamEntryId(pub u64);

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for StreamEntryId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| TransportError::InvalidEntryId(s.to_string()))
    }
}

/// A read position within a stream.
///
/// `Head` means "only entries appended after the read begins"; `After` resumes
/// from a previously observed entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Head,
    After(StreamEntryId),
}

/// One entry in a stream: an opaque key (a command tag or a session id) and a
/// byte payload.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    pub key: String,
    pub value: Vec<u8>,
}

/// The durable transport contract.
///
/// Appends are atomic and ordered; blocking reads return every entry after
/// the cursor, or an empty batch once the timeout expires. The two trim
/// operations are independent of any reader's position - callers are
/// responsible for never trimming past a cursor they still need.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Append one entry to the named stream, returning its assigned id.
    async fn append(&self, stream: &str, key: &str, value: Vec<u8>) -> Result<StreamEntryId>;

    /// Read every entry after `cursor`, blocking up to `timeout` for at least
    /// one to arrive. An empty vec means the timeout expired.
    async fn read_blocking(
        &self,
        stream: &str,
        cursor: Cursor,
        timeout: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Whether [`Transport::trim_min_id`] is available on this backend.
    fn supports_trim_min_id(&self) -> bool;

    /// Remove every entry with an id strictly below `min_id`, returning the
    /// number removed.
    async fn trim_min_id(&self, stream: &str, min_id: StreamEntryId) -> Result<u64>;

    /// Remove the oldest entries until at most `max_len` remain, returning
    /// the number removed.
    async fn trim_max_len(&self, stream: &str, max_len: usize) -> Result<u64>;

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<()>;
    /// Delete the entire keyed store.
    async fn hash_clear(&self, key: &str) -> Result<()>;
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn set_value(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn del_value(&self, key: &str) -> Result<()>;
}
