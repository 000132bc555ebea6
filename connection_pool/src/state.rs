//! Durable per-session protocol state.
//!
//! One record per client id, stored in a keyed map rather than a stream
//! because it is overwritten in place. The bridge's IRC state machine
//! mutates the record continuously as it parses demultiplexed bytes; every
//! mutation is flushed through a per-session single-writer queue so snapshots
//! can never be persisted out of order, even though the underlying store
//! writes are asynchronous.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pool_transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{ClientId, PoolError, CLIENT_STATE_KEY};

/// Serde shim for maps keyed by untrusted strings (channel names, nicks,
/// mode letters). These serialise as ordered key/value pair lists, never as
/// objects: object-based encodings have historically produced corrupt
/// snapshot shapes. On load, anything that is not a well-formed pair list
/// (including the legacy object form) is repaired to an empty map.
mod pair_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S, V>(map: &HashMap<String, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let mut pairs: Vec<(&String, &V)> = map.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<HashMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: serde::de::DeserializeOwned,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match serde_json::from_value::<Vec<(String, V)>>(value) {
            Ok(pairs) => Ok(pairs.into_iter().collect()),
            Err(_) => Ok(HashMap::new()),
        }
    }
}

/// An outstanding WHOIS response being accumulated for a nick.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhoisResponse {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub realname: Option<String>,
    pub server: Option<String>,
    pub server_info: Option<String>,
    pub operator: bool,
    pub channels: Vec<String>,
}

/// Per-channel membership state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelState {
    pub key: Option<String>,
    pub server_name: Option<String>,
    /// Member nick -> mode prefix ("@", "+", or empty).
    #[serde(with = "pair_map")]
    pub users: HashMap<String, String>,
    pub mode: String,
    /// Mode letter -> parameters for that mode.
    #[serde(with = "pair_map")]
    pub mode_params: HashMap<String, Vec<String>>,
    pub topic: Option<String>,
    pub topic_by: Option<String>,
}

/// Capability negotiation results for one session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilitiesState {
    pub server_capabilities: Vec<String>,
    pub server_capabilities_sasl: Vec<String>,
    pub user_capabilities: Vec<String>,
    pub user_capabilities_sasl: Vec<String>,
}

/// Server feature advertisements (ISUPPORT) relevant to parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupportedInfo {
    pub nick_length: u32,
    pub topic_length: u32,
    pub line_length: u32,
    pub channel_modes: String,
    pub user_modes: String,
}

impl Default for SupportedInfo {
    fn default() -> Self {
        Self {
            nick_length: 9,
            topic_length: 390,
            line_length: 512,
            channel_modes: String::new(),
            user_modes: String::new(),
        }
    }
}

/// The serialisable snapshot of one IRC session's protocol state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientState {
    pub logged_in: bool,
    pub registered: bool,
    /// The requested or actual nickname.
    pub current_nick: String,
    /// Collision counter appended to the nick when it is taken.
    pub nick_mod: u32,
    pub host_mask: String,
    #[serde(with = "pair_map")]
    pub whois_data: HashMap<String, WhoisResponse>,
    #[serde(with = "pair_map")]
    pub chans: HashMap<String, ChannelState>,
    pub mode_for_prefix: HashMap<char, char>,
    pub prefix_for_mode: HashMap<char, char>,
    pub capabilities: CapabilitiesState,
    pub supported_state: SupportedInfo,
    pub max_line_length: i32,
    pub last_send_time: i64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            logged_in: false,
            registered: false,
            current_nick: String::new(),
            nick_mod: 0,
            host_mask: String::new(),
            whois_data: HashMap::new(),
            chans: HashMap::new(),
            mode_for_prefix: HashMap::new(),
            prefix_for_mode: HashMap::new(),
            capabilities: CapabilitiesState::default(),
            supported_state: SupportedInfo::default(),
            max_line_length: -1,
            last_send_time: 0,
        }
    }
}

impl ClientState {
    /// Load a state record, repairing rather than failing: a missing record,
    /// or one that does not parse at all, yields the default state.
    pub fn hydrate(data: Option<&[u8]>) -> Self {
        let Some(data) = data else {
            return Self::default();
        };
        match serde_json::from_slice(data) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Discarding unreadable client state record: {}", e);
                Self::default()
            }
        }
    }

    pub fn dehydrate(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Failed to serialise client state")
    }
}

struct StateInner {
    client_id: ClientId,
    state: Mutex<ClientState>,
    flush_tx: UnboundedSender<Vec<u8>>,
}

/// Shared handle onto one session's durable state.
///
/// Reads clone the current snapshot; mutations go through [`Self::update`],
/// which serialises the new snapshot immediately and queues it on this
/// session's writer task. The queue performs one store write at a time in
/// FIFO order, which is the whole ordering guarantee.
#[derive(Clone)]
pub struct ClientStateHandle {
    inner: Arc<StateInner>,
}

impl ClientStateHandle {
    /// Load-or-default the state record for `client_id` and start its writer.
    pub async fn hydrate(
        transport: Arc<dyn Transport>,
        client_id: ClientId,
    ) -> Result<Self, PoolError> {
        let data = transport
            .hash_get(CLIENT_STATE_KEY, client_id.as_str())
            .await?;
        let state = ClientState::hydrate(data.as_deref());

        let (flush_tx, flush_rx) = unbounded_channel();
        tokio::spawn(state_writer(transport, client_id.clone(), flush_rx));

        Ok(Self {
            inner: Arc::new(StateInner {
                client_id,
                state: Mutex::new(state),
                flush_tx,
            }),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Mutate the state and flush the resulting snapshot.
    ///
    /// The snapshot is taken and queued while the state lock is held, so two
    /// racing updates cannot enqueue their snapshots out of order.
    pub fn update<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let mut state = self.inner.state.lock();
        let result = f(&mut state);
        let snapshot = state.dehydrate();
        if self.inner.flush_tx.send(snapshot).is_err() {
            tracing::warn!(
                "State writer for {} has gone away, dropping flush",
                self.inner.client_id
            );
        }
        result
    }

    pub fn snapshot(&self) -> ClientState {
        self.inner.state.lock().clone()
    }
}

async fn state_writer(
    transport: Arc<dyn Transport>,
    client_id: ClientId,
    mut flush_rx: UnboundedReceiver<Vec<u8>>,
) {
    // One write in flight at a time; the channel preserves FIFO order.
    while let Some(snapshot) = flush_rx.recv().await {
        if let Err(e) = transport
            .hash_set(CLIENT_STATE_KEY, client_id.as_str(), snapshot)
            .await
        {
            tracing::warn!("Unable to persist client state for {}: {}", client_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_transport::MemoryTransport;
    use pretty_assertions::assert_eq;

    fn populated_state() -> ClientState {
        let mut state = ClientState::default();
        state.registered = true;
        state.current_nick = "alice".to_string();
        state.whois_data.insert(
            "bob".to_string(),
            WhoisResponse {
                nick: "bob".to_string(),
                host: Some("host.example".to_string()),
                ..WhoisResponse::default()
            },
        );
        let mut chan = ChannelState::default();
        chan.users.insert("alice".to_string(), "@".to_string());
        chan.users.insert("bob".to_string(), String::new());
        chan.mode_params
            .insert("l".to_string(), vec!["50".to_string()]);
        chan.topic = Some("general chatter".to_string());
        // Channel names are untrusted and may contain characters that are
        // unsafe as object keys.
        state.chans.insert("#weird\"chan".to_string(), chan);
        state.mode_for_prefix.insert('@', 'o');
        state.prefix_for_mode.insert('o', '@');
        state
    }

    #[test]
    fn dehydrate_hydrate_round_trips() {
        let state = populated_state();
        let restored = ClientState::hydrate(Some(&state.dehydrate()));
        assert_eq!(state, restored);
    }

    #[test]
    fn maps_serialise_as_pair_lists() {
        let state = populated_state();
        let json: serde_json::Value = serde_json::from_slice(&state.dehydrate()).unwrap();
        assert!(json["chans"].is_array());
        assert!(json["whoisData"].is_array());
        assert!(json["chans"][0][1]["users"].is_array());
    }

    #[test]
    fn legacy_object_shaped_users_field_repairs_to_empty() {
        let record = serde_json::json!({
            "registered": true,
            "currentNick": "alice",
            "chans": [["#chan", {
                "users": { "alice": "@" },
                "modeParams": { "l": ["50"] }
            }]],
        });
        let state = ClientState::hydrate(Some(record.to_string().as_bytes()));
        assert!(state.registered);
        let chan = state.chans.get("#chan").unwrap();
        assert!(chan.users.is_empty());
        assert!(chan.mode_params.is_empty());
    }

    #[test]
    fn object_shaped_top_level_maps_repair_to_empty() {
        let record = serde_json::json!({
            "currentNick": "alice",
            "whoisData": { "bob": {} },
            "chans": { "#chan": {} },
        });
        let state = ClientState::hydrate(Some(record.to_string().as_bytes()));
        assert_eq!(state.current_nick, "alice");
        assert!(state.whois_data.is_empty());
        assert!(state.chans.is_empty());
    }

    #[test]
    fn missing_or_unreadable_records_hydrate_to_default() {
        assert_eq!(ClientState::hydrate(None), ClientState::default());
        assert_eq!(
            ClientState::hydrate(Some(b"{ truncated")),
            ClientState::default()
        );
        // A short record fills the rest from defaults.
        let state = ClientState::hydrate(Some(br#"{ "registered": true }"#));
        assert!(state.registered);
        assert_eq!(state.max_line_length, -1);
    }

    /// Delegates to a [`MemoryTransport`] while recording every state write,
    /// so tests can observe persistence order rather than just the end state.
    struct RecordingTransport {
        inner: MemoryTransport,
        writes: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn append(
            &self,
            stream: &str,
            key: &str,
            value: Vec<u8>,
        ) -> pool_transport::Result<pool_transport::StreamEntryId> {
            self.inner.append(stream, key, value).await
        }

        async fn read_blocking(
            &self,
            stream: &str,
            cursor: pool_transport::Cursor,
            timeout: std::time::Duration,
        ) -> pool_transport::Result<Vec<pool_transport::StreamEntry>> {
            self.inner.read_blocking(stream, cursor, timeout).await
        }

        fn supports_trim_min_id(&self) -> bool {
            self.inner.supports_trim_min_id()
        }

        async fn trim_min_id(
            &self,
            stream: &str,
            min_id: pool_transport::StreamEntryId,
        ) -> pool_transport::Result<u64> {
            self.inner.trim_min_id(stream, min_id).await
        }

        async fn trim_max_len(&self, stream: &str, max_len: usize) -> pool_transport::Result<u64> {
            self.inner.trim_max_len(stream, max_len).await
        }

        async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> pool_transport::Result<()> {
            self.writes.lock().push(value.clone());
            // Yield so a misordered writer would have every chance to race.
            tokio::task::yield_now().await;
            self.inner.hash_set(key, field, value).await
        }

        async fn hash_get(&self, key: &str, field: &str) -> pool_transport::Result<Option<Vec<u8>>> {
            self.inner.hash_get(key, field).await
        }

        async fn hash_del(&self, key: &str, field: &str) -> pool_transport::Result<()> {
            self.inner.hash_del(key, field).await
        }

        async fn hash_clear(&self, key: &str) -> pool_transport::Result<()> {
            self.inner.hash_clear(key).await
        }

        async fn hash_get_all(&self, key: &str) -> pool_transport::Result<Vec<(String, Vec<u8>)>> {
            self.inner.hash_get_all(key).await
        }

        async fn set_value(&self, key: &str, value: Vec<u8>) -> pool_transport::Result<()> {
            self.inner.set_value(key, value).await
        }

        async fn get_value(&self, key: &str) -> pool_transport::Result<Option<Vec<u8>>> {
            self.inner.get_value(key).await
        }

        async fn del_value(&self, key: &str) -> pool_transport::Result<()> {
            self.inner.del_value(key).await
        }
    }

    #[tokio::test]
    async fn handle_persists_snapshots_in_mutation_order() {
        let transport = Arc::new(RecordingTransport {
            inner: MemoryTransport::new(),
            writes: Mutex::new(Vec::new()),
        });
        let handle = ClientStateHandle::hydrate(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ClientId::from("abc"),
        )
        .await
        .unwrap();

        const N: u32 = 25;
        for i in 1..=N {
            handle.update(|state| state.nick_mod = i);
        }

        for _ in 0..100 {
            if transport.writes.lock().len() == N as usize {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Exactly N snapshots, observed in mutation order.
        let writes = transport.writes.lock();
        assert_eq!(writes.len(), N as usize);
        for (index, snapshot) in writes.iter().enumerate() {
            let state = ClientState::hydrate(Some(snapshot));
            assert_eq!(state.nick_mod, index as u32 + 1);
        }
    }

    #[tokio::test]
    async fn handle_hydrates_previously_persisted_state() {
        let transport = Arc::new(MemoryTransport::new());
        let state = populated_state();
        transport
            .hash_set(CLIENT_STATE_KEY, "abc", state.dehydrate())
            .await
            .unwrap();

        let handle = ClientStateHandle::hydrate(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ClientId::from("abc"),
        )
        .await
        .unwrap();
        assert_eq!(handle.snapshot(), state);
    }
}
