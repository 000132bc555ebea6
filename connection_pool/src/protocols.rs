//! The shared protocol vocabulary: stream and key names, command types and
//! their payload shapes. Everything else in this crate depends on this
//! module; it depends on nothing.

use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::CommandError;

/// Stream carrying commands from the bridge to the pool.
pub const COMMAND_IN_STREAM: &str = "ircpool.stream.command.in";
/// Stream carrying notifications and raw socket data from the pool to the bridge.
pub const COMMAND_OUT_STREAM: &str = "ircpool.stream.command.out";
/// Keyed store mapping client id -> local endpoint for every live socket.
pub const CONNECTIONS_KEY: &str = "ircpool.connections";
/// Keyed store mapping client id -> serialised durable client state.
pub const CLIENT_STATE_KEY: &str = "ircpool.clientstate";
/// Scalar key holding the pool's last heartbeat timestamp, for monitoring.
pub const HEARTBEAT_KEY: &str = "ircpool.heartbeat";
/// Scalar key holding the pool's protocol version.
pub const VERSION_KEY: &str = "ircpool.version";
/// Prefix for the scalar key persisting a pool's inbound-stream cursor.
pub const LAST_READ_KEY_PREFIX: &str = "ircpool.stream.command.last-read.";

pub const PROTOCOL_VERSION: u32 = 1;

pub fn last_read_key(pool_name: &str) -> String {
    format!("{}{}", LAST_READ_KEY_PREFIX, pool_name)
}

/// Opaque, stable identifier for one logical IRC session. Survives bridge
/// restarts and keys every stream entry and store record for that session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Parameters for establishing one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSpec {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Accept self-signed or expired server certificates for this connection.
    #[serde(default)]
    pub ignore_tls_errors: bool,
    #[serde(default)]
    pub local_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum InCommandType {
    Connect,
    Destroy,
    End,
    SetTimeout,
    Write,
    ConnectionPing,
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutCommandType {
    Connected,
    Error,
    Disconnected,
    NotConnected,
    Pong,
    PoolClosing,
}

/// Wire envelope for typed commands: the payload plus the append timestamp
/// at the origin, in milliseconds since the epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope<T> {
    pub info: T,
    pub origin_ts: i64,
}

impl<T: Serialize> CommandEnvelope<T> {
    pub fn now(info: T) -> Self {
        Self {
            info,
            origin_ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SessionInfo {
    client_id: Option<ClientId>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SessionEnvelope {
    info: SessionInfo,
}

/// Best-effort extraction of the session a typed envelope addresses, used
/// to keep per-session command handling ordered. Raw data entries and
/// session-less commands yield `None`.
pub(crate) fn envelope_session(value: &[u8]) -> Option<ClientId> {
    serde_json::from_slice::<SessionEnvelope>(value)
        .ok()?
        .info
        .client_id
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectArgs {
    pub client_id: ClientId,
    #[serde(flatten)]
    pub spec: ConnectSpec,
}

/// Payload for commands that carry nothing but the session they address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientArgs {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTimeoutArgs {
    pub client_id: ClientId,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteArgs {
    pub client_id: ClientId,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyArgs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedArgs {
    pub client_id: ClientId,
    pub local_ip: String,
    pub local_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorArgs {
    pub client_id: ClientId,
    pub error: String,
}

/// A command sent from the bridge to the pool.
#[derive(Debug, Clone)]
pub enum InCommand {
    Connect(CommandEnvelope<ConnectArgs>),
    Destroy(CommandEnvelope<ClientArgs>),
    End(CommandEnvelope<ClientArgs>),
    SetTimeout(CommandEnvelope<SetTimeoutArgs>),
    Write(CommandEnvelope<WriteArgs>),
    ConnectionPing(CommandEnvelope<ClientArgs>),
    Ping(CommandEnvelope<EmptyArgs>),
}

fn decode<T: DeserializeOwned>(
    name: &'static str,
    value: &[u8],
) -> Result<CommandEnvelope<T>, CommandError> {
    serde_json::from_slice(value).map_err(|e| CommandError::Malformed(name, e))
}

fn encode<T: Serialize>(
    tag: impl fmt::Display,
    envelope: &CommandEnvelope<T>,
) -> (String, Vec<u8>) {
    // Envelope serialisation of our own types cannot fail.
    let value = serde_json::to_vec(envelope).expect("Failed to serialise command envelope");
    (tag.to_string(), value)
}

impl InCommand {
    pub fn command_type(&self) -> InCommandType {
        match self {
            Self::Connect(_) => InCommandType::Connect,
            Self::Destroy(_) => InCommandType::Destroy,
            Self::End(_) => InCommandType::End,
            Self::SetTimeout(_) => InCommandType::SetTimeout,
            Self::Write(_) => InCommandType::Write,
            Self::ConnectionPing(_) => InCommandType::ConnectionPing,
            Self::Ping(_) => InCommandType::Ping,
        }
    }

    /// Encode into a stream entry key and payload.
    pub fn into_wire(self) -> (String, Vec<u8>) {
        match &self {
            Self::Connect(env) => encode(self.command_type(), env),
            Self::Destroy(env) | Self::End(env) | Self::ConnectionPing(env) => {
                encode(self.command_type(), env)
            }
            Self::SetTimeout(env) => encode(self.command_type(), env),
            Self::Write(env) => encode(self.command_type(), env),
            Self::Ping(env) => encode(self.command_type(), env),
        }
    }

    /// Decode a stream entry. Unknown keys are an error: on the inbound
    /// stream every entry is a typed command.
    pub fn from_wire(key: &str, value: &[u8]) -> Result<Self, CommandError> {
        let cmd_type = InCommandType::from_str(key)
            .map_err(|_| CommandError::UnknownType(key.to_string()))?;
        Ok(match cmd_type {
            InCommandType::Connect => Self::Connect(decode("connect", value)?),
            InCommandType::Destroy => Self::Destroy(decode("destroy", value)?),
            InCommandType::End => Self::End(decode("end", value)?),
            InCommandType::SetTimeout => Self::SetTimeout(decode("set-timeout", value)?),
            InCommandType::Write => Self::Write(decode("write", value)?),
            InCommandType::ConnectionPing => {
                Self::ConnectionPing(decode("connection-ping", value)?)
            }
            InCommandType::Ping => Self::Ping(decode("ping", value)?),
        })
    }
}

/// A notification sent from the pool to the bridge.
#[derive(Debug, Clone)]
pub enum OutCommand {
    Connected(CommandEnvelope<ConnectedArgs>),
    Error(CommandEnvelope<ErrorArgs>),
    Disconnected(CommandEnvelope<ClientArgs>),
    NotConnected(CommandEnvelope<ClientArgs>),
    Pong(CommandEnvelope<EmptyArgs>),
    PoolClosing(CommandEnvelope<EmptyArgs>),
}

/// A demultiplexed entry from the outbound stream: either a typed command or
/// a raw byte chunk for one session. Raw chunks are keyed by the client id
/// itself to keep the hot path free of any encoding.
#[derive(Debug)]
pub enum OutEntry {
    Command(OutCommand),
    Data(ClientId, Vec<u8>),
}

impl OutCommand {
    pub fn command_type(&self) -> OutCommandType {
        match self {
            Self::Connected(_) => OutCommandType::Connected,
            Self::Error(_) => OutCommandType::Error,
            Self::Disconnected(_) => OutCommandType::Disconnected,
            Self::NotConnected(_) => OutCommandType::NotConnected,
            Self::Pong(_) => OutCommandType::Pong,
            Self::PoolClosing(_) => OutCommandType::PoolClosing,
        }
    }

    pub fn into_wire(self) -> (String, Vec<u8>) {
        match &self {
            Self::Connected(env) => encode(self.command_type(), env),
            Self::Error(env) => encode(self.command_type(), env),
            Self::Disconnected(env) | Self::NotConnected(env) => {
                encode(self.command_type(), env)
            }
            Self::Pong(env) | Self::PoolClosing(env) => encode(self.command_type(), env),
        }
    }

    /// Decode an outbound stream entry. A key that is not a known command
    /// tag is a client id carrying raw socket data.
    pub fn from_wire(key: &str, value: &[u8]) -> Result<OutEntry, CommandError> {
        let Ok(cmd_type) = OutCommandType::from_str(key) else {
            return Ok(OutEntry::Data(ClientId::from(key), value.to_vec()));
        };
        let cmd = match cmd_type {
            OutCommandType::Connected => Self::Connected(decode("connected", value)?),
            OutCommandType::Error => Self::Error(decode("error", value)?),
            OutCommandType::Disconnected => Self::Disconnected(decode("disconnected", value)?),
            OutCommandType::NotConnected => Self::NotConnected(decode("not-connected", value)?),
            OutCommandType::Pong => Self::Pong(decode("pong", value)?),
            OutCommandType::PoolClosing => Self::PoolClosing(decode("pool-closing", value)?),
        };
        Ok(OutEntry::Command(cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_use_wire_names() {
        assert_eq!(InCommandType::SetTimeout.to_string(), "set-timeout");
        assert_eq!(InCommandType::ConnectionPing.to_string(), "connection-ping");
        assert_eq!(OutCommandType::NotConnected.to_string(), "not-connected");
        assert_eq!(
            InCommandType::from_str("connect").unwrap(),
            InCommandType::Connect
        );
    }

    #[test]
    fn in_command_round_trips() {
        let cmd = InCommand::Connect(CommandEnvelope::now(ConnectArgs {
            client_id: ClientId::from("abc"),
            spec: ConnectSpec {
                host: "irc.example.com".to_string(),
                port: 6697,
                tls: true,
                ignore_tls_errors: false,
                local_address: None,
            },
        }));
        let (key, value) = cmd.into_wire();
        assert_eq!(key, "connect");

        match InCommand::from_wire(&key, &value).unwrap() {
            InCommand::Connect(env) => {
                assert_eq!(env.info.client_id.as_str(), "abc");
                assert_eq!(env.info.spec.port, 6697);
                assert!(env.info.spec.tls);
            }
            other => panic!("Wrong command decoded: {:?}", other),
        }
    }

    #[test]
    fn unknown_inbound_tag_is_an_error() {
        assert!(matches!(
            InCommand::from_wire("frobnicate", b"{}"),
            Err(CommandError::UnknownType(_))
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(
            InCommand::from_wire("write", b"not json"),
            Err(CommandError::Malformed(_, _))
        ));
    }

    #[test]
    fn unknown_outbound_tag_is_raw_data() {
        match OutCommand::from_wire("some-client", b"PING :x\r\n").unwrap() {
            OutEntry::Data(id, data) => {
                assert_eq!(id.as_str(), "some-client");
                assert_eq!(data, b"PING :x\r\n");
            }
            OutEntry::Command(cmd) => panic!("Decoded as command: {:?}", cmd),
        }
    }

    #[test]
    fn envelope_session_extraction() {
        let (_, value) = InCommand::Write(CommandEnvelope::now(WriteArgs {
            client_id: ClientId::from("abc"),
            data: "NICK abc\r\n".to_string(),
        }))
        .into_wire();
        assert_eq!(envelope_session(&value), Some(ClientId::from("abc")));

        let (_, value) = InCommand::Ping(CommandEnvelope::now(EmptyArgs {})).into_wire();
        assert_eq!(envelope_session(&value), None);

        assert_eq!(envelope_session(b":irc.test 001 abc :Welcome\r\n"), None);
    }
}
