//! The socket-like handle exposed to the bridge's IRC state machine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pool_transport::Transport;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    ClientArgs, ClientId, ClientStateHandle, CommandEnvelope, InCommand, PoolError,
    SetTimeoutArgs, WriteArgs, COMMAND_IN_STREAM,
};

/// The capability surface shared by both kinds of IRC socket: the real
/// socket owned by the pool process, and the transport-backed adapter handle
/// held by the bridge. Selected at construction time, never structurally.
pub trait IrcSocket: Send + Sync {
    /// Queue bytes for the remote server. Fire-and-forget.
    fn write(&self, data: String);
    /// Half-close: no more writes, reads drain until the server hangs up.
    fn end(&self);
    /// Tear the socket down immediately.
    fn destroy(&self);
    /// Arm or re-arm the read-idle timer.
    fn set_timeout(&self, timeout: Duration);
}

/// Something that happened on one pooled connection, replayed to the bridge
/// by the demultiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventDetail {
    /// The socket is open; the pool reports its local endpoint.
    Connected { local_ip: String, local_port: u16 },
    /// A verbatim chunk of bytes read from the socket.
    Data(Vec<u8>),
    /// A socket-level failure, already cleaned up pool-side.
    Error(String),
    /// The socket closed.
    End,
    /// The pool has no socket for this session at all.
    NotConnected,
}

/// An event delivered on a [`PoolConnection`]'s event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The session this event relates to.
    pub client_id: ClientId,
    pub detail: ConnectionEventDetail,
}

pub(crate) async fn send_in_command(
    transport: &Arc<dyn Transport>,
    cmd: InCommand,
) -> Result<(), PoolError> {
    let cmd_type = cmd.command_type();
    let (key, value) = cmd.into_wire();
    transport.append(COMMAND_IN_STREAM, &key, value).await?;
    tracing::debug!("Sent command in {}", cmd_type);
    Ok(())
}

/// A connection living in the pool process, driven remotely through the
/// command stream. Obtained from
/// [`PoolClient::get_or_create_connection`](crate::PoolClient::get_or_create_connection).
pub struct PoolConnection {
    pub client_id: ClientId,
    transport: Arc<dyn Transport>,
    state: ClientStateHandle,
    event_rx: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
    pub(crate) event_tx: UnboundedSender<ConnectionEvent>,
}

impl PoolConnection {
    pub(crate) fn new(
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        state: ClientStateHandle,
        event_tx: UnboundedSender<ConnectionEvent>,
        event_rx: UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self {
            client_id,
            transport,
            state,
            event_rx: Mutex::new(Some(event_rx)),
            event_tx,
        }
    }

    /// The durable protocol state for this session, hydrated before the
    /// handle was returned.
    pub fn state(&self) -> &ClientStateHandle {
        &self.state
    }

    /// Take the event stream for this connection. Yields `None` after the
    /// first call; there is exactly one consumer.
    pub fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.lock().take()
    }

    fn send_command(&self, cmd: InCommand) {
        let transport = Arc::clone(&self.transport);
        let client_id = self.client_id.clone();
        let cmd_type = cmd.command_type();
        tokio::spawn(async move {
            if let Err(e) = send_in_command(&transport, cmd).await {
                tracing::warn!("Could not send {} for {}: {}", cmd_type, client_id, e);
            }
        });
    }
}

impl IrcSocket for PoolConnection {
    fn write(&self, data: String) {
        self.send_command(InCommand::Write(CommandEnvelope::now(WriteArgs {
            client_id: self.client_id.clone(),
            data,
        })));
    }

    fn end(&self) {
        tracing::debug!("Called end on {}", self.client_id);
        self.send_command(InCommand::End(CommandEnvelope::now(ClientArgs {
            client_id: self.client_id.clone(),
        })));
    }

    fn destroy(&self) {
        tracing::debug!("Called destroy on {}", self.client_id);
        self.send_command(InCommand::Destroy(CommandEnvelope::now(ClientArgs {
            client_id: self.client_id.clone(),
        })));
    }

    fn set_timeout(&self, timeout: Duration) {
        self.send_command(InCommand::SetTimeout(CommandEnvelope::now(
            SetTimeoutArgs {
                client_id: self.client_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            },
        )));
    }
}
