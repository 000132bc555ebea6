//! The bridge-side client: acquires transport-backed connection handles and
//! demultiplexes the pool's outbound stream onto them.

use crate::*;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pool_transport::{Cursor, StreamEntry, Transport};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct ClientInner {
    connections: Mutex<HashMap<ClientId, Arc<PoolConnection>>>,
    // Sessions with a connect or resume in flight, resolved by the first
    // conclusive outbound command for that session.
    pending: Mutex<HashMap<ClientId, oneshot::Sender<Result<(), PoolError>>>>,
}

impl ClientInner {
    /// Replay an event onto the session's handle, if we hold one.
    fn deliver(&self, client_id: ClientId, detail: ConnectionEventDetail) {
        let connections = self.connections.lock();
        let Some(conn) = connections.get(&client_id) else {
            tracing::debug!("Dropping event for unknown client {}", client_id);
            return;
        };
        if conn
            .event_tx
            .send(ConnectionEvent { client_id, detail })
            .is_err()
        {
            tracing::debug!("Event receiver for {} has gone away", conn.client_id);
        }
    }

    /// Resolve an in-flight acquisition, or return the result for delivery
    /// as an ordinary event if none is waiting.
    fn resolve_pending(&self, client_id: &ClientId, result: Result<(), PoolError>) -> bool {
        if let Some(waiter) = self.pending.lock().remove(client_id) {
            let _ = waiter.send(result);
            true
        } else {
            false
        }
    }

    fn handle_out_command(&self, cmd: OutCommand) {
        match cmd {
            OutCommand::Connected(env) => {
                let ConnectedArgs {
                    client_id,
                    local_ip,
                    local_port,
                } = env.info;
                self.resolve_pending(&client_id, Ok(()));
                self.deliver(
                    client_id,
                    ConnectionEventDetail::Connected {
                        local_ip,
                        local_port,
                    },
                );
            }
            OutCommand::Error(env) => {
                let ErrorArgs { client_id, error } = env.info;
                if !self.resolve_pending(&client_id, Err(PoolError::ConnectFailed(error.clone())))
                {
                    self.deliver(client_id, ConnectionEventDetail::Error(error));
                }
            }
            OutCommand::Disconnected(env) => {
                let client_id = env.info.client_id;
                // Forget the handle so a later acquisition reconnects.
                if let Some(conn) = self.connections.lock().remove(&client_id) {
                    let _ = conn.event_tx.send(ConnectionEvent {
                        client_id,
                        detail: ConnectionEventDetail::End,
                    });
                }
            }
            OutCommand::NotConnected(env) => {
                let client_id = env.info.client_id;
                if !self.resolve_pending(&client_id, Err(PoolError::NotConnected)) {
                    self.deliver(client_id, ConnectionEventDetail::NotConnected);
                }
            }
            OutCommand::Pong(_) => {
                tracing::debug!("Pool answered ping");
            }
            OutCommand::PoolClosing(_) => {
                tracing::warn!("The connection pool is shutting down");
            }
        }
    }
}

#[async_trait]
impl CommandStreamHandler for ClientInner {
    // Raw data entries are keyed by the session id already; lifecycle tags
    // carry it in the payload. Either way one session is one lane, so data
    // and lifecycle events for a session arrive in stream order.
    fn dispatch_lane(&self, entry: &StreamEntry) -> String {
        match envelope_session(&entry.value) {
            Some(client_id) => client_id.to_string(),
            None => entry.key.clone(),
        }
    }

    async fn handle(self: Arc<Self>, entry: StreamEntry) -> Result<(), CommandError> {
        match OutCommand::from_wire(&entry.key, &entry.value)? {
            OutEntry::Data(client_id, data) => {
                self.deliver(client_id, ConnectionEventDetail::Data(data));
            }
            OutEntry::Command(cmd) => self.handle_out_command(cmd),
        }
        Ok(())
    }
}

/// The bridge's entry point to the pool service.
pub struct PoolClient {
    inner: Arc<ClientInner>,
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    reader_stop: Arc<Notify>,
    reader_task: JoinHandle<()>,
}

impl PoolClient {
    /// Check the published pool protocol version, then start consuming the
    /// outbound stream from its head. A missing version means the pool has
    /// not started yet; that is tolerated, since commands are durable until
    /// it does. A newer version is not.
    pub async fn start(
        transport: Arc<dyn Transport>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        match transport.get_value(VERSION_KEY).await? {
            Some(bytes) => {
                let version: u32 = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                if version > PROTOCOL_VERSION {
                    return Err(PoolError::IncompatiblePool(version, PROTOCOL_VERSION));
                }
            }
            None => {
                tracing::warn!("No pool version published yet; assuming it will start later");
            }
        }

        let inner = Arc::new(ClientInner {
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });

        let (reader, reader_stop) = CommandReader::new(
            Arc::clone(&transport),
            COMMAND_OUT_STREAM,
            Cursor::Head,
            Arc::clone(&inner) as Arc<dyn CommandStreamHandler>,
            None,
            &config,
        );
        let reader_task = tokio::spawn(reader.run());

        Ok(Self {
            inner,
            transport,
            config,
            reader_stop,
            reader_task,
        })
    }

    /// Return the handle for a session, creating it if needed.
    ///
    /// If the pool already holds a live socket for this session (recorded in
    /// its connection hash), the socket is resumed as-is rather than
    /// reconnected; this is the restart-survival path. Acquiring a session
    /// that already has a local handle returns that same handle.
    pub async fn get_or_create_connection(
        &self,
        client_id: ClientId,
        spec: ConnectSpec,
    ) -> Result<Arc<PoolConnection>, PoolError> {
        if let Some(existing) = self.inner.connections.lock().get(&client_id) {
            tracing::warn!("Re-using existing handle for {}", client_id);
            return Ok(Arc::clone(existing));
        }

        let state =
            ClientStateHandle::hydrate(Arc::clone(&self.transport), client_id.clone()).await?;

        let (event_tx, event_rx) = unbounded_channel();
        let conn = Arc::new(PoolConnection::new(
            client_id.clone(),
            Arc::clone(&self.transport),
            state,
            event_tx,
            event_rx,
        ));

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(client_id.clone(), waiter_tx);
        self.inner
            .connections
            .lock()
            .insert(client_id.clone(), Arc::clone(&conn));

        // A socket recorded pool-side is probed rather than reconnected.
        let cmd = match self
            .transport
            .hash_get(CONNECTIONS_KEY, client_id.as_str())
            .await?
        {
            Some(_) => {
                tracing::info!("Resuming existing pool socket for {}", client_id);
                InCommand::ConnectionPing(CommandEnvelope::now(ClientArgs {
                    client_id: client_id.clone(),
                }))
            }
            None => InCommand::Connect(CommandEnvelope::now(ConnectArgs {
                client_id: client_id.clone(),
                spec,
            })),
        };
        send_in_command(&self.transport, cmd).await?;

        let result = match tokio::time::timeout(self.config.connection_timeout(), waiter_rx).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::ConnectFailed(
                "Acquisition abandoned".to_string(),
            )),
            Err(_) => Err(PoolError::CreationTimeout),
        };
        if let Err(e) = result {
            self.inner.pending.lock().remove(&client_id);
            self.inner.connections.lock().remove(&client_id);
            return Err(e);
        }
        Ok(conn)
    }

    /// The handle for a session, if one has been acquired.
    pub fn get_connection(&self, client_id: &ClientId) -> Option<Arc<PoolConnection>> {
        self.inner.connections.lock().get(client_id).cloned()
    }

    /// Ask the pool to confirm it is alive; the answer arrives as a `pong`
    /// on the outbound stream.
    pub async fn ping(&self) -> Result<(), PoolError> {
        send_in_command(
            &self.transport,
            InCommand::Ping(CommandEnvelope::now(EmptyArgs {})),
        )
        .await
    }

    pub async fn stop(self) {
        self.reader_stop.notify_one();
        let _ = self.reader_task.await;
    }
}
