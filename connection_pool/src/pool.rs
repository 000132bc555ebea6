//! The pool process: the only component permitted to own real sockets.

use crate::internal::*;
use crate::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pool_transport::{Cursor, StreamEntry, Transport};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const SOCKET_EVENT_QUEUE_LEN: usize = 128;

/// Scan a received chunk for an IRC `PING` frame, returning its argument
/// portion (e.g. `:12345`) if one is present.
pub(crate) fn ping_argument(chunk: &[u8]) -> Option<String> {
    for line in chunk.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(rest) = line.strip_prefix(b"PING ") {
            return String::from_utf8(rest.to_vec()).ok();
        }
    }
    None
}

pub(crate) struct PoolInner {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    connections: Mutex<HashMap<ClientId, InternalConnection>>,
    // Ids with a connect attempt in flight. Reserved before the socket is
    // opened, so a duplicate Connect delivered mid-attempt is rejected
    // instead of opening a second socket.
    connecting: Mutex<HashSet<ClientId>>,
    event_tx: Sender<SocketEvent>,
    metrics: Arc<MetricsData>,
}

impl PoolInner {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: PoolConfig,
        event_tx: Sender<SocketEvent>,
        metrics: Arc<MetricsData>,
    ) -> Self {
        Self {
            transport,
            config,
            connections: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            event_tx,
            metrics,
        }
    }

    async fn send_out(&self, cmd: OutCommand) {
        let cmd_type = cmd.command_type();
        let (key, value) = cmd.into_wire();
        if let Err(e) = self.transport.append(COMMAND_OUT_STREAM, &key, value).await {
            tracing::warn!("Unable to send command out: {}", e);
        } else {
            tracing::debug!("Sent command out {}", cmd_type);
        }
    }

    pub(crate) async fn handle_in_command(self: &Arc<Self>, cmd: InCommand) {
        match cmd {
            InCommand::Connect(env) => self.handle_connect(env.info).await,
            InCommand::Destroy(env) => {
                self.with_connection("destroy", &env.info.client_id, |conn| conn.destroy());
            }
            InCommand::End(env) => {
                self.with_connection("end", &env.info.client_id, |conn| conn.end());
            }
            InCommand::SetTimeout(env) => {
                let timeout = std::time::Duration::from_millis(env.info.timeout_ms);
                self.with_connection("set-timeout", &env.info.client_id, |conn| {
                    conn.set_timeout(timeout)
                });
            }
            InCommand::Write(env) => self.handle_write(env.info),
            InCommand::ConnectionPing(env) => self.handle_connection_ping(env.info.client_id).await,
            InCommand::Ping(_) => {
                self.send_out(OutCommand::Pong(CommandEnvelope::now(EmptyArgs {})))
                    .await;
            }
        }
    }

    async fn handle_connect(self: &Arc<Self>, args: ConnectArgs) {
        let ConnectArgs { client_id, spec } = args;

        let duplicate = self.connections.lock().contains_key(&client_id)
            || !self.connecting.lock().insert(client_id.clone());
        if duplicate {
            tracing::warn!("Got connect for already-connected client {}", client_id);
            self.send_out(OutCommand::Error(CommandEnvelope::now(ErrorArgs {
                client_id,
                error: "Already connected".to_string(),
            })))
            .await;
            return;
        }

        let attempt = connect_socket(client_id.clone(), &spec, self.event_tx.clone()).await;
        match attempt {
            Ok(conn) => {
                tracing::info!("Connected {} to {}:{}", client_id, spec.host, spec.port);
                let local_addr = conn.local_addr;
                self.connections.lock().insert(client_id.clone(), conn);
                self.connecting.lock().remove(&client_id);
                self.metrics.connection_opened();
                if let Err(e) = self
                    .transport
                    .hash_set(
                        CONNECTIONS_KEY,
                        client_id.as_str(),
                        local_addr.to_string().into_bytes(),
                    )
                    .await
                {
                    tracing::warn!("Unable to record connection for {}: {}", client_id, e);
                }
                self.send_out(OutCommand::Connected(CommandEnvelope::now(ConnectedArgs {
                    client_id,
                    local_ip: local_addr.ip().to_string(),
                    local_port: local_addr.port(),
                })))
                .await;
            }
            Err(e) => {
                tracing::error!(
                    "Failed to connect {} to {}:{}: {}",
                    client_id,
                    spec.host,
                    spec.port,
                    e
                );
                self.connecting.lock().remove(&client_id);
                self.send_out(OutCommand::Error(CommandEnvelope::now(ErrorArgs {
                    client_id,
                    error: e.to_string(),
                })))
                .await;
            }
        }
    }

    /// Run `f` against the named live connection, or log that it is absent.
    fn with_connection(&self, what: &str, client_id: &ClientId, f: impl FnOnce(&InternalConnection)) {
        let connections = self.connections.lock();
        match connections.get(client_id) {
            Some(conn) => f(conn),
            None => {
                tracing::warn!("Got {} but no connection matching {} was found", what, client_id)
            }
        }
    }

    fn handle_write(&self, args: WriteArgs) {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get_mut(&args.client_id) else {
            tracing::warn!(
                "Got write but no connection matching {} was found",
                args.client_id
            );
            return;
        };
        // The bridge answered a keep-alive itself; stand down.
        if args.data.starts_with("PONG") {
            conn.abort_pending_pong();
        }
        conn.write(args.data);
    }

    async fn handle_connection_ping(&self, client_id: ClientId) {
        enum Ping {
            Alive(std::net::SocketAddr),
            Ended,
            Absent,
        }
        let status = {
            let mut connections = self.connections.lock();
            match connections.get(&client_id) {
                Some(conn) if !conn.read_ended => Ping::Alive(conn.local_addr),
                Some(_) => {
                    // The socket is dead but its close has not been processed
                    // yet; clean it up now rather than reporting it alive.
                    connections.remove(&client_id);
                    Ping::Ended
                }
                None => Ping::Absent,
            }
        };
        match status {
            Ping::Alive(local_addr) => {
                self.send_out(OutCommand::Connected(CommandEnvelope::now(ConnectedArgs {
                    client_id,
                    local_ip: local_addr.ip().to_string(),
                    local_port: local_addr.port(),
                })))
                .await;
            }
            Ping::Ended => {
                self.metrics.connection_closed();
                self.forget_client(&client_id).await;
                self.send_out(OutCommand::Disconnected(CommandEnvelope::now(ClientArgs {
                    client_id: client_id.clone(),
                })))
                .await;
                self.send_out(OutCommand::NotConnected(CommandEnvelope::now(ClientArgs {
                    client_id,
                })))
                .await;
            }
            Ping::Absent => {
                self.send_out(OutCommand::NotConnected(CommandEnvelope::now(ClientArgs {
                    client_id,
                })))
                .await;
            }
        }
    }

    /// Drop both bookkeeping records for a session.
    async fn forget_client(&self, client_id: &ClientId) {
        if let Err(e) = self
            .transport
            .hash_del(CONNECTIONS_KEY, client_id.as_str())
            .await
        {
            tracing::warn!("Unable to clear connection record for {}: {}", client_id, e);
        }
        if let Err(e) = self
            .transport
            .hash_del(CLIENT_STATE_KEY, client_id.as_str())
            .await
        {
            tracing::warn!("Unable to clear client state for {}: {}", client_id, e);
        }
    }

    pub(crate) async fn handle_socket_event(self: &Arc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Data(client_id, data) => {
                // Hot path: republish the chunk verbatim, keyed by client id.
                if let Err(e) = self
                    .transport
                    .append(COMMAND_OUT_STREAM, client_id.as_str(), data.clone())
                    .await
                {
                    tracing::warn!("Unable to send raw read out for {}: {}", client_id, e);
                }
                if let Some(argument) = ping_argument(&data) {
                    self.arm_pong_timer(client_id, argument);
                }
            }
            SocketEvent::ReadEnded(client_id) => {
                if let Some(conn) = self.connections.lock().get_mut(&client_id) {
                    conn.read_ended = true;
                }
            }
            SocketEvent::Error(client_id, error) => {
                tracing::warn!("Connection error on {}: {}", client_id, error);
                self.send_out(OutCommand::Error(CommandEnvelope::now(ErrorArgs {
                    client_id,
                    error: error.to_string(),
                })))
                .await;
            }
            SocketEvent::Closed(client_id) => {
                let removed = self.connections.lock().remove(&client_id);
                if removed.is_none() {
                    // Already cleaned up, e.g. by a liveness probe.
                    tracing::debug!("Close for unknown connection {}", client_id);
                    return;
                }
                self.metrics.connection_closed();
                self.forget_client(&client_id).await;
                self.send_out(OutCommand::Disconnected(CommandEnvelope::now(ClientArgs {
                    client_id,
                })))
                .await;
            }
        }
    }

    /// The server pinged us. Give the bridge a bounded window to answer
    /// before answering on its behalf; servers disconnect sessions that
    /// leave keep-alives unanswered.
    fn arm_pong_timer(&self, client_id: ClientId, argument: String) {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get_mut(&client_id) else {
            return;
        };
        conn.abort_pending_pong();

        let control = conn.control_channel.clone();
        let timeout = self.config.pong_timeout();
        let timer_id = client_id.clone();
        conn.pending_pong = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!("Answering PING on behalf of the bridge for {}", timer_id);
            let pong = format!("PONG {}\r\n", argument);
            if let Err(e) = control.try_send(ConnectionControlDetail::Send(pong.into_bytes())) {
                tracing::warn!("Unable to send autonomous PONG for {}: {}", timer_id, e);
            }
        }));
    }

    async fn heartbeat(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self
            .transport
            .set_value(HEARTBEAT_KEY, now.to_string().into_bytes())
            .await
        {
            tracing::warn!("Failed to write pool heartbeat: {}", e);
        }
        // The inbound stream is trimmed against the reader's cursor; the
        // outbound stream can only be bounded by length, since the bridge's
        // cursor is not ours to know.
        if let Err(e) = self
            .transport
            .trim_max_len(COMMAND_OUT_STREAM, self.config.trim_max_len)
            .await
        {
            tracing::warn!("Failed to trim the outbound stream: {}", e);
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl CommandStreamHandler for PoolInner {
    // Commands for one session must not overtake each other; session-less
    // commands order by their tag.
    fn dispatch_lane(&self, entry: &StreamEntry) -> String {
        match envelope_session(&entry.value) {
            Some(client_id) => client_id.to_string(),
            None => entry.key.clone(),
        }
    }

    async fn handle(self: Arc<Self>, entry: StreamEntry) -> Result<(), CommandError> {
        let cmd = InCommand::from_wire(&entry.key, &entry.value)?;
        self.handle_in_command(cmd).await;
        Ok(())
    }
}

/// A running pool service.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    reader_stop: Arc<Notify>,
    reader_task: JoinHandle<()>,
    event_pump: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    metrics_server: Option<MetricsServer>,
}

impl ConnectionPool {
    /// Publish our protocol version, invalidate any bookkeeping left by a
    /// previous instance, and start consuming the inbound command stream
    /// from the saved cursor if one exists.
    pub async fn start(
        transport: Arc<dyn Transport>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        transport
            .set_value(VERSION_KEY, PROTOCOL_VERSION.to_string().into_bytes())
            .await?;
        // A restart invalidates every liveness claim from the previous
        // instance; its sockets died with it.
        transport.hash_clear(CONNECTIONS_KEY).await?;
        transport.hash_clear(CLIENT_STATE_KEY).await?;

        let cursor_key = last_read_key(&config.pool_name);
        let cursor = match transport.get_value(&cursor_key).await? {
            Some(bytes) => match std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
            {
                Some(id) => Cursor::After(id),
                None => {
                    tracing::warn!("Discarding unreadable saved cursor");
                    Cursor::Head
                }
            },
            None => Cursor::Head,
        };

        let (event_tx, event_rx) = channel(SOCKET_EVENT_QUEUE_LEN);
        let metrics = Arc::new(MetricsData::new());
        let inner = Arc::new(PoolInner::new(
            Arc::clone(&transport),
            config.clone(),
            event_tx,
            Arc::clone(&metrics),
        ));

        let event_pump = tokio::spawn(Self::pump_socket_events(Arc::clone(&inner), event_rx));

        let (reader, reader_stop) = CommandReader::new(
            transport,
            COMMAND_IN_STREAM,
            cursor,
            Arc::clone(&inner) as Arc<dyn CommandStreamHandler>,
            Some(cursor_key),
            &config,
        );
        let reader_task = tokio::spawn(reader.run());

        let heartbeat_inner = Arc::clone(&inner);
        let heartbeat_interval = config.heartbeat_interval();
        let heartbeat_task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(heartbeat_interval);
            loop {
                timer.tick().await;
                heartbeat_inner.heartbeat().await;
            }
        });

        let metrics_server = config
            .metrics_address
            .map(|addr| MetricsServer::start(addr, metrics));

        Ok(Self {
            inner,
            reader_stop,
            reader_task,
            event_pump,
            heartbeat_task,
            metrics_server,
        })
    }

    async fn pump_socket_events(inner: Arc<PoolInner>, mut event_rx: Receiver<SocketEvent>) {
        while let Some(event) = event_rx.recv().await {
            inner.handle_socket_event(event).await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connection_count()
    }

    /// Announce the shutdown, say goodbye to every server, and stop reading
    /// further commands.
    pub async fn stop(self) {
        self.inner
            .send_out(OutCommand::PoolClosing(CommandEnvelope::now(EmptyArgs {})))
            .await;

        let controls: Vec<_> = self
            .inner
            .connections
            .lock()
            .values()
            .map(|conn| conn.control_channel.clone())
            .collect();
        for control in controls {
            let _ = control
                .try_send(ConnectionControlDetail::Send(
                    b"QUIT :Process terminating\r\n".to_vec(),
                ))
                .and_then(|_| control.try_send(ConnectionControlDetail::End));
        }

        self.reader_stop.notify_one();
        let _ = self.reader_task.await;
        self.heartbeat_task.abort();
        self.event_pump.abort();
        if let Some(metrics_server) = self.metrics_server {
            metrics_server.stop();
        }
    }
}
