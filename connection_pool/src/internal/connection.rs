use crate::internal::*;
use crate::*;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::{
    net::{TcpSocket, TcpStream},
    sync::mpsc::{channel, Sender},
    task::JoinHandle,
};
use tokio_rustls::TlsConnector;

const SEND_QUEUE_LEN: usize = 100;

/// Control operations applied to a live socket by its [`ConnectionTask`].
#[derive(Debug)]
pub(crate) enum ConnectionControlDetail {
    Send(Vec<u8>),
    End,
    Destroy,
    SetTimeout(Duration),
}

/// Events surfaced by a [`ConnectionTask`] to the pool's event loop.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Data(ClientId, Vec<u8>),
    /// The read side saw EOF; the socket is not yet cleaned up.
    ReadEnded(ClientId),
    Error(ClientId, ConnectionError),
    Closed(ClientId),
}

/// A live socket as tracked by the pool process: the control channel into
/// its task plus the bookkeeping the pool needs to answer liveness probes
/// and take over keep-alive pings.
pub(crate) struct InternalConnection {
    pub client_id: ClientId,
    pub control_channel: Sender<ConnectionControlDetail>,
    pub local_addr: SocketAddr,
    /// Set when the task reports EOF, before the close is processed.
    pub read_ended: bool,
    /// A server PING awaiting an answer; aborted if the bridge writes the
    /// PONG itself within the window.
    pub pending_pong: Option<JoinHandle<()>>,
}

impl InternalConnection {
    fn send_control(&self, msg: ConnectionControlDetail) {
        if let Err(e) = self.control_channel.try_send(msg) {
            tracing::warn!("Error sending control message to {}: {}", self.client_id, e);
        }
    }

    pub fn abort_pending_pong(&mut self) {
        if let Some(pending) = self.pending_pong.take() {
            pending.abort();
        }
    }
}

impl Drop for InternalConnection {
    fn drop(&mut self) {
        self.abort_pending_pong();
    }
}

impl IrcSocket for InternalConnection {
    fn write(&self, data: String) {
        self.send_control(ConnectionControlDetail::Send(data.into_bytes()));
    }

    fn end(&self) {
        self.send_control(ConnectionControlDetail::End);
    }

    fn destroy(&self) {
        self.send_control(ConnectionControlDetail::Destroy);
    }

    fn set_timeout(&self, timeout: Duration) {
        self.send_control(ConnectionControlDetail::SetTimeout(timeout));
    }
}

fn tls_client_config(ignore_tls_errors: bool) -> Arc<rustls::ClientConfig> {
    if ignore_tls_errors {
        // Accepts self-signed and expired server certificates; only applied
        // when the connection explicitly asked for it.
        Arc::new(
            rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCertVerifier))
                .with_no_client_auth(),
        )
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(
            |ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            },
        ));
        Arc::new(
            rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    }
}

struct AcceptAnyServerCertVerifier;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

async fn open_tcp(spec: &ConnectSpec) -> Result<TcpStream, std::io::Error> {
    let Some(local) = &spec.local_address else {
        return TcpStream::connect((spec.host.as_str(), spec.port)).await;
    };

    let local_ip: IpAddr = local.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid local address {}", local),
        )
    })?;

    let mut last_err = None;
    for addr in tokio::net::lookup_host((spec.host.as_str(), spec.port)).await? {
        if addr.is_ipv4() != local_ip.is_ipv4() {
            continue;
        }
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(local_ip, 0))?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "No address of the requested family",
        )
    }))
}

/// Open the socket described by `spec`, spawn its task, and return the
/// pool-side connection record.
pub(crate) async fn connect_socket(
    client_id: ClientId,
    spec: &ConnectSpec,
    events: Sender<SocketEvent>,
) -> Result<InternalConnection, ConnectionError> {
    let (control_send, control_recv) = channel(SEND_QUEUE_LEN);

    let stream = open_tcp(spec).await?;
    let local_addr = stream.local_addr()?;

    if spec.tls {
        let connector = TlsConnector::from(tls_client_config(spec.ignore_tls_errors));
        let server_name: rustls::ServerName = spec.host.as_str().try_into().map_err(|_| {
            ConnectionError::TlsError(format!("Invalid server name {}", spec.host))
        })?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ConnectionError::TlsError(e.to_string()))?;
        let task = ConnectionTask::new(client_id.clone(), tls_stream, control_recv, events);
        tokio::spawn(task.run());
    } else {
        let task = ConnectionTask::new(client_id.clone(), stream, control_recv, events);
        tokio::spawn(task.run());
    }

    Ok(InternalConnection {
        client_id,
        control_channel: control_send,
        local_addr,
        read_ended: false,
        pending_pong: None,
    })
}
