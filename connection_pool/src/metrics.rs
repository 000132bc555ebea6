//! Plain-text metrics endpoint for the pool process.

use hyper::{Body, Method, Request, Response, StatusCode};
use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task;
use tracing::Instrument;

/// Counters shared between the pool's event handling and the HTTP service.
pub struct MetricsData {
    connections: AtomicUsize,
    connections_opened_total: AtomicU64,
    started_at: Instant,
}

impl MetricsData {
    pub fn new() -> Self {
        Self {
            connections: AtomicUsize::new(0),
            connections_opened_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.connections_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn render(&self) -> String {
        format!(
            "irc_pool_connections {}\nirc_pool_connections_opened_total {}\nirc_pool_uptime_seconds {}\n",
            self.connections.load(Ordering::Relaxed),
            self.connections_opened_total.load(Ordering::Relaxed),
            self.started_at.elapsed().as_secs(),
        )
    }
}

impl Default for MetricsData {
    fn default() -> Self {
        Self::new()
    }
}

struct MetricsService {
    data: Arc<MetricsData>,
}

impl hyper::service::Service<Request<Body>> for MetricsService {
    type Response = Response<Body>;
    type Error = hyper::Error;
    #[allow(clippy::type_complexity)]
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let data = Arc::clone(&self.data);

        Box::pin(async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/metrics") => Ok(Response::new(Body::from(data.render()))),
                (_, "/metrics") => {
                    let mut response = Response::default();
                    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                    Ok(response)
                }
                _ => {
                    let mut response = Response::default();
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    Ok(response)
                }
            }
        })
    }
}

pub struct MetricsServer {
    shutdown: oneshot::Sender<()>,
    server_task: task::JoinHandle<()>,
}

impl MetricsServer {
    pub fn start(address: std::net::SocketAddr, data: Arc<MetricsData>) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let server_task = task::spawn(
            async move {
                let listener = match TcpListener::bind(&address).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::error!("Failed to bind metrics address {}: {}", address, e);
                        return;
                    }
                };
                tracing::info!("Serving metrics on {}", address);

                loop {
                    select! {
                        res = listener.accept() => {
                            if let Ok((conn, _)) = res {
                                let service = MetricsService { data: Arc::clone(&data) };
                                let http = hyper::server::conn::Http::new();
                                if let Err(e) = http.serve_connection(conn, service).await {
                                    tracing::warn!("Error handling metrics connection: {}", e);
                                }
                            }
                        }
                        _ = &mut shutdown_rx => {
                            break;
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("metrics server")),
        );

        Self {
            shutdown,
            server_task,
        }
    }

    pub fn stop(self) {
        let _ = self.shutdown.send(());
        self.server_task.abort();
    }
}
