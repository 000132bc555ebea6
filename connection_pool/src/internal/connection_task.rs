use crate::internal::*;
use crate::*;

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc::{Receiver, Sender},
    time::Instant,
};

const READ_BUFFER_LEN: usize = 4096;

/// Runs one real socket: applies control commands from the pool and turns
/// socket activity into [`SocketEvent`]s.
pub(crate) struct ConnectionTask<S> {
    client_id: ClientId,
    conn: S,
    control_channel: Receiver<ConnectionControlDetail>,
    event_channel: Sender<SocketEvent>,
    idle_timeout: Option<Duration>,
}

impl<S> ConnectionTask<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        client_id: ClientId,
        stream: S,
        control: Receiver<ConnectionControlDetail>,
        events: Sender<SocketEvent>,
    ) -> Self {
        Self {
            client_id,
            conn: stream,
            control_channel: control,
            event_channel: events,
            idle_timeout: None,
        }
    }

    async fn send_event(events: &Sender<SocketEvent>, event: SocketEvent) {
        if events.send(event).await.is_err() {
            tracing::error!("Error notifying socket event; pool has gone away");
        }
    }

    pub async fn run(mut self) {
        let (mut reader, mut writer) = tokio::io::split(self.conn);
        let mut buf = vec![0u8; READ_BUFFER_LEN];
        let mut read_ended = false;
        let mut idle_deadline: Option<Instant> = None;

        loop {
            // A disabled select branch still evaluates its expression, so the
            // idle sleep needs a real deadline even when the timer is unarmed.
            let sleep_until = idle_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
            select! {
                control = self.control_channel.recv() => match control
                {
                    None => { break; },
                    Some(ConnectionControlDetail::Destroy) => { break; },
                    Some(ConnectionControlDetail::End) => {
                        // Half-close; keep draining reads until the server
                        // hangs up.
                        let _ = writer.shutdown().await;
                    }
                    Some(ConnectionControlDetail::Send(data)) => {
                        if let Err(e) = writer.write_all(&data).await {
                            Self::send_event(
                                &self.event_channel,
                                SocketEvent::Error(self.client_id.clone(), ConnectionError::from(e)),
                            ).await;
                            break;
                        }
                    }
                    Some(ConnectionControlDetail::SetTimeout(timeout)) => {
                        self.idle_timeout = Some(timeout);
                        idle_deadline = Some(Instant::now() + timeout);
                    }
                },
                result = reader.read(&mut buf), if !read_ended => match result
                {
                    Ok(0) => {
                        read_ended = true;
                        Self::send_event(
                            &self.event_channel,
                            SocketEvent::ReadEnded(self.client_id.clone()),
                        ).await;
                        let _ = writer.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        idle_deadline = self.idle_timeout.map(|t| Instant::now() + t);
                        Self::send_event(
                            &self.event_channel,
                            SocketEvent::Data(self.client_id.clone(), buf[..n].to_vec()),
                        ).await;
                    }
                    Err(e) => {
                        Self::send_event(
                            &self.event_channel,
                            SocketEvent::Error(self.client_id.clone(), ConnectionError::from(e)),
                        ).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(sleep_until), if idle_deadline.is_some() =>
                {
                    Self::send_event(
                        &self.event_channel,
                        SocketEvent::Error(self.client_id.clone(), ConnectionError::Timeout),
                    ).await;
                    break;
                }
            }
        }

        tracing::info!("closing {}", self.client_id);
        Self::send_event(
            &self.event_channel,
            SocketEvent::Closed(self.client_id.clone()),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::sync::mpsc::channel;

    /// Reads never complete; every write fails.
    struct BrokenPipeStream;

    impl AsyncRead for BrokenPipeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenPipeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_write_reports_an_error_before_closing() {
        let (control_tx, control_rx) = channel(16);
        let (event_tx, mut event_rx) = channel(16);
        let task = ConnectionTask::new(
            ClientId::from("abc"),
            BrokenPipeStream,
            control_rx,
            event_tx,
        );
        let task = tokio::spawn(task.run());

        control_tx
            .send(ConnectionControlDetail::Send(b"NICK abc\r\n".to_vec()))
            .await
            .unwrap();

        match event_rx.recv().await.unwrap() {
            SocketEvent::Error(client_id, ConnectionError::IoError(_)) => {
                assert_eq!(client_id.as_str(), "abc");
            }
            other => panic!("Expected an error event, got {:?}", other),
        }
        match event_rx.recv().await.unwrap() {
            SocketEvent::Closed(client_id) => assert_eq!(client_id.as_str(), "abc"),
            other => panic!("Expected a close event, got {:?}", other),
        }
        task.await.unwrap();
    }
}
