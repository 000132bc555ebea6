//! Reliable at-least-once consumption of one durable command stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pool_transport::{Cursor, StreamEntry, Transport};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Notify;

use crate::{CommandError, PoolConfig};

/// Receives each stream entry after the reader has moved its cursor past it.
///
/// Entries whose [`dispatch_lane`](Self::dispatch_lane) matches are handled
/// strictly in read order; different lanes proceed concurrently, so a slow or
/// failing handler never stalls cursor advancement, subsequent reads, or
/// other sessions. Because delivery is at-least-once, handlers must tolerate
/// entries they have already applied.
#[async_trait]
pub trait CommandStreamHandler: Send + Sync + 'static {
    /// The ordering domain an entry belongs to. Defaults to the entry key;
    /// handlers whose payloads address sessions return the session id so
    /// that commands for one session never overtake each other.
    fn dispatch_lane(&self, entry: &StreamEntry) -> String {
        entry.key.clone()
    }

    async fn handle(self: Arc<Self>, entry: StreamEntry) -> Result<(), CommandError>;
}

/// Consumes one stream with block-and-timeout reads, periodic trimming, and
/// fall-back-to-head on prolonged idleness.
pub struct CommandReader {
    transport: Arc<dyn Transport>,
    stream: &'static str,
    cursor: Cursor,
    handler: Arc<dyn CommandStreamHandler>,
    /// Scalar key to persist the cursor under, for consumers that resume.
    save_cursor_key: Option<String>,
    block_timeout: Duration,
    trim_interval: Duration,
    trim_max_len: usize,
    stop: Arc<Notify>,
}

impl CommandReader {
    pub fn new(
        transport: Arc<dyn Transport>,
        stream: &'static str,
        cursor: Cursor,
        handler: Arc<dyn CommandStreamHandler>,
        save_cursor_key: Option<String>,
        config: &PoolConfig,
    ) -> (Self, Arc<Notify>) {
        let stop = Arc::new(Notify::new());
        let reader = Self {
            transport,
            stream,
            cursor,
            handler,
            save_cursor_key,
            block_timeout: config.command_block_timeout(),
            trim_interval: config.trim_interval(),
            trim_max_len: config.trim_max_len,
            stop: Arc::clone(&stop),
        };
        (reader, stop)
    }

    pub async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.trim_interval;
        let mut trim_timer = tokio::time::interval_at(start, self.trim_interval);
        let stop = Arc::clone(&self.stop);
        let mut lanes: HashMap<String, UnboundedSender<StreamEntry>> = HashMap::new();
        tracing::info!("Listening for commands on {}", self.stream);
        loop {
            let transport = Arc::clone(&self.transport);
            let (stream, cursor, block_timeout) = (self.stream, self.cursor, self.block_timeout);
            select! {
                _ = stop.notified() =>
                {
                    tracing::info!("Command reader for {} finished", self.stream);
                    break;
                }
                batch = async move { transport.read_blocking(stream, cursor, block_timeout).await } =>
                {
                    match batch
                    {
                        Ok(batch) if batch.is_empty() =>
                        {
                            // Prolonged silence: assume we have seen everything
                            // useful rather than replaying an arbitrarily old
                            // cursor forever.
                            tracing::info!(
                                "Stream {} idle for {:?}, listening for new entries at the head",
                                self.stream, self.block_timeout
                            );
                            self.cursor = Cursor::Head;
                        }
                        Ok(batch) =>
                        {
                            for entry in batch
                            {
                                // Move the cursor first; if we crash inside a
                                // handler we must not get stuck on this entry.
                                self.advance_cursor(entry.id).await;
                                self.dispatch(&mut lanes, entry);
                            }
                        }
                        Err(e) =>
                        {
                            tracing::warn!("Failed to read new commands from {}: {}", self.stream, e);
                        }
                    }
                }
                _ = trim_timer.tick() =>
                {
                    self.trim().await;
                }
            }
        }
    }

    /// Hand the entry to its lane's worker, spawning the worker on first
    /// use. Each worker drains its queue one entry at a time, so a lane is a
    /// strict FIFO; lanes run independently of each other and of the reader.
    fn dispatch(&self, lanes: &mut HashMap<String, UnboundedSender<StreamEntry>>, entry: StreamEntry) {
        let lane = self.handler.dispatch_lane(&entry);
        let sender = lanes.entry(lane).or_insert_with(|| {
            let (tx, mut rx) = unbounded_channel::<StreamEntry>();
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                while let Some(entry) = rx.recv().await {
                    let id = entry.id;
                    let key = entry.key.clone();
                    if let Err(e) = Arc::clone(&handler).handle(entry).await {
                        tracing::warn!("Failed to handle entry {} ({}): {}", id, key, e);
                    }
                }
            });
            tx
        });
        if sender.send(entry).is_err() {
            tracing::error!("Dispatch worker for {} has gone away", self.stream);
        }
    }

    async fn advance_cursor(&mut self, id: pool_transport::StreamEntryId) {
        self.cursor = Cursor::After(id);
        if let Some(key) = &self.save_cursor_key {
            if let Err(e) = self
                .transport
                .set_value(key, id.to_string().into_bytes())
                .await
            {
                tracing::warn!("Unable to update last-read cursor for {}: {}", self.stream, e);
            }
        }
    }

    async fn trim(&self) {
        // At the head of the stream there is nothing we know to be consumed.
        let Cursor::After(cursor_id) = self.cursor else {
            return;
        };
        let result = if self.transport.supports_trim_min_id() {
            self.transport.trim_min_id(self.stream, cursor_id).await
        } else {
            self.transport
                .trim_max_len(self.stream, self.trim_max_len)
                .await
        };
        match result {
            Ok(count) if count > 0 => {
                tracing::debug!("Trimmed {} entries from {}", count, self.stream)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to trim entries from {}: {}", self.stream, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_transport::MemoryTransport;
    use parking_lot::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl RecordingHandler {
        fn new(delay: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl CommandStreamHandler for RecordingHandler {
        async fn handle(self: Arc<Self>, entry: StreamEntry) -> Result<(), CommandError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let label = if entry.value.is_empty() {
                entry.key
            } else {
                String::from_utf8_lossy(&entry.value).to_string()
            };
            self.seen.lock().push(label);
            Ok(())
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            command_block_timeout_ms: 50,
            trim_interval_ms: 100,
            ..PoolConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Condition not reached in time");
    }

    #[tokio::test]
    async fn dispatches_entries_in_read_order() {
        let transport = Arc::new(MemoryTransport::new());
        let handler = RecordingHandler::new(None);
        let (reader, stop) = CommandReader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "in",
            Cursor::Head,
            Arc::clone(&handler) as Arc<dyn CommandStreamHandler>,
            None,
            &test_config(),
        );
        let task = tokio::spawn(reader.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        for key in ["a", "b", "c"] {
            transport.append("in", key, Vec::new()).await.unwrap();
        }
        wait_for(|| handler.seen.lock().len() == 3).await;
        assert_eq!(*handler.seen.lock(), vec!["a", "b", "c"]);

        stop.notify_one();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_lane_entries_never_overtake_each_other() {
        let transport = Arc::new(MemoryTransport::new());
        // Seed the whole batch up front so it arrives in one read.
        for i in 0..50 {
            transport
                .append("in", "w", i.to_string().into_bytes())
                .await
                .unwrap();
        }

        let handler = RecordingHandler::new(Some(Duration::from_millis(1)));
        let (reader, stop) = CommandReader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "in",
            Cursor::After(pool_transport::StreamEntryId(0)),
            Arc::clone(&handler) as Arc<dyn CommandStreamHandler>,
            None,
            &test_config(),
        );
        let task = tokio::spawn(reader.run());

        wait_for(|| handler.seen.lock().len() == 50).await;
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(*handler.seen.lock(), expected);

        stop.notify_one();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn slow_handler_does_not_stall_later_entries() {
        let transport = Arc::new(MemoryTransport::new());
        let handler = RecordingHandler::new(Some(Duration::from_millis(200)));
        let (reader, stop) = CommandReader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "in",
            Cursor::Head,
            Arc::clone(&handler) as Arc<dyn CommandStreamHandler>,
            None,
            &test_config(),
        );
        let task = tokio::spawn(reader.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.append("in", "slow", Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.append("in", "next", Vec::new()).await.unwrap();

        // Both handlers complete even though each sleeps longer than the gap
        // between appends: the two keys are distinct lanes.
        wait_for(|| handler.seen.lock().len() == 2).await;

        stop.notify_one();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn idle_timeout_resets_cursor_to_head() {
        let transport = Arc::new(MemoryTransport::new());
        // Seed an entry the reader will consume, then let it go idle.
        transport.append("in", "first", Vec::new()).await.unwrap();

        let handler = RecordingHandler::new(None);
        let (reader, stop) = CommandReader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "in",
            Cursor::After(pool_transport::StreamEntryId(0)),
            Arc::clone(&handler) as Arc<dyn CommandStreamHandler>,
            None,
            &test_config(),
        );
        let task = tokio::spawn(reader.run());

        wait_for(|| handler.seen.lock().len() == 1).await;
        // Wait out at least one idle cycle, then confirm new entries still flow.
        tokio::time::sleep(Duration::from_millis(150)).await;
        transport.append("in", "after-idle", Vec::new()).await.unwrap();
        wait_for(|| handler.seen.lock().len() == 2).await;

        stop.notify_one();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn saves_cursor_before_dispatch() {
        let transport = Arc::new(MemoryTransport::new());
        let handler = RecordingHandler::new(None);
        let (reader, stop) = CommandReader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "in",
            Cursor::Head,
            Arc::clone(&handler) as Arc<dyn CommandStreamHandler>,
            Some("last-read.test".to_string()),
            &test_config(),
        );
        let task = tokio::spawn(reader.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = transport.append("in", "a", Vec::new()).await.unwrap();
        wait_for(|| handler.seen.lock().len() == 1).await;

        let saved = transport.get_value("last-read.test").await.unwrap();
        assert_eq!(saved, Some(id.to_string().into_bytes()));

        stop.notify_one();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn trim_never_removes_entries_at_or_after_the_cursor() {
        let transport = Arc::new(MemoryTransport::new());
        let handler = RecordingHandler::new(None);
        let (reader, stop) = CommandReader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            "in",
            Cursor::Head,
            Arc::clone(&handler) as Arc<dyn CommandStreamHandler>,
            None,
            &test_config(),
        );
        let task = tokio::spawn(reader.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..50u32 {
            transport
                .append("in", "k", i.to_string().into_bytes())
                .await
                .unwrap();
        }
        wait_for(|| handler.seen.lock().len() == 50).await;

        // Let the trim timer fire at least once.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Everything before the cursor may be gone, but the cursor entry
        // itself (the last one read) must survive.
        assert_eq!(transport.stream_len("in"), 1);

        stop.notify_one();
        task.await.unwrap();
    }
}
