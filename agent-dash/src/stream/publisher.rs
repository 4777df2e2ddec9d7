//! Buffered, retrying publisher of registry and session events.
//!
//! Each destination (the shared registry stream and one stream per session)
//! owns a FIFO buffer of serialized records. A flush takes the whole buffer,
//! appends it as one batch and, on failure, puts the batch back in front of
//! anything published in the meantime. Flushes of one destination are
//! serialized, so batches reach the store in publish order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{PublishError, StreamError};
use crate::session::config::PublisherConfig;
use crate::session::protocol::{
    encode_record, session_stream_key, RegistryEvent, SessionStreamEvent, REGISTRY_STREAM_KEY,
};
use crate::stream::client::DurableStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A batch the publisher gave up on after too many failed flushes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub destination: String,
    pub records: Vec<String>,
    pub error: String,
}

struct Destination {
    key: String,
    buffer: Mutex<VecDeque<String>>,
    /// Held for the duration of a flush (or an unbuffered append)
    flush_lock: tokio::sync::Mutex<()>,
    failed_flushes: AtomicU32,
}

impl Destination {
    fn new(key: String) -> Self {
        Self {
            key,
            buffer: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            failed_flushes: AtomicU32::new(0),
        }
    }

    /// Push a record and report the new buffer length
    fn push(&self, record: String) -> usize {
        let mut buffer = lock(&self.buffer);
        buffer.push_back(record);
        buffer.len()
    }

    fn take_batch(&self) -> InFlightBatch<'_> {
        let records: Vec<String> = lock(&self.buffer).drain(..).collect();
        InFlightBatch {
            destination: self,
            records: Some(records),
        }
    }

    fn len(&self) -> usize {
        lock(&self.buffer).len()
    }
}

/// Records taken out of a buffer for one flush.
///
/// Unless committed, the records go back to the front of the buffer on drop,
/// which also covers a flush future that is dropped mid-append.
struct InFlightBatch<'a> {
    destination: &'a Destination,
    records: Option<Vec<String>>,
}

impl InFlightBatch<'_> {
    fn records(&self) -> &[String] {
        self.records.as_deref().unwrap_or_default()
    }

    fn commit(mut self) -> Vec<String> {
        self.records.take().unwrap_or_default()
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        if let Some(records) = self.records.take() {
            let mut buffer = lock(&self.destination.buffer);
            for record in records.into_iter().rev() {
                buffer.push_front(record);
            }
        }
    }
}

struct AutoFlush {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Publishes registry and per-session events to a [`DurableStream`].
///
/// Construct one per process and share it by `Arc`.
pub struct StreamPublisher {
    client: Arc<dyn DurableStream>,
    config: PublisherConfig,
    /// Keys known to exist; avoids a create call per flush
    created: Mutex<HashSet<String>>,
    registry: Arc<Destination>,
    /// Session destinations keyed by stream key
    sessions: Mutex<HashMap<String, Arc<Destination>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    auto_flush: Mutex<Option<AutoFlush>>,
}

impl StreamPublisher {
    pub fn new(client: Arc<dyn DurableStream>, config: PublisherConfig) -> Self {
        Self {
            client,
            config,
            created: Mutex::new(HashSet::new()),
            registry: Arc::new(Destination::new(REGISTRY_STREAM_KEY.to_string())),
            sessions: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            auto_flush: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Create `key` on the store unless this publisher already did.
    ///
    /// An "already exists" conflict counts as success.
    pub async fn ensure_exists(&self, key: &str) -> Result<(), StreamError> {
        if lock(&self.created).contains(key) {
            return Ok(());
        }

        match self.client.create(key).await {
            Ok(()) => tracing::debug!(destination = key, "created destination"),
            Err(e) if e.is_conflict() => {
                tracing::trace!(destination = key, "destination already exists")
            }
            Err(e) => return Err(e),
        }

        lock(&self.created).insert(key.to_string());
        Ok(())
    }

    pub async fn publish_registry(&self, event: &RegistryEvent) -> Result<(), PublishError> {
        let record = encode_record(event)?;
        let destination = Arc::clone(&self.registry);
        self.publish_to(&destination, record).await
    }

    pub async fn publish_session(
        &self,
        session_id: &str,
        event: &SessionStreamEvent,
    ) -> Result<(), PublishError> {
        let record = encode_record(event)?;
        let key = session_stream_key(session_id);
        if !self.config.buffering_enabled() {
            let destination = self.session_destination(key);
            return self.append_unbuffered(&destination, record).await;
        }

        // Pushed under the map lock so close_session can't drop the
        // destination between lookup and push
        let (destination, buffered) = {
            let mut sessions = lock(&self.sessions);
            let destination = sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Destination::new(key)));
            let buffered = destination.push(record);
            (Arc::clone(destination), buffered)
        };
        if buffered >= self.config.buffer_size {
            self.flush_destination(&destination).await?;
        }
        Ok(())
    }

    async fn publish_to(&self, destination: &Destination, record: String) -> Result<(), PublishError> {
        if !self.config.buffering_enabled() {
            return self.append_unbuffered(destination, record).await;
        }

        if destination.push(record) >= self.config.buffer_size {
            self.flush_destination(destination).await?;
        }
        Ok(())
    }

    async fn append_unbuffered(
        &self,
        destination: &Destination,
        record: String,
    ) -> Result<(), PublishError> {
        let _flushing = destination.flush_lock.lock().await;
        self.append_batch(&destination.key, std::slice::from_ref(&record))
            .await
    }

    /// Session destinations are created on first publish
    fn session_destination(&self, key: String) -> Arc<Destination> {
        let mut sessions = lock(&self.sessions);
        Arc::clone(
            sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Destination::new(key))),
        )
    }

    fn find_destination(&self, key: &str) -> Option<Arc<Destination>> {
        if key == self.registry.key {
            return Some(Arc::clone(&self.registry));
        }
        lock(&self.sessions).get(key).cloned()
    }

    /// Number of records waiting in the buffer for stream `key`
    pub fn buffered(&self, key: &str) -> usize {
        self.find_destination(key).map_or(0, |d| d.len())
    }

    /// Stream keys of the session destinations currently tracked
    pub fn session_keys(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// Flush the buffer of stream `key`. Unknown keys have nothing to flush.
    pub async fn flush(&self, key: &str) -> Result<(), PublishError> {
        match self.find_destination(key) {
            Some(destination) => self.flush_destination(&destination).await,
            None => Ok(()),
        }
    }

    pub async fn flush_registry(&self) -> Result<(), PublishError> {
        let destination = Arc::clone(&self.registry);
        self.flush_destination(&destination).await
    }

    pub async fn flush_session(&self, session_id: &str) -> Result<(), PublishError> {
        self.flush(&session_stream_key(session_id)).await
    }

    async fn flush_destination(&self, destination: &Destination) -> Result<(), PublishError> {
        let _flushing = destination.flush_lock.lock().await;
        self.flush_locked(destination).await
    }

    /// Flush with the destination's flush lock already held
    async fn flush_locked(&self, destination: &Destination) -> Result<(), PublishError> {
        let batch = destination.take_batch();
        if batch.records().is_empty() {
            return Ok(());
        }

        let appended = self.append_batch(&destination.key, batch.records()).await;
        match appended {
            Ok(()) => {
                destination.failed_flushes.store(0, Ordering::SeqCst);
                let records = batch.commit();
                tracing::debug!(
                    destination = %destination.key,
                    count = records.len(),
                    "flushed events"
                );
                Ok(())
            }
            Err(err) => {
                let attempts = destination.failed_flushes.fetch_add(1, Ordering::SeqCst) + 1;
                let max = self.config.max_flush_attempts;
                if max > 0 && attempts >= max {
                    destination.failed_flushes.store(0, Ordering::SeqCst);
                    let records = batch.commit();
                    let count = records.len();
                    tracing::error!(
                        destination = %destination.key,
                        count,
                        attempts,
                        error = %err,
                        "dead-lettering events after repeated flush failures"
                    );
                    lock(&self.dead_letters).push(DeadLetter {
                        destination: destination.key.clone(),
                        records,
                        error: err.to_string(),
                    });
                    return Err(PublishError::DeadLettered {
                        destination: destination.key.clone(),
                        count,
                        attempts,
                    });
                }

                // Dropping the batch restores it ahead of newer records
                drop(batch);
                tracing::debug!(
                    destination = %destination.key,
                    attempt = attempts,
                    "flush failed, events requeued"
                );
                Err(err)
            }
        }
    }

    async fn append_batch(&self, key: &str, records: &[String]) -> Result<(), PublishError> {
        let wrap = |source: StreamError| PublishError::Stream {
            destination: key.to_string(),
            source,
        };

        self.ensure_exists(key).await.map_err(wrap)?;
        match self.client.append(key, records).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The store lost the stream; create it again on the next attempt
                if matches!(e, StreamError::Status { status: 404, .. }) {
                    lock(&self.created).remove(key);
                }
                Err(wrap(e))
            }
        }
    }

    /// Flush the registry and then every session destination.
    ///
    /// Destinations are independent: a failure is logged and the remaining
    /// destinations are still attempted. The first failure is returned.
    pub async fn flush_all(&self) -> Result<(), PublishError> {
        let mut destinations = vec![Arc::clone(&self.registry)];
        destinations.extend(lock(&self.sessions).values().cloned());

        let mut first_error = None;
        for destination in destinations {
            if let Err(e) = self.flush_destination(&destination).await {
                tracing::warn!(destination = %destination.key, error = %e, "flush failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush a session's buffer and stop tracking it.
    ///
    /// If the flush fails the destination is kept so a later flush can retry.
    pub async fn close_session(&self, session_id: &str) -> Result<(), PublishError> {
        let key = session_stream_key(session_id);
        let Some(destination) = self.find_destination(&key) else {
            return Ok(());
        };

        // Hold the flush lock until removal so no batch of this destination
        // is in flight once it's forgotten
        let _flushing = destination.flush_lock.lock().await;
        self.flush_locked(&destination).await?;

        let mut sessions = lock(&self.sessions);
        if destination.len() == 0 {
            sessions.remove(&key);
        }
        Ok(())
    }

    /// Start the periodic background flush.
    ///
    /// The timer holds only a weak reference; it ends when the publisher is
    /// dropped or [`StreamPublisher::close`] is called. Errors are logged by
    /// `flush_all` and never stop the timer.
    pub fn start_auto_flush(self: &Arc<Self>) {
        let publisher = Arc::downgrade(self);
        let period = self.config.flush_interval;
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown_rx => break,
                }

                let Some(publisher) = publisher.upgrade() else {
                    break;
                };
                // Failures were logged per destination
                let _ = publisher.flush_all().await;
            }
            tracing::trace!("auto-flush timer stopped");
        });

        let previous = lock(&self.auto_flush).replace(AutoFlush { shutdown, handle });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(());
        }
    }

    /// Stop the timer and flush everything still buffered.
    pub async fn close(&self) -> Result<(), PublishError> {
        let auto_flush = lock(&self.auto_flush).take();
        if let Some(AutoFlush { shutdown, handle }) = auto_flush {
            let _ = shutdown.send(());
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "auto-flush task ended abnormally");
            }
        }
        self.flush_all().await
    }

    /// Move everything still buffered into the dead-letter list.
    ///
    /// For shutdown after a final flush failed: the records can't be
    /// delivered by this process any more. Returns the number of records
    /// moved.
    pub async fn drain_unflushed(&self, reason: &str) -> usize {
        let mut destinations = vec![Arc::clone(&self.registry)];
        destinations.extend(lock(&self.sessions).values().cloned());

        let mut drained = 0;
        for destination in destinations {
            let _flushing = destination.flush_lock.lock().await;
            let records = destination.take_batch().commit();
            if records.is_empty() {
                continue;
            }
            drained += records.len();
            tracing::error!(
                destination = %destination.key,
                count = records.len(),
                error = reason,
                "dead-lettering undelivered events"
            );
            lock(&self.dead_letters).push(DeadLetter {
                destination: destination.key.clone(),
                records,
                error: reason.to_string(),
            });
        }
        drained
    }

    /// Drain the batches given up on so far
    pub fn take_dead_letters(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *lock(&self.dead_letters))
    }
}

impl Drop for StreamPublisher {
    fn drop(&mut self) {
        let auto_flush = self
            .auto_flush
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(auto_flush) = auto_flush {
            let _ = auto_flush.shutdown.send(());
        }

        let pending = self.registry.len()
            + lock(&self.sessions).values().map(|d| d.len()).sum::<usize>();
        if pending > 0 {
            tracing::warn!(pending, "publisher dropped with unflushed events");
        }
    }
}
