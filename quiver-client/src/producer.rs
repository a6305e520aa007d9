//! Producer client for publishing messages to one topic
//!
//! Messages are stamped with a strictly increasing sequence id, grouped into
//! batches and written to the broker owning the topic. Every accepted message
//! resolves exactly once, with either its `MessageId` or an error.

use crate::backoff::Backoff;
use crate::client::{Client, ClientShared, ProducerRegistry};
use crate::config::{ProducerConfig, ProducerConfigBuilder};
use crate::connection::{Connection, ConnectionId, ProducerEvent};
use crate::error::{ClientError, ServerError};
use crate::protocol::{Command, Message, MessageId, ProducerId, SequenceId};
use crate::topic::TopicName;
use crate::tracker::{PendingSend, PendingTracker, SendOutcome, SendResult};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Size limit assumed until a broker reports its own
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStatus {
    /// Registered on a live connection
    Ready,
    /// Waiting for a new connection
    Disconnected,
    /// `close` is draining outstanding messages
    Closing,
    Closed,
}

#[derive(Debug)]
struct ProducerState {
    status: ProducerStatus,
    connection: Weak<Connection>,
    connection_id: Option<ConnectionId>,
    producer_name: Option<String>,
    max_message_size: usize,
    next_sequence_id: SequenceId,
    /// Accepted but not yet written, in sequence order
    batch: Vec<PendingSend>,
    /// Encoded size of `batch`
    batch_bytes: usize,
    /// Written and awaiting receipts
    tracker: PendingTracker,
}

impl ProducerState {
    fn push_batch(&mut self, entry: PendingSend) {
        self.batch_bytes += entry.message.encoded_len();
        self.batch.push(entry);
    }

    fn take_batch(&mut self) -> Vec<PendingSend> {
        self.batch_bytes = 0;
        std::mem::take(&mut self.batch)
    }
}

#[derive(Debug)]
struct ProducerInner {
    id: ProducerId,
    topic: TopicName,
    config: ProducerConfig,
    client: Arc<ClientShared>,
    state: Mutex<ProducerState>,
    events_tx: mpsc::UnboundedSender<ProducerEvent>,
    /// Signalled whenever entries resolve
    drained: Notify,
    shutdown: CancellationToken,
    registry: Weak<ProducerRegistry>,
}

/// High-level producer handle; clones share the same producer
#[derive(Debug, Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub(crate) async fn create(
        id: ProducerId,
        topic: TopicName,
        config: ProducerConfig,
        client: Arc<ClientShared>,
        registry: Weak<ProducerRegistry>,
    ) -> Result<Self, ClientError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = ProducerState {
            status: ProducerStatus::Disconnected,
            connection: Weak::new(),
            connection_id: None,
            producer_name: config.producer_name.clone(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            next_sequence_id: 0,
            batch: Vec::new(),
            batch_bytes: 0,
            tracker: PendingTracker::new(client.metrics.clone()),
        };

        let inner = Arc::new(ProducerInner {
            id,
            topic,
            config,
            client,
            state: Mutex::new(state),
            events_tx,
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
            registry,
        });

        inner.bind().await?;
        tokio::spawn(inner.clone().run(events_rx));

        info!(
            "Created producer {} ({}) on {}",
            id,
            inner.state.lock().producer_name.as_deref().unwrap_or("-"),
            inner.topic
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    pub fn topic(&self) -> &TopicName {
        &self.inner.topic
    }

    /// Name assigned by the broker, or the configured one
    pub fn producer_name(&self) -> Option<String> {
        self.inner.state.lock().producer_name.clone()
    }

    pub fn status(&self) -> ProducerStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.lock();
        state.status == ProducerStatus::Ready
            && state
                .connection
                .upgrade()
                .is_some_and(|connection| connection.is_healthy())
    }

    /// Messages accepted but not yet acknowledged
    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.batch.len() + state.tracker.len()
    }

    /// Sequence id handed to the most recently accepted message
    pub fn last_sequence_id(&self) -> Option<SequenceId> {
        self.inner.state.lock().next_sequence_id.checked_sub(1)
    }

    /// Accept a message for delivery.
    ///
    /// Returns once the message is batched; the returned future resolves when
    /// the broker acknowledges it or it fails for good.
    pub fn send<M: Into<Message>>(&self, message: M) -> Result<SendFuture, ClientError> {
        let message = message.into();
        let mut state = self.inner.state.lock();

        if matches!(
            state.status,
            ProducerStatus::Closing | ProducerStatus::Closed
        ) {
            return Err(ClientError::ProducerClosed);
        }

        message.validate()?;
        let size = message.size();
        if size > state.max_message_size {
            return Err(ClientError::MessageTooLarge {
                size,
                max_size: state.max_message_size,
            });
        }

        if state.batch.len() + state.tracker.len() >= self.inner.config.max_pending_messages {
            return Err(ClientError::ProducerQueueFull {
                max_pending: self.inner.config.max_pending_messages,
            });
        }

        // Write what is batched before this message would push it past the byte budget
        let max_bytes = self.inner.config.effective_batch_bytes();
        if !state.batch.is_empty() && state.batch_bytes + message.encoded_len() > max_bytes {
            self.inner.flush_locked(&mut state);
        }

        let sequence_id = state.next_sequence_id;
        state.next_sequence_id += 1;
        let (entry, receiver) = PendingSend::new(sequence_id, message);
        state.push_batch(entry);
        trace!("Producer {} accepted sequence {}", self.inner.id, sequence_id);

        if state.batch.len() >= self.inner.config.effective_batch_size()
            || state.batch_bytes >= max_bytes
        {
            self.inner.flush_locked(&mut state);
        }

        Ok(SendFuture {
            sequence_id,
            receiver,
        })
    }

    /// Send a message and wait for its acknowledgment, bounded by `send_timeout`
    pub async fn send_sync<M: Into<Message>>(&self, message: M) -> Result<MessageId, ClientError> {
        let pending = self.send(message)?;
        let send_timeout = self.inner.config.send_timeout;
        if send_timeout.is_zero() {
            return pending.await;
        }

        // The expiry sweep runs once per batching interval
        let deadline = send_timeout + self.inner.config.batching_max_delay * 2;
        match tokio::time::timeout(deadline, pending).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::timeout(send_timeout.as_millis() as u64)),
        }
    }

    /// Write the current batch and wait until every message accepted so far
    /// has resolved
    pub async fn flush(&self) -> Result<(), ClientError> {
        let target = {
            let mut state = self.inner.state.lock();
            if state.status == ProducerStatus::Closed {
                return Err(ClientError::ProducerClosed);
            }
            self.inner.flush_locked(&mut state);
            state.next_sequence_id.checked_sub(1)
        };

        if let Some(target) = target {
            self.inner.wait_until_resolved(target).await;
        }
        Ok(())
    }

    /// Flush, wait up to `close_timeout` for acknowledgments and release the
    /// producer. Messages still outstanding at the deadline fail with a timeout.
    pub async fn close(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        let target = {
            let mut state = inner.state.lock();
            match state.status {
                ProducerStatus::Closing | ProducerStatus::Closed => return Ok(()),
                _ => {}
            }
            state.status = ProducerStatus::Closing;
            inner.flush_locked(&mut state);

            // Without a connection there is nowhere to write the batch
            let unflushed = state.batch.len();
            for entry in state.take_batch() {
                inner.client.metrics.record_send_error();
                entry.complete(Err(ClientError::ProducerClosed));
            }
            if unflushed > 0 {
                warn!(
                    "Producer {} closing while disconnected; failed {} unsent messages",
                    inner.id, unflushed
                );
            }

            if state.tracker.is_empty() {
                None
            } else {
                state.next_sequence_id.checked_sub(1)
            }
        };
        inner.drained.notify_waiters();

        let close_timeout = inner.config.close_timeout;
        let timed_out = match target {
            Some(target) => {
                tokio::time::timeout(close_timeout, inner.wait_until_resolved(target))
                    .await
                    .is_err()
            }
            None => false,
        };

        let connection = {
            let mut state = inner.state.lock();
            if timed_out {
                let timeout_ms = close_timeout.as_millis() as u64;
                let failed = state.tracker.fail_all(|_| ClientError::timeout(timeout_ms));
                warn!(
                    "Producer {} closed with {} unacknowledged messages",
                    inner.id, failed
                );
            }
            state.status = ProducerStatus::Closed;
            state.connection_id = None;
            std::mem::take(&mut state.connection).upgrade()
        };
        inner.drained.notify_waiters();
        inner.shutdown.cancel();

        if let Some(connection) = connection {
            match connection
                .send_request(Command::CloseProducer {
                    request_id: 0,
                    producer_id: inner.id,
                })
                .await
            {
                Ok(Command::Success { .. }) => {}
                Ok(other) => debug!("Unexpected close response: {:?}", other),
                Err(e) => debug!("Close request for producer {} failed: {}", inner.id, e),
            }
            connection.remove_producer(inner.id);
        }

        if let Some(registry) = inner.registry.upgrade() {
            registry.remove(&inner.id);
        }

        info!("Producer {} on {} closed", inner.id, inner.topic);
        Ok(())
    }

    /// Stop without draining; used when the owning client is dropped
    pub(crate) fn abort(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            state.status = ProducerStatus::Closed;
            for entry in state.take_batch() {
                entry.complete(Err(ClientError::ProducerClosed));
            }
            state.tracker.fail_all(|_| ClientError::ProducerClosed);
            if let Some(connection) = std::mem::take(&mut state.connection).upgrade() {
                connection.remove_producer(inner.id);
            }
        }
        inner.drained.notify_waiters();
        inner.shutdown.cancel();
    }
}

impl ProducerInner {
    /// Look up the owning broker and register this producer there.
    /// A "not owner" answer triggers one fresh lookup.
    async fn bind(&self) -> Result<(), ClientError> {
        let mut relooked = false;

        loop {
            let endpoint = self.client.lookup.resolve(&self.topic).await?;
            let connection = self.client.manager.get_connection(&endpoint).await?;
            connection.register_producer(self.id, self.events_tx.clone())?;

            let producer_name = self.state.lock().producer_name.clone();
            let response = connection
                .send_request(Command::Producer {
                    request_id: 0,
                    producer_id: self.id,
                    topic: self.topic.to_string(),
                    producer_name,
                })
                .await;

            match response {
                Ok(Command::ProducerSuccess {
                    producer_name,
                    last_sequence_id,
                    ..
                }) => {
                    self.attach(connection, producer_name, last_sequence_id);
                    return Ok(());
                }
                Ok(Command::Error {
                    code: ServerError::ServiceNotReady,
                    message,
                    ..
                }) if !relooked => {
                    connection.remove_producer(self.id);
                    warn!(
                        "Broker {} does not serve {} ({}); looking up again",
                        endpoint, self.topic, message
                    );
                    self.client.lookup.invalidate(&self.topic);
                    relooked = true;
                }
                Ok(Command::Error { code, message, .. }) => {
                    connection.remove_producer(self.id);
                    return Err(code.to_client_error(&self.topic.to_string(), &message));
                }
                Ok(other) => {
                    connection.remove_producer(self.id);
                    return Err(ClientError::protocol(format!(
                        "Unexpected producer response: {:?}",
                        other
                    )));
                }
                Err(e) => {
                    connection.remove_producer(self.id);
                    return Err(e);
                }
            }
        }
    }

    fn attach(&self, connection: Arc<Connection>, producer_name: String, last_sequence_id: i64) {
        let mut state = self.state.lock();
        if state.status == ProducerStatus::Closed {
            connection.remove_producer(self.id);
            return;
        }

        state.connection = Arc::downgrade(&connection);
        state.connection_id = Some(connection.id());
        state.producer_name = Some(producer_name);
        state.max_message_size = connection.max_message_size();
        if let Ok(last) = SequenceId::try_from(last_sequence_id) {
            state.next_sequence_id = state.next_sequence_id.max(last + 1);
        }
        if state.status == ProducerStatus::Disconnected {
            state.status = ProducerStatus::Ready;
        }
        debug!(
            "Producer {} attached to connection {} ({})",
            self.id,
            connection.id(),
            connection.endpoint()
        );

        self.resend_locked(&mut state, &connection);
        self.flush_locked(&mut state);
    }

    fn detach_locked(&self, state: &mut ProducerState) {
        if let Some(connection) = std::mem::take(&mut state.connection).upgrade() {
            connection.remove_producer(self.id);
        }
        state.connection_id = None;
        if state.status == ProducerStatus::Ready {
            state.status = ProducerStatus::Disconnected;
        }
    }

    /// Write the batch, split into frame-sized wire batches, and move it to
    /// the tracker. Keeps the batch when no connection is available.
    fn flush_locked(&self, state: &mut ProducerState) {
        if state.batch.is_empty() {
            return;
        }
        let Some(connection) = state.connection.upgrade().filter(|c| c.is_healthy()) else {
            trace!(
                "Producer {} disconnected; holding {} batched messages",
                self.id,
                state.batch.len()
            );
            return;
        };

        let batch = state.take_batch();
        for chunk in self.split_batches(batch) {
            self.write_batch(&mut state.tracker, &connection, chunk);
        }
    }

    /// Group entries into wire batches bounded by message count and encoded size
    fn split_batches<T: Borrow<PendingSend>>(&self, entries: Vec<T>) -> Vec<Vec<T>> {
        let max_messages = self.config.effective_batch_size();
        let max_bytes = self.config.effective_batch_bytes();

        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut bytes = 0;
        for entry in entries {
            let len = entry.borrow().message.encoded_len();
            if !current.is_empty() && (current.len() >= max_messages || bytes + len > max_bytes) {
                chunks.push(std::mem::take(&mut current));
                bytes = 0;
            }
            bytes += len;
            current.push(entry);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    fn write_batch(
        &self,
        tracker: &mut PendingTracker,
        connection: &Connection,
        chunk: Vec<PendingSend>,
    ) {
        let Some((command, count, bytes)) = self.send_command(chunk.iter()) else {
            return;
        };

        // Entries are tracked either way; a failed write is resent after reconnect
        let written = match connection.send_frame(command) {
            Ok(()) => {
                self.client.metrics.record_batch(count as u64, bytes);
                true
            }
            Err(e) => {
                warn!("Producer {} could not write batch: {}", self.id, e);
                false
            }
        };

        let now = Instant::now();
        for mut entry in chunk {
            entry.sent_at = written.then_some(now);
            if let Err(e) = tracker.register(entry) {
                error!("Producer {} tracking failure: {}", self.id, e);
            }
        }
    }

    /// Rewrite every tracked message, keeping its sequence id
    fn resend_locked(&self, state: &mut ProducerState, connection: &Connection) {
        if state.tracker.is_empty() {
            return;
        }

        let mut resent = 0;
        {
            let entries: Vec<&PendingSend> = state.tracker.iter().collect();
            for chunk in self.split_batches(entries) {
                let Some((command, count, _)) = self.send_command(chunk.iter().copied()) else {
                    continue;
                };
                if let Err(e) = connection.send_frame(command) {
                    warn!("Producer {} resend interrupted: {}", self.id, e);
                    break;
                }
                resent += count;
            }
        }

        let now = Instant::now();
        for entry in state.tracker.iter_mut().take(resent) {
            entry.sent_at = Some(now);
        }
        self.client.metrics.record_resend(resent as u64);
        info!(
            "Producer {} resent {} messages to {}",
            self.id,
            resent,
            connection.endpoint()
        );
    }

    fn send_command<'a, I>(&self, entries: I) -> Option<(Command, usize, u64)>
    where
        I: IntoIterator<Item = &'a PendingSend>,
    {
        let mut messages = Vec::new();
        let mut first = None;
        let mut highest = 0;
        let mut bytes = 0u64;
        for entry in entries {
            first.get_or_insert(entry.sequence_id);
            highest = entry.sequence_id;
            bytes += entry.message.size() as u64;
            messages.push(entry.message.clone());
        }

        let sequence_id = first?;
        let count = messages.len();
        Some((
            Command::Send {
                producer_id: self.id,
                sequence_id,
                highest_sequence_id: highest,
                messages,
            },
            count,
            bytes,
        ))
    }

    fn is_resolved_through(&self, target: SequenceId) -> bool {
        let state = self.state.lock();
        state
            .tracker
            .front_sequence_id()
            .map_or(true, |front| front > target)
            && state
                .batch
                .first()
                .map_or(true, |entry| entry.sequence_id > target)
    }

    async fn wait_until_resolved(&self, target: SequenceId) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_resolved_through(target) {
                return;
            }
            notified.await;
        }
    }

    async fn run(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<ProducerEvent>) {
        let mut ticker = tokio::time::interval(
            self.config
                .batching_max_delay
                .max(Duration::from_millis(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new(self.client.config.retry_config.clone());
        let mut next_attempt = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                Some(event) = events_rx.recv() => self.handle_event(event),

                _ = ticker.tick() => {
                    self.on_tick();

                    if self.needs_reconnect() && tokio::time::Instant::now() >= next_attempt {
                        let result = tokio::select! {
                            result = self.reconnect() => result,
                            _ = self.shutdown.cancelled() => break,
                        };
                        match result {
                            Ok(()) => backoff.reset(),
                            Err(e) => {
                                let delay = backoff
                                    .next_delay()
                                    .unwrap_or(self.client.config.retry_config.max_delay);
                                self.on_reconnect_failed(e);
                                next_attempt = tokio::time::Instant::now() + delay;
                            }
                        }
                    }
                }
            }
        }

        debug!("Producer {} event loop stopped", self.id);
    }

    fn handle_event(&self, event: ProducerEvent) {
        let mut state = self.state.lock();

        match event {
            ProducerEvent::Receipt {
                sequence_id,
                ledger_id,
                entry_id,
            } => {
                let outcome = SendOutcome::Persisted {
                    ledger_id,
                    entry_id,
                };
                match state.tracker.resolve(sequence_id, outcome) {
                    Ok(resolved) => trace!(
                        "Producer {} receipt {} resolved {} messages",
                        self.id,
                        sequence_id,
                        resolved
                    ),
                    Err(e) => {
                        error!("Producer {} received invalid receipt: {}", self.id, e);
                        let reason = e.to_string();
                        state
                            .tracker
                            .fail_all(|_| ClientError::protocol(reason.clone()));
                    }
                }
            }

            ProducerEvent::SendError {
                sequence_id,
                code: ServerError::ServiceNotReady,
                message,
            } => {
                warn!(
                    "Broker no longer serves {} (sequence {}): {}",
                    self.topic, sequence_id, message
                );
                self.client.lookup.invalidate(&self.topic);
                self.detach_locked(&mut state);
                state
                    .tracker
                    .mark_for_retry(self.config.max_retries, &message);
            }

            ProducerEvent::SendError {
                sequence_id,
                code,
                message,
            } if code.is_retryable() => {
                warn!(
                    "Producer {} send of sequence {} failed ({:?}): {}; resending",
                    self.id, sequence_id, code, message
                );
                state
                    .tracker
                    .mark_for_retry(self.config.max_retries, &message);
                if let Some(connection) = state.connection.upgrade().filter(|c| c.is_healthy()) {
                    self.resend_locked(&mut state, &connection);
                }
            }

            ProducerEvent::SendError {
                sequence_id,
                code,
                message,
            } => {
                warn!(
                    "Producer {} send of sequence {} rejected ({:?}): {}",
                    self.id, sequence_id, code, message
                );
                if let Err(e) = state
                    .tracker
                    .resolve(sequence_id, SendOutcome::Rejected { code, message })
                {
                    error!("Producer {} received invalid send error: {}", self.id, e);
                }
            }

            ProducerEvent::FrameRejected {
                first_sequence_id,
                last_sequence_id,
                reason,
            } => {
                error!(
                    "Producer {} could not encode sequences {}..={}: {}",
                    self.id, first_sequence_id, last_sequence_id, reason
                );
                state
                    .tracker
                    .fail_range(first_sequence_id, last_sequence_id, |sequence_id| {
                        ClientError::SendFailed {
                            sequence_id,
                            retries: 0,
                            reason: reason.clone(),
                        }
                    });
            }

            ProducerEvent::ConnectionClosed { connection_id } => {
                if state.connection_id != Some(connection_id) {
                    debug!(
                        "Producer {} ignoring close of stale connection {}",
                        self.id, connection_id
                    );
                    return;
                }
                self.detach_locked(&mut state);
                let plan = state
                    .tracker
                    .mark_for_retry(self.config.max_retries, "connection closed");
                warn!(
                    "Producer {} lost connection {}; {} messages queued for resend, {} failed",
                    self.id, connection_id, plan.retained, plan.failed
                );
            }
        }

        drop(state);
        self.drained.notify_waiters();
    }

    fn on_tick(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);

        let send_timeout = self.config.send_timeout;
        if send_timeout.is_zero() {
            return;
        }
        let Some(cutoff) = Instant::now().checked_sub(send_timeout) else {
            return;
        };

        let timeout_ms = send_timeout.as_millis() as u64;
        let mut expired = state.tracker.expire(cutoff, timeout_ms);

        let stale = state
            .batch
            .iter()
            .take_while(|entry| entry.created_at <= cutoff)
            .count();
        for entry in state.batch.drain(..stale) {
            self.client.metrics.record_send_error();
            entry.complete(Err(ClientError::timeout(timeout_ms)));
            expired += 1;
        }
        if stale > 0 {
            state.batch_bytes = state.batch.iter().map(|e| e.message.encoded_len()).sum();
        }

        if expired > 0 {
            warn!(
                "Producer {} timed out {} messages after {:?}",
                self.id, expired, send_timeout
            );
            drop(state);
            self.drained.notify_waiters();
        }
    }

    fn needs_reconnect(&self) -> bool {
        let state = self.state.lock();
        state.connection_id.is_none()
            && match state.status {
                ProducerStatus::Disconnected => true,
                ProducerStatus::Closing => !state.tracker.is_empty(),
                _ => false,
            }
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        info!("Reconnecting producer {} for {}", self.id, self.topic);
        self.client.metrics.record_reconnection();
        self.bind().await
    }

    fn on_reconnect_failed(&self, e: ClientError) {
        let mut state = self.state.lock();

        if e.is_retryable() {
            let reason = e.to_string();
            let plan = state.tracker.mark_for_retry(self.config.max_retries, &reason);
            let unsent_failed = self.retry_unsent_locked(&mut state, &reason);
            warn!(
                "Producer {} reconnect failed: {}; {} messages waiting, {} failed",
                self.id,
                e,
                plan.retained + state.batch.len(),
                plan.failed + unsent_failed
            );
        } else {
            error!("Producer {} cannot reconnect: {}", self.id, e);
            let reason = e.to_string();
            let make_err = |sequence_id| ClientError::SendFailed {
                sequence_id,
                retries: 0,
                reason: reason.clone(),
            };
            state.tracker.fail_all(&make_err);
            for entry in state.take_batch() {
                self.client.metrics.record_send_error();
                let err = make_err(entry.sequence_id);
                entry.complete(Err(err));
            }
        }

        drop(state);
        self.drained.notify_waiters();
    }

    /// Count a failed reconnect against messages that never reached a broker.
    /// Entries over `max_retries` fail for good.
    fn retry_unsent_locked(&self, state: &mut ProducerState, reason: &str) -> usize {
        let max_retries = self.config.max_retries;
        let mut failed = 0;
        for mut entry in state.take_batch() {
            entry.retries += 1;
            if entry.retries > max_retries {
                self.client.metrics.record_send_error();
                let sequence_id = entry.sequence_id;
                entry.complete(Err(ClientError::SendFailed {
                    sequence_id,
                    retries: max_retries,
                    reason: reason.to_string(),
                }));
                failed += 1;
            } else {
                state.push_batch(entry);
            }
        }
        failed
    }
}

/// Resolves when the broker acknowledges the message or it fails for good
#[derive(Debug)]
pub struct SendFuture {
    sequence_id: SequenceId,
    receiver: oneshot::Receiver<SendResult>,
}

impl SendFuture {
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }
}

impl Future for SendFuture {
    type Output = Result<MessageId, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::ProducerClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Builder for Producer
pub struct ProducerBuilder<'a> {
    client: &'a Client,
    topic: String,
    config: ProducerConfigBuilder,
}

impl<'a> ProducerBuilder<'a> {
    pub(crate) fn new(client: &'a Client, topic: String) -> Self {
        Self {
            client,
            topic,
            config: ProducerConfigBuilder::new(),
        }
    }

    pub fn producer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config = self.config.producer_name(name);
        self
    }

    pub fn batching_enabled(mut self, enabled: bool) -> Self {
        self.config = self.config.batching_enabled(enabled);
        self
    }

    pub fn batching_max_messages(mut self, max: usize) -> Self {
        self.config = self.config.batching_max_messages(max);
        self
    }

    pub fn batching_max_delay(mut self, delay: Duration) -> Self {
        self.config = self.config.batching_max_delay(delay);
        self
    }

    pub fn batching_max_bytes(mut self, max: usize) -> Self {
        self.config = self.config.batching_max_bytes(max);
        self
    }

    /// Set the send timeout; zero disables it
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.send_timeout(timeout);
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.config = self.config.max_pending_messages(max);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config = self.config.max_retries(retries);
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.close_timeout(timeout);
        self
    }

    /// Build the producer
    pub async fn create(self) -> Result<Producer, ClientError> {
        self.client
            .create_producer(&self.topic, self.config.build())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::mock_broker::{AckMode, MockBroker, MockBrokerConfig};

    async fn client_for(broker: &MockBroker) -> Client {
        Client::new(ClientConfig {
            service_url: broker.service_url(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_batch_flushes_at_size() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client
            .producer("batched")
            .batching_max_messages(4)
            .batching_max_delay(Duration::from_secs(60))
            .create()
            .await
            .unwrap();

        let mut pending = Vec::new();
        for i in 0..8 {
            pending.push(producer.send(format!("m{i}")).unwrap());
        }
        for (i, future) in pending.into_iter().enumerate() {
            let id = future.await.unwrap();
            assert_eq!(id.sequence_id, i as u64);
            assert_eq!(id.batch_index, (i % 4) as u32);
        }

        assert_eq!(broker.send_frame_count(), 2);
        assert_eq!(client.metrics().batches_flushed, 2);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_flushes_at_byte_budget() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client
            .producer("budgeted")
            .batching_max_bytes(200)
            .batching_max_delay(Duration::from_secs(60))
            .create()
            .await
            .unwrap();

        // 58 encoded bytes each, so three fit under the budget
        let message = || Message::new(vec![b'x'; 40]);
        assert_eq!(message().encoded_len(), 58);

        let pending: Vec<_> = (0..9).map(|_| producer.send(message()).unwrap()).collect();
        assert_eq!(producer.pending_count(), 9);
        producer.flush().await.unwrap();

        for future in pending {
            future.await.unwrap();
        }
        assert_eq!(broker.send_frame_count(), 3);
        assert_eq!(broker.received().len(), 9);
    }

    #[tokio::test]
    async fn test_unencodable_key_rejected_at_send() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client.producer("keys").create().await.unwrap();

        let err = producer
            .send(Message::from("payload").with_key("k".repeat(40_000)))
            .unwrap_err();
        assert!(
            matches!(err, ClientError::MessageTooLarge { size: 40_000, .. }),
            "{err:?}"
        );
        assert_eq!(producer.last_sequence_id(), None);

        let id = producer
            .send_sync(Message::from("payload").with_key("short"))
            .await
            .unwrap();
        assert_eq!(id.sequence_id, 0);
        assert_eq!(broker.received().len(), 1);
        assert!(producer.is_connected());
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_after_delay() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client
            .producer("delayed")
            .batching_max_delay(Duration::from_millis(20))
            .create()
            .await
            .unwrap();

        let id = producer.send("lonely").unwrap().await.unwrap();
        assert_eq!(id.sequence_id, 0);
        assert_eq!(broker.received_payloads(), vec!["lonely".to_string()]);
    }

    #[tokio::test]
    async fn test_batching_disabled_sends_each_message() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client
            .producer("unbatched")
            .batching_enabled(false)
            .create()
            .await
            .unwrap();

        for i in 0..3 {
            producer.send_sync(format!("m{i}")).await.unwrap();
        }
        assert_eq!(broker.send_frame_count(), 3);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let broker = MockBroker::start(MockBrokerConfig {
            ack_mode: AckMode::Never,
            ..Default::default()
        })
        .await;
        let client = client_for(&broker).await;
        let producer = client
            .producer("full")
            .max_pending_messages(2)
            .send_timeout(Duration::ZERO)
            .create()
            .await
            .unwrap();

        let _first = producer.send("a").unwrap();
        let _second = producer.send("b").unwrap();
        let err = producer.send("c").unwrap_err();
        assert!(matches!(err, ClientError::ProducerQueueFull { max_pending: 2 }));
        assert_eq!(producer.pending_count(), 2);
        assert_eq!(producer.last_sequence_id(), Some(1));
    }

    #[tokio::test]
    async fn test_flush_waits_for_receipts() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client
            .producer("flushed")
            .batching_max_delay(Duration::from_secs(60))
            .create()
            .await
            .unwrap();

        let pending: Vec<_> = (0..5).map(|i| producer.send(format!("{i}")).unwrap()).collect();
        producer.flush().await.unwrap();
        assert_eq!(producer.pending_count(), 0);

        for future in pending {
            assert!(future.await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_flush_with_nothing_sent() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client.producer("idle").create().await.unwrap();
        producer.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_rejection_fails_message() {
        let broker = MockBroker::start(MockBrokerConfig {
            ack_mode: AckMode::Reject(ServerError::MessageTooLarge),
            ..Default::default()
        })
        .await;
        let client = client_for(&broker).await;
        let producer = client.producer("rejected").create().await.unwrap();

        let err = producer.send_sync("payload").await.unwrap_err();
        assert!(
            matches!(
                err,
                ClientError::Server {
                    code: ServerError::MessageTooLarge,
                    ..
                }
            ),
            "{err:?}"
        );
        assert_eq!(client.metrics().send_errors, 1);
    }

    #[tokio::test]
    async fn test_producer_name_assigned_by_broker() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;

        let named = client
            .producer("names")
            .producer_name("billing")
            .create()
            .await
            .unwrap();
        assert_eq!(named.producer_name().as_deref(), Some("billing"));

        let anonymous = client.producer("names").create().await.unwrap();
        assert_eq!(
            anonymous.producer_name(),
            Some(format!("mock-{}", anonymous.id()))
        );
        assert!(anonymous.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_close_rejected() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let client = client_for(&broker).await;
        let producer = client.producer("closing").create().await.unwrap();

        producer.close().await.unwrap();
        producer.close().await.unwrap();

        assert_eq!(producer.status(), ProducerStatus::Closed);
        assert!(matches!(
            producer.send("late"),
            Err(ClientError::ProducerClosed)
        ));
        assert!(matches!(
            producer.flush().await,
            Err(ClientError::ProducerClosed)
        ));
        assert_eq!(client.producer_count(), 0);
    }
}
