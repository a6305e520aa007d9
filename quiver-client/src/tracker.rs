//! In-flight message tracking
//!
//! Holds every flushed-but-unacknowledged message in sequence order and
//! completes them as cumulative receipts arrive.

use crate::error::{ClientError, ServerError};
use crate::metrics::ClientMetrics;
use crate::protocol::{Message, MessageId, SequenceId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type SendResult = Result<MessageId, ClientError>;

/// A message awaiting its acknowledgment
#[derive(Debug)]
pub struct PendingSend {
    pub sequence_id: SequenceId,
    pub message: Message,
    pub created_at: Instant,
    /// Last time the message was written to a connection
    pub sent_at: Option<Instant>,
    pub retries: u32,
    completion: oneshot::Sender<SendResult>,
}

impl PendingSend {
    pub fn new(sequence_id: SequenceId, message: Message) -> (Self, oneshot::Receiver<SendResult>) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            sequence_id,
            message,
            created_at: Instant::now(),
            sent_at: None,
            retries: 0,
            completion: tx,
        };
        (pending, rx)
    }

    /// Fulfil the completion slot. Consumes the entry, so it can only happen once.
    pub fn complete(self, result: SendResult) {
        if self.completion.send(result).is_err() {
            debug!(
                "Completion for sequence {} dropped by caller",
                self.sequence_id
            );
        }
    }
}

/// How the broker answered a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Persisted { ledger_id: u64, entry_id: u64 },
    Rejected { code: ServerError, message: String },
}

/// Result of `mark_for_retry`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPlan {
    /// Entries kept for resend with their original sequence ids
    pub retained: usize,
    /// Entries failed permanently after exhausting their retries
    pub failed: usize,
}

/// Ordered queue of in-flight messages for one producer
#[derive(Debug)]
pub struct PendingTracker {
    entries: VecDeque<PendingSend>,
    last_registered: Option<SequenceId>,
    metrics: Arc<ClientMetrics>,
}

impl PendingTracker {
    pub fn new(metrics: Arc<ClientMetrics>) -> Self {
        Self {
            entries: VecDeque::new(),
            last_registered: None,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn front_sequence_id(&self) -> Option<SequenceId> {
        self.entries.front().map(|e| e.sequence_id)
    }

    pub fn back_sequence_id(&self) -> Option<SequenceId> {
        self.entries.back().map(|e| e.sequence_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingSend> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingSend> {
        self.entries.iter_mut()
    }

    /// Track a flushed message. Sequence ids must strictly increase.
    pub fn register(&mut self, entry: PendingSend) -> Result<(), ClientError> {
        if let Some(last) = self.last_registered {
            if entry.sequence_id <= last {
                let sequence_id = entry.sequence_id;
                entry.complete(Err(ClientError::protocol(format!(
                    "sequence {} registered after {}",
                    sequence_id, last
                ))));
                return Err(ClientError::protocol(format!(
                    "sequence {} registered out of order (last {})",
                    sequence_id, last
                )));
            }
        }
        self.last_registered = Some(entry.sequence_id);
        self.entries.push_back(entry);
        Ok(())
    }

    /// Complete every entry up to and including `sequence_id`.
    ///
    /// Receipts for ids already completed are ignored; receipts for ids never
    /// registered are a protocol violation.
    pub fn resolve(
        &mut self,
        sequence_id: SequenceId,
        outcome: SendOutcome,
    ) -> Result<usize, ClientError> {
        match self.last_registered {
            Some(last) if sequence_id <= last => {}
            _ => {
                return Err(ClientError::protocol(format!(
                    "receipt for unsent sequence {} (last sent {:?})",
                    sequence_id, self.last_registered
                )))
            }
        }

        match self.front_sequence_id() {
            Some(front) if sequence_id >= front => {}
            _ => {
                debug!("Ignoring duplicate receipt for sequence {}", sequence_id);
                return Ok(0);
            }
        }

        let mut resolved = 0usize;
        while self
            .entries
            .front()
            .is_some_and(|e| e.sequence_id <= sequence_id)
        {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            let result = match &outcome {
                SendOutcome::Persisted {
                    ledger_id,
                    entry_id,
                } => {
                    self.metrics.record_ack(entry.created_at.elapsed());
                    Ok(MessageId {
                        sequence_id: entry.sequence_id,
                        ledger_id: *ledger_id,
                        entry_id: *entry_id,
                        batch_index: resolved as u32,
                    })
                }
                SendOutcome::Rejected { code, message } => {
                    self.metrics.record_send_error();
                    Err(code.to_client_error(&format!("sequence {}", entry.sequence_id), message))
                }
            };
            entry.complete(result);
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Count a retry against every in-flight entry after a connection loss.
    /// Entries over `max_retries` fail permanently; the rest stay queued for
    /// resend with identical sequence ids.
    pub fn mark_for_retry(&mut self, max_retries: u32, reason: &str) -> RetryPlan {
        let mut plan = RetryPlan::default();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for mut entry in self.entries.drain(..) {
            entry.retries += 1;
            entry.sent_at = None;
            if entry.retries > max_retries {
                warn!(
                    "Sequence {} exhausted {} retries: {}",
                    entry.sequence_id, max_retries, reason
                );
                self.metrics.record_send_error();
                let err = ClientError::SendFailed {
                    sequence_id: entry.sequence_id,
                    retries: max_retries,
                    reason: reason.to_string(),
                };
                entry.complete(Err(err));
                plan.failed += 1;
            } else {
                kept.push_back(entry);
                plan.retained += 1;
            }
        }

        self.entries = kept;
        plan
    }

    /// Fail entries at the head that were created at or before `cutoff`
    pub fn expire(&mut self, cutoff: Instant, timeout_ms: u64) -> usize {
        let mut expired = 0;
        while self.entries.front().is_some_and(|e| e.created_at <= cutoff) {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            self.metrics.record_send_error();
            entry.complete(Err(ClientError::timeout(timeout_ms)));
            expired += 1;
        }
        expired
    }

    /// Fail the entries with ids in `first..=last`, leaving the rest queued
    pub fn fail_range<F>(&mut self, first: SequenceId, last: SequenceId, make_err: F) -> usize
    where
        F: Fn(SequenceId) -> ClientError,
    {
        let mut failed = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if (first..=last).contains(&entry.sequence_id) {
                self.metrics.record_send_error();
                let err = make_err(entry.sequence_id);
                entry.complete(Err(err));
                failed += 1;
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        failed
    }

    /// Fail every entry; `make_err` builds the error for each sequence id
    pub fn fail_all<F>(&mut self, make_err: F) -> usize
    where
        F: Fn(SequenceId) -> ClientError,
    {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            self.metrics.record_send_error();
            let err = make_err(entry.sequence_id);
            entry.complete(Err(err));
        }
        count
    }
}
