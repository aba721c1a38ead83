//! Request/response correlation across asynchronous inbound channels.
//!
//! Callers register a waiter for a request id before the request is sent; the
//! inbound listener resolves waiters as responses arrive. Each pending call
//! owns a oneshot sender that is used exactly once, and the entry is removed
//! from the table in the same critical section that claims it, so a response,
//! a timeout and a shutdown can never observe a half-removed call.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use crate::{
    envelope::{JsonRpcResponse, RequestId},
    error::McpClientError,
};

type CallOutcome = Result<JsonRpcResponse, McpClientError>;

#[derive(Debug)]
struct PendingCall {
    created_at: Instant,
    result_slot: oneshot::Sender<CallOutcome>,
}

#[derive(Debug, Default)]
struct PendingTable {
    calls: HashMap<RequestId, PendingCall>,
    terminal: Option<McpClientError>,
}

#[derive(Debug)]
/// Receiving half of a registered call, consumed by [`RequestCorrelator::await_response`].
pub struct ResponseWaiter {
    id: RequestId,
    created_at: Instant,
    receiver: oneshot::Receiver<CallOutcome>,
}

impl ResponseWaiter {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Delivered,
    Unmatched,
}

#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: AtomicI64,
    table: Mutex<PendingTable>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: i64) -> Self {
        Self {
            next_id: AtomicI64::new(first_id),
            table: Mutex::new(PendingTable::default()),
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns an id never issued before by this correlator, nor registered
    /// by a caller that picked its own numeric id.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, id: RequestId) -> Result<ResponseWaiter, McpClientError> {
        let mut table = self.lock_table();
        if let Some(error) = table.terminal.as_ref() {
            return Err(error.clone());
        }
        if table.calls.contains_key(&id) {
            return Err(McpClientError::DuplicateId(id));
        }
        if let RequestId::Number(value) = &id {
            self.next_id
                .fetch_max(value.saturating_add(1), Ordering::Relaxed);
        }
        let (result_slot, receiver) = oneshot::channel();
        let created_at = Instant::now();
        table.calls.insert(
            id.clone(),
            PendingCall {
                created_at,
                result_slot,
            },
        );
        Ok(ResponseWaiter {
            id,
            created_at,
            receiver,
        })
    }

    /// Delivers a response to its waiter. Responses for ids that are not in
    /// flight (never registered, timed out, or already answered) are dropped.
    pub fn resolve(&self, response: JsonRpcResponse) -> ResolveOutcome {
        let claimed = self.lock_table().calls.remove(&response.id);
        let Some(pending) = claimed else {
            tracing::warn!(id = %response.id, "dropping response for unknown request id");
            return ResolveOutcome::Unmatched;
        };
        let id = response.id.clone();
        tracing::debug!(
            id = %id,
            latency_ms = pending.created_at.elapsed().as_millis() as u64,
            is_error = response.is_error(),
            "resolved pending call"
        );
        if pending.result_slot.send(Ok(response)).is_err() {
            // The caller went away between claim and send; nothing is waiting.
            tracing::debug!(id = %id, "pending call receiver dropped before delivery");
        }
        ResolveOutcome::Delivered
    }

    /// Waits for the registered call to resolve, for at most `timeout` measured
    /// from registration. On expiry the call is deregistered, so a late
    /// response for it becomes an unmatched drop.
    pub async fn await_response(
        &self,
        waiter: ResponseWaiter,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpClientError> {
        let ResponseWaiter {
            id,
            created_at,
            mut receiver,
        } = waiter;
        let remaining = timeout.saturating_sub(created_at.elapsed());
        match tokio::time::timeout(remaining, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpClientError::ClientClosed),
            Err(_) => {
                let removed = self.lock_table().calls.remove(&id).is_some();
                if !removed {
                    // The entry was claimed concurrently; its outcome is in the slot.
                    if let Ok(outcome) = receiver.try_recv() {
                        return outcome;
                    }
                }
                tracing::debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "pending call timed out");
                Err(McpClientError::Timeout {
                    id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Withdraws a registration whose request never made it onto the wire.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.lock_table().calls.remove(id).is_some()
    }

    /// Resolves every in-flight call with `error` and rejects future
    /// registrations with it. Returns how many waiters were failed.
    pub fn fail_all(&self, error: McpClientError) -> usize {
        let drained = {
            let mut table = self.lock_table();
            if table.terminal.is_none() {
                table.terminal = Some(error.clone());
            }
            table.calls.drain().collect::<Vec<_>>()
        };
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.result_slot.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(
                failed = count,
                reason_code = error.reason_code(),
                "failed all pending calls"
            );
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock_table().calls.len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.lock_table().calls.contains_key(id)
    }

    pub fn terminal_error(&self) -> Option<McpClientError> {
        self.lock_table().terminal.clone()
    }
}
