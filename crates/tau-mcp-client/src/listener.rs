//! Background reader that drains a transport's inbound frames.
//!
//! Responses are handed to the [`RequestCorrelator`]; server notifications and
//! server-initiated requests are broadcast to subscribers; anything that does
//! not decode as an envelope is dropped. When the stream dies underneath a
//! running listener every in-flight call is failed with a transport error.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};

use crate::{
    correlator::{RequestCorrelator, ResolveOutcome},
    envelope::Envelope,
    error::McpClientError,
    transport::{InboundFrame, InboundFrames},
};

#[derive(Debug, Clone, PartialEq)]
/// Why the listener loop returned.
pub enum ListenerExit {
    Stopped,
    StreamEnded,
    StreamFailed(McpClientError),
}

#[derive(Debug, Default)]
struct ListenerCounters {
    delivered: AtomicU64,
    unmatched: AtomicU64,
    broadcast: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub delivered: u64,
    pub unmatched: u64,
    pub broadcast: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct InboundListener {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<ListenerExit>>,
    counters: Arc<ListenerCounters>,
}

impl InboundListener {
    pub fn spawn(
        frames: InboundFrames,
        correlator: Arc<RequestCorrelator>,
        notifications: broadcast::Sender<Envelope>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let counters = Arc::new(ListenerCounters::default());
        let task = tokio::spawn(run_listener_loop(
            frames,
            correlator,
            notifications,
            counters.clone(),
            shutdown_rx,
        ));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            counters,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            broadcast: self.counters.broadcast.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Signals the loop to stop and waits up to `grace` for it to return,
    /// aborting the task afterwards. Calling it again returns `None`.
    pub async fn stop(&mut self, grace: Duration) -> Option<ListenerExit> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        let mut task = self.task.take()?;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(error)) => {
                tracing::warn!(%error, "inbound listener task failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "inbound listener did not stop in time; aborting"
                );
                task.abort();
                None
            }
        }
    }
}

impl Drop for InboundListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_listener_loop(
    mut frames: InboundFrames,
    correlator: Arc<RequestCorrelator>,
    notifications: broadcast::Sender<Envelope>,
    counters: Arc<ListenerCounters>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> ListenerExit {
    let exit = loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break ListenerExit::Stopped,
            next = frames.next() => match next {
                Some(Ok(frame)) => dispatch_frame(frame, &correlator, &notifications, &counters),
                Some(Err(error)) => break ListenerExit::StreamFailed(error),
                None => break ListenerExit::StreamEnded,
            },
        }
    };

    match &exit {
        ListenerExit::Stopped => tracing::debug!("inbound listener stopped"),
        ListenerExit::StreamEnded => {
            let failed = correlator.fail_all(McpClientError::transport("inbound stream closed"));
            tracing::warn!(failed, "inbound stream closed by peer");
        }
        ListenerExit::StreamFailed(error) => {
            let failed = correlator.fail_all(error.clone());
            tracing::warn!(failed, %error, "inbound stream failed");
        }
    }
    exit
}

fn dispatch_frame(
    frame: InboundFrame,
    correlator: &RequestCorrelator,
    notifications: &broadcast::Sender<Envelope>,
    counters: &ListenerCounters,
) {
    let envelope = match Envelope::decode(&frame.payload) {
        Ok(envelope) => envelope,
        Err(error) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                event = frame.event.as_deref().unwrap_or("message"),
                %error,
                "dropping non-envelope inbound frame"
            );
            return;
        }
    };
    match envelope {
        Envelope::Response(response) => match correlator.resolve(response) {
            ResolveOutcome::Delivered => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            ResolveOutcome::Unmatched => {
                counters.unmatched.fetch_add(1, Ordering::Relaxed);
            }
        },
        other => {
            tracing::debug!(
                kind = other.kind(),
                method = other.method().unwrap_or_default(),
                "server-initiated message"
            );
            counters.broadcast.fetch_add(1, Ordering::Relaxed);
            // No subscribers is fine.
            let _ = notifications.send(other);
        }
    }
}
