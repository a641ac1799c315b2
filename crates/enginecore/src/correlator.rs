//! Utility call correlation.
//!
//! Each in-flight utility call owns one slot keyed by its call id. The output
//! pump resolves slots as results arrive; `close` fails every remaining slot
//! (and every later registration) when the engine dies or the client shuts
//! down.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::bridge::protocol::{UtilityOutput, UtilityValue};
use crate::error::ClientError;

type CallResult = Result<UtilityValue, ClientError>;

/// Why the correlator stopped accepting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    EngineDead,
    ShutDown,
}

impl CloseReason {
    pub fn to_error(self) -> ClientError {
        match self {
            Self::EngineDead => ClientError::EngineDead,
            Self::ShutDown => ClientError::ShutDown,
        }
    }
}

struct Slot {
    method: &'static str,
    tx: oneshot::Sender<CallResult>,
}

#[derive(Default)]
pub struct UtilityCorrelator {
    pending: DashMap<u64, Slot>,
    closed: OnceLock<CloseReason>,
}

impl UtilityCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a fresh call id and its result slot.
    pub fn register(self: &Arc<Self>, method: &'static str) -> Result<PendingCall, ClientError> {
        if let Some(reason) = self.closed.get() {
            return Err(reason.to_error());
        }

        let (tx, rx) = oneshot::channel();
        let call_id = loop {
            let id = (uuid::Uuid::new_v4().as_u128() >> 64) as u64;
            match self.pending.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(Slot { method, tx });
                    break id;
                }
            }
        };

        // A close racing with the insert above may have missed this slot.
        if let Some(reason) = self.closed.get() {
            self.pending.remove(&call_id);
            return Err(reason.to_error());
        }

        tracing::trace!(call_id, method, "Registered utility call");
        Ok(PendingCall {
            call_id,
            rx: Some(rx),
            correlator: Arc::clone(self),
        })
    }

    /// Deliver a worker result to its caller. Returns false for unknown ids.
    pub fn resolve(&self, output: UtilityOutput) -> bool {
        let Some((_, slot)) = self.pending.remove(&output.call_id) else {
            tracing::warn!(
                call_id = output.call_id,
                "Utility result for unknown call id, ignoring"
            );
            return false;
        };

        let result = match output.failure_message {
            Some(message) => Err(ClientError::Utility {
                method: slot.method,
                message,
            }),
            None => Ok(output.result),
        };
        // Caller may have given up (dropped future); nothing to do then.
        let _ = slot.tx.send(result);
        true
    }

    /// Fail one caller without closing the correlator. Returns false for
    /// unknown ids.
    pub fn fail(&self, call_id: u64, error: ClientError) -> bool {
        let Some((_, slot)) = self.pending.remove(&call_id) else {
            return false;
        };
        tracing::debug!(call_id, method = slot.method, error = %error, "Failing utility call");
        let _ = slot.tx.send(Err(error));
        true
    }

    /// Fail every pending call and refuse new ones. The first reason sticks.
    pub fn close(&self, reason: CloseReason) {
        let reason = *self.closed.get_or_init(|| reason);
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), ?reason, "Failing pending utility calls");
        }
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.tx.send(Err(reason.to_error()));
            }
        }
    }

    /// Drop a slot without resolving it (send failure, cancelled caller).
    pub fn forget(&self, call_id: u64) {
        self.pending.remove(&call_id);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.get().copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Handle to one in-flight utility call. Dropping it releases the slot.
pub struct PendingCall {
    call_id: u64,
    rx: Option<oneshot::Receiver<CallResult>>,
    correlator: Arc<UtilityCorrelator>,
}

impl PendingCall {
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait_blocking(mut self) -> CallResult {
        let rx = self.rx.take().ok_or_else(|| self.abandoned())?;
        rx.blocking_recv().map_err(|_| self.abandoned())?
    }

    pub async fn wait(mut self) -> CallResult {
        let rx = self.rx.take().ok_or_else(|| self.abandoned())?;
        rx.await.map_err(|_| self.abandoned())?
    }

    fn abandoned(&self) -> ClientError {
        self.correlator
            .close_reason()
            .map(CloseReason::to_error)
            .unwrap_or(ClientError::ShutDown)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.forget(self.call_id);
    }
}
