//! Eviction notification subscriptions.
//!
//! A subscription is a single-use request: it is armed on the item covering a
//! `(stream, offset)` and completes exactly once, with
//! [`EvictionOutcome::Evicted`] when the item leaves the cache, with
//! [`EvictionOutcome::NotFound`] when nothing was cached at registration, or
//! with [`EvictionOutcome::Cancelled`] when it was cancelled first.

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use super::buffer::StreamId;
use super::item::ItemRef;
use super::read_cache::CacheError;

/// How a subscription completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    Evicted,
    NotFound,
    Cancelled,
}

/// Synchronous answer to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Linked into the covering item; completes when that item is removed.
    Armed,
    /// Nothing covered the offset; already completed with `NotFound`.
    NotFound,
}

/// The cache-side half of an armed subscription, held in the item's list.
#[derive(Debug)]
pub(crate) struct PendingEviction {
    pub(crate) id: u64,
    sender: oneshot::Sender<EvictionOutcome>,
}

impl PendingEviction {
    /// The caller dropped its handle without cancelling.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn fire(self, outcome: EvictionOutcome) {
        // The caller may have dropped its handle; nobody is left to tell.
        let _ = self.sender.send(outcome);
    }
}

/// Caller-side handle returned by
/// [`ReadCache::allocate_register_for_eviction`](super::ReadCache::allocate_register_for_eviction).
#[derive(Debug)]
pub struct EvictionSubscription {
    id: u64,
    key: Option<(StreamId, u64)>,
    target: Option<ItemRef>,
    receiver: Option<oneshot::Receiver<EvictionOutcome>>,
    outcome: Option<EvictionOutcome>,
}

impl EvictionSubscription {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            key: None,
            target: None,
            receiver: None,
            outcome: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The `(stream, offset)` this subscription was registered for.
    pub fn key(&self) -> Option<(StreamId, u64)> {
        self.key
    }

    pub fn is_registered(&self) -> bool {
        self.receiver.is_some() || self.outcome.is_some()
    }

    /// The outcome, if the subscription has completed.
    pub fn try_outcome(&mut self) -> Option<EvictionOutcome> {
        if self.outcome.is_none() {
            let receiver = self.receiver.as_mut()?;
            let outcome = match receiver.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => EvictionOutcome::Cancelled,
            };
            self.complete(outcome);
        }
        self.outcome
    }

    /// Wait for the subscription to complete.
    pub async fn completed(&mut self) -> Result<EvictionOutcome, CacheError> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        let receiver = self
            .receiver
            .as_mut()
            .ok_or(CacheError::InvalidState("subscription was never registered"))?;
        let outcome = receiver.await.unwrap_or(EvictionOutcome::Cancelled);
        self.complete(outcome);
        Ok(outcome)
    }

    pub(crate) fn arm(&mut self, stream: StreamId, offset: u64) -> Result<PendingEviction, CacheError> {
        if self.is_registered() {
            return Err(CacheError::InvalidState("subscription already registered"));
        }
        let (sender, receiver) = oneshot::channel();
        self.key = Some((stream, offset));
        self.receiver = Some(receiver);
        Ok(PendingEviction {
            id: self.id,
            sender,
        })
    }

    pub(crate) fn target(&self) -> Option<ItemRef> {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: ItemRef) {
        self.target = Some(target);
    }

    pub(crate) fn complete(&mut self, outcome: EvictionOutcome) {
        self.outcome = Some(outcome);
        self.receiver = None;
    }
}
