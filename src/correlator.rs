//! Request correlator between the wireless conversation and the card.
//!
//! Every reassembled request is tagged with a monotonic id and queued until
//! the card has answered it. The card side drains the queue head-first;
//! responses are relayed tagged with the id of the request they answer.
//!
//! A transport failure puts the operation back at the head of the queue and
//! halts draining until the next kick, so requests always reach the card in
//! arrival order. Ending the conversation clears the queue and raises a
//! cutoff: requests minted before the clear are refused if they turn up
//! later, a multi-APDU exchange stops at the next APDU, and any response
//! produced for a cleared request is discarded by the liveness check in
//! [`RequestCorrelator::relay`].

use crate::card::{CardError, CardTransport};
use crate::error::RelayError;
use crate::sequence::ApduEnvelope;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A request waiting for (or holding) its card response.
#[derive(Debug)]
pub struct PendingCardOperation {
    id: u64,
    request: ApduEnvelope,
    response: Option<ApduEnvelope>,
}

impl PendingCardOperation {
    /// Create an operation with no response yet.
    pub fn new(id: u64, request: ApduEnvelope) -> Self {
        Self {
            id,
            request,
            response: None,
        }
    }

    /// Correlation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Command APDUs to send to the card.
    pub fn request(&self) -> &ApduEnvelope {
        &self.request
    }

    /// Card response, once received.
    pub fn response(&self) -> Option<&ApduEnvelope> {
        self.response.as_ref()
    }
}

/// A card response tagged with the id of its request.
#[derive(Debug, PartialEq, Eq)]
pub struct CardResponse {
    pub id: u64,
    pub response: ApduEnvelope,
}

/// Monotonic id source, shared by whoever mints request ids.
#[derive(Debug, Clone)]
pub struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    /// Allocator whose first id is 1.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    /// Next id. Never repeats within the allocator's lifetime.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`next_id`](Self::next_id) returns.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The card side of the relay: an optional attached transport plus
/// the reconnect flag set after a failure.
#[derive(Default)]
pub struct CardLink {
    transport: Option<Box<dyn CardTransport>>,
    needs_reconnect: bool,
}

impl CardLink {
    /// Link with no card attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a card. The link is opened lazily by the next drain.
    pub fn attach(&mut self, transport: Box<dyn CardTransport>) {
        self.transport = Some(transport);
        self.needs_reconnect = false;
    }

    /// Detach the current card, if any.
    pub fn detach(&mut self) -> Option<Box<dyn CardTransport>> {
        self.needs_reconnect = false;
        self.transport.take()
    }

    /// True if a card is attached.
    pub fn is_reachable(&self) -> bool {
        self.transport.is_some()
    }

    /// True if the last exchange failed and the link must be reopened.
    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect
    }

    fn ensure_open(&mut self) -> Result<&mut Box<dyn CardTransport>, CardError> {
        let transport = self.transport.as_mut().ok_or(CardError::NotPresent)?;
        if self.needs_reconnect || !transport.is_connected() {
            debug!("Opening card link");
            transport.connect()?;
            self.needs_reconnect = false;
        }
        Ok(transport)
    }

    /// Send every APDU of `request`, checking `live` before each one.
    ///
    /// Returns `Ok(None)` if the request was abandoned part way.
    fn transceive_all(
        &mut self,
        request: &ApduEnvelope,
        live: impl Fn() -> bool,
    ) -> Result<Option<ApduEnvelope>, CardError> {
        let transport = self.ensure_open()?;
        let mut response = ApduEnvelope::new();
        for command in request.iter() {
            if !live() {
                return Ok(None);
            }
            debug!("Card <- {}", hex::encode_upper(command));
            let reply = transport.transceive(command)?;
            debug!("Card -> {}", hex::encode_upper(&reply));
            response.push(reply);
        }
        Ok(Some(response))
    }
}

impl std::fmt::Debug for CardLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardLink")
            .field("attached", &self.transport.is_some())
            .field("needs_reconnect", &self.needs_reconnect)
            .finish()
    }
}

/// How a drain pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue is empty.
    Drained { relayed: usize },
    /// Work is pending but no card is attached.
    NoCard { pending: usize },
    /// The card failed; the failed operation is back at the head.
    Halted { relayed: usize, error: CardError },
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<PendingCardOperation>,
    in_flight: Option<u64>,
    /// Ids below this belong to a finished conversation.
    cutoff: u64,
}

/// FIFO of pending card operations shared by the wireless producer and
/// the card consumer.
#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    state: Arc<Mutex<QueueState>>,
    ids: IdAllocator,
    responses: Sender<CardResponse>,
}

impl RequestCorrelator {
    /// Create a correlator relaying responses into `responses`.
    pub fn new(responses: Sender<CardResponse>) -> Self {
        Self::with_ids(IdAllocator::new(), responses)
    }

    /// Create a correlator sharing an existing id source.
    pub fn with_ids(ids: IdAllocator, responses: Sender<CardResponse>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            ids,
            responses,
        }
    }

    /// Id source used by [`submit`](Self::submit).
    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Queue state stays consistent across a panic in another holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate the next id for `request` and queue it at the tail.
    pub fn submit(&self, request: ApduEnvelope) -> u64 {
        let id = self.ids.next_id();
        self.enqueue(id, request);
        id
    }

    /// Queue a request that already carries an id.
    ///
    /// Returns false, dropping the request, if its conversation has
    /// already been cleared.
    pub fn enqueue(&self, id: u64, request: ApduEnvelope) -> bool {
        let mut state = self.lock();
        if id < state.cutoff {
            debug!("Dropping request {} from a finished conversation", id);
            return false;
        }
        state.queue.push_back(PendingCardOperation::new(id, request));
        debug!("Queued request {} ({} pending)", id, state.queue.len());
        true
    }

    /// Drop every pending operation, including the one in flight, and
    /// refuse any request minted before this call.
    ///
    /// Returns the number of queued operations discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        state.cutoff = state.cutoff.max(self.ids.peek());
        let dropped = state.queue.len();
        state.queue.clear();
        if let Some(id) = state.in_flight.take() {
            debug!("Abandoning in-flight request {}", id);
        }
        if dropped > 0 {
            info!("Conversation finished, dropped {} pending requests", dropped);
        }
        dropped
    }

    /// Number of queued operations (not counting one in flight).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Ids currently queued, head first.
    pub fn pending_ids(&self) -> Vec<u64> {
        self.lock().queue.iter().map(|op| op.id).collect()
    }

    /// True if `id` is queued or in flight.
    pub fn is_live(&self, id: u64) -> bool {
        let state = self.lock();
        state.in_flight == Some(id) || state.queue.iter().any(|op| op.id == id)
    }

    /// Relay a card response for `id`.
    ///
    /// Fails with [`RelayError::StaleResponse`] if `id` is neither queued
    /// nor in flight; the response is then discarded.
    pub fn relay(&self, id: u64, response: ApduEnvelope) -> Result<(), RelayError> {
        {
            let mut state = self.lock();
            if state.in_flight == Some(id) {
                state.in_flight = None;
            } else if let Some(pos) = state.queue.iter().position(|op| op.id == id) {
                state.queue.remove(pos);
            } else {
                warn!("Discarding response for request {}: no longer pending", id);
                return Err(RelayError::StaleResponse { id });
            }
        }

        info!("Relaying response for request {} ({} APDUs)", id, response.len());
        self.responses
            .send(CardResponse { id, response })
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Send queued requests to the card until the queue is empty, no card
    /// is attached, or the card fails.
    pub fn drain(&self, card: &mut CardLink) -> Result<DrainOutcome, RelayError> {
        let mut relayed = 0;
        loop {
            if !card.is_reachable() {
                let pending = self.len();
                if pending > 0 {
                    debug!("{} requests waiting for a card", pending);
                }
                return Ok(DrainOutcome::NoCard { pending });
            }

            let Some(mut op) = self.pop_head() else {
                return Ok(DrainOutcome::Drained { relayed });
            };

            let id = op.id;
            match card.transceive_all(&op.request, || self.is_live(id)) {
                Ok(None) => debug!("Request {} abandoned mid-exchange", id),
                Ok(Some(response)) => {
                    op.response = Some(response);
                    match self.relay_operation(op) {
                        Ok(()) => relayed += 1,
                        Err(RelayError::StaleResponse { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(error) => {
                    warn!("Card exchange for request {} failed: {}", op.id, error);
                    card.needs_reconnect = true;
                    self.requeue_head(op);
                    return Ok(DrainOutcome::Halted { relayed, error });
                }
            }
        }
    }

    fn pop_head(&self) -> Option<PendingCardOperation> {
        let mut state = self.lock();
        let op = state.queue.pop_front()?;
        state.in_flight = Some(op.id);
        Some(op)
    }

    fn requeue_head(&self, op: PendingCardOperation) {
        let mut state = self.lock();
        if state.in_flight == Some(op.id) {
            state.in_flight = None;
            debug!("Requeued request {} at head", op.id);
            state.queue.push_front(op);
        } else {
            debug!("Request {} was cleared while in flight, not requeued", op.id);
        }
    }

    fn relay_operation(&self, mut op: PendingCardOperation) -> Result<(), RelayError> {
        let response = op.response.take().unwrap_or_default();
        self.relay(op.id, response)
    }
}
