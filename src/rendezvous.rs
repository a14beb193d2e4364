//! Matching of point to point operations
//!
//! The `Matcher` pairs posted sends with posted receives. Every operation is described by an
//! envelope: a send by an `Envelope` naming its source, destination, tag and group; a receive
//! by a `ReceiveEnvelope` that may leave source and tag open via `Selector::Any`.
//!
//! Posting an operation first looks for a partner in the opposite queue of the same group. The
//! earliest-posted eligible partner wins, which makes messages between the same source and
//! destination with the same tag non-overtaking. Without a partner the operation is queued and
//! a `Handle` is returned. The handle is later completed with `wait()`, `test()` or
//! `wait_timeout()`, which release the matcher's bookkeeping, or abandoned with `cancel()`
//! while it is still unmatched.
//!
//! On a match the send's payload moves to the receive's completion. A payload with more
//! elements than the receive's capacity completes the receive with `ErrorKind::Truncation`;
//! the send completes successfully either way.
//!
//! Blocking and non-blocking operations share the same queues: a blocking operation is a
//! post followed by `wait()`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::datatype::Payload;
use crate::error::{Error, ErrorKind, Result};
use crate::point_to_point::Status;
use crate::topology::{GroupId, Rank};
use crate::{Count, Tag};

/// Selects either a specific value or any value on the receive side of a match.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Selector<T> {
    /// Only this value matches
    Exact(T),
    /// Every value matches
    Any,
}

impl<T: Copy + PartialEq> Selector<T> {
    /// Whether `value` is selected
    pub fn matches(&self, value: T) -> bool {
        match *self {
            Selector::Exact(v) => v == value,
            Selector::Any => true,
        }
    }

    /// The selected value, if a specific one is selected
    pub fn exact(&self) -> Option<T> {
        match *self {
            Selector::Exact(v) => Some(v),
            Selector::Any => None,
        }
    }
}

impl<T> From<T> for Selector<T> {
    fn from(value: T) -> Self {
        Selector::Exact(value)
    }
}

/// The matching key of a send
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Rank of the sender
    pub source: Rank,
    /// Rank of the receiver
    pub destination: Rank,
    /// Message tag
    pub tag: Tag,
    /// Group both ranks refer to
    pub group: GroupId,
}

/// The matching key of a receive
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiveEnvelope {
    /// Rank of the sender, or any sender
    pub source: Selector<Rank>,
    /// Rank of the receiver
    pub destination: Rank,
    /// Message tag, or any tag
    pub tag: Selector<Tag>,
    /// Group both ranks refer to
    pub group: GroupId,
}

impl ReceiveEnvelope {
    /// Whether a send with `envelope` can be received by this receive.
    ///
    /// `Selector::Any` as tag matches every non-negative tag. Negative tags carry collective
    /// traffic and are only matched exactly.
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        let tag_matches = match self.tag {
            Selector::Exact(tag) => tag == envelope.tag,
            Selector::Any => envelope.tag >= 0,
        };
        self.group == envelope.group
            && self.destination == envelope.destination
            && self.source.matches(envelope.source)
            && tag_matches
    }
}

/// Identifies an operation posted to a `Matcher`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request #{}", self.0)
    }
}

/// The outcome of a completed operation
#[derive(Debug)]
pub struct Completion {
    /// Describes the matched partner and the transfer
    pub status: Status,
    /// The message, for completed receives
    pub payload: Option<Payload>,
}

/// Number of operations waiting for a partner in a group
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Unmatched sends
    pub sends: usize,
    /// Unmatched receives
    pub receives: usize,
}

struct PendingSend {
    handle: Handle,
    envelope: Envelope,
    payload: Payload,
}

struct PendingReceive {
    handle: Handle,
    envelope: ReceiveEnvelope,
    capacity: Count,
}

#[derive(Default)]
struct Queues {
    sends: VecDeque<PendingSend>,
    receives: VecDeque<PendingReceive>,
}

enum Operation {
    Pending { group: GroupId },
    Complete(Completion),
    Failed(Error),
}

#[derive(Default)]
struct State {
    queues: HashMap<GroupId, Queues>,
    operations: HashMap<Handle, Operation>,
    /// Freed groups. Group ids are never reused, so entries are kept for the lifetime of the
    /// matcher.
    released: HashSet<GroupId>,
    next_handle: u64,
}

impl State {
    fn allocate(&mut self, group: GroupId) -> Result<Handle> {
        if self.released.contains(&group) {
            return Err(Error::InvalidGroup(group));
        }
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.operations.insert(handle, Operation::Pending { group });
        Ok(handle)
    }

    fn complete(&mut self, send: PendingSend, receive: PendingReceive) {
        let sent = send.payload.count();
        let delivered = sent.min(receive.capacity);
        let error = if sent > receive.capacity {
            Some(ErrorKind::Truncation)
        } else {
            None
        };
        trace!(
            send = %send.handle,
            receive = %receive.handle,
            source = send.envelope.source,
            destination = send.envelope.destination,
            tag = send.envelope.tag,
            count = delivered,
            "matched"
        );

        let send_status = Status::matched(send.envelope.destination, send.envelope.tag, delivered, None);
        let receive_status = Status::matched(send.envelope.source, send.envelope.tag, delivered, error);
        self.operations.insert(
            send.handle,
            Operation::Complete(Completion {
                status: send_status,
                payload: None,
            }),
        );
        self.operations.insert(
            receive.handle,
            Operation::Complete(Completion {
                status: receive_status,
                payload: Some(send.payload),
            }),
        );
    }

    /// Removes and returns the outcome of a finished operation. Pending operations stay.
    fn take_finished(&mut self, handle: Handle) -> Result<Option<Completion>> {
        match self.operations.remove(&handle) {
            None => Err(Error::StaleHandle(handle)),
            Some(Operation::Complete(completion)) => Ok(Some(completion)),
            Some(Operation::Failed(error)) => Err(error),
            Some(pending @ Operation::Pending { .. }) => {
                self.operations.insert(handle, pending);
                Ok(None)
            }
        }
    }

    fn dequeue(&mut self, group: GroupId, handle: Handle) {
        if let Some(queues) = self.queues.get_mut(&group) {
            queues.sends.retain(|send| send.handle != handle);
            queues.receives.retain(|receive| receive.handle != handle);
        }
    }

    fn probe(&self, envelope: &ReceiveEnvelope) -> Result<Option<Status>> {
        if self.released.contains(&envelope.group) {
            return Err(Error::InvalidGroup(envelope.group));
        }
        Ok(self
            .queues
            .get(&envelope.group)
            .and_then(|queues| {
                queues
                    .sends
                    .iter()
                    .find(|send| envelope.accepts(&send.envelope))
            })
            .map(|send| {
                Status::matched(send.envelope.source, send.envelope.tag, send.payload.count(), None)
            }))
    }
}

/// Pairs sends with receives, see the module documentation.
///
/// All queues live behind one lock, so every match decision is taken atomically with the
/// queue mutation it causes. Threads blocked in `wait()` sleep on a condition variable that is
/// signalled whenever an operation completes or a send is queued.
pub struct Matcher {
    state: Mutex<State>,
    progress: Condvar,
}

impl Default for Matcher {
    fn default() -> Self {
        Matcher::new()
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Matcher")
            .field("groups", &state.queues.len())
            .field("operations", &state.operations.len())
            .finish()
    }
}

impl Matcher {
    /// Creates a matcher without any pending operations.
    pub fn new() -> Matcher {
        Matcher {
            state: Mutex::new(State::default()),
            progress: Condvar::new(),
        }
    }

    /// Posts a send of `payload` and matches it against the pending receives.
    pub fn post_send(&self, envelope: Envelope, payload: Payload) -> Result<Handle> {
        let mut state = self.state.lock();
        let handle = state.allocate(envelope.group)?;
        let send = PendingSend {
            handle,
            envelope,
            payload,
        };

        let queues = state.queues.entry(envelope.group).or_default();
        let position = queues
            .receives
            .iter()
            .position(|receive| receive.envelope.accepts(&envelope));
        match position.and_then(|position| queues.receives.remove(position)) {
            Some(receive) => state.complete(send, receive),
            None => {
                trace!(%handle, ?envelope, "send queued");
                queues.sends.push_back(send);
            }
        }
        self.progress.notify_all();
        Ok(handle)
    }

    /// Posts a receive of at most `capacity` elements and matches it against the pending sends.
    pub fn post_receive(&self, envelope: ReceiveEnvelope, capacity: Count) -> Result<Handle> {
        let mut state = self.state.lock();
        let handle = state.allocate(envelope.group)?;
        let receive = PendingReceive {
            handle,
            envelope,
            capacity,
        };

        let queues = state.queues.entry(envelope.group).or_default();
        let position = queues
            .sends
            .iter()
            .position(|send| envelope.accepts(&send.envelope));
        match position.and_then(|position| queues.sends.remove(position)) {
            Some(send) => {
                state.complete(send, receive);
                self.progress.notify_all();
            }
            None => {
                trace!(%handle, ?envelope, "receive queued");
                queues.receives.push_back(receive);
            }
        }
        Ok(handle)
    }

    /// Blocks until the operation `handle` has finished and releases it.
    pub fn wait(&self, handle: Handle) -> Result<Completion> {
        let mut state = self.state.lock();
        loop {
            if let Some(completion) = state.take_finished(handle)? {
                return Ok(completion);
            }
            self.progress.wait(&mut state);
        }
    }

    /// Like `wait()`, but gives up after `timeout`.
    ///
    /// Returns `None` if the operation is still pending when the timeout expires. The operation
    /// stays posted in that case. A timeout beyond the range of `Instant` waits indefinitely.
    pub fn wait_timeout(&self, handle: Handle, timeout: Duration) -> Result<Option<Completion>> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.wait(handle).map(Some),
        };
        let mut state = self.state.lock();
        loop {
            if let Some(completion) = state.take_finished(handle)? {
                return Ok(Some(completion));
            }
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                return state.take_finished(handle);
            }
        }
    }

    /// Releases the operation `handle` if it has finished, otherwise returns `None`.
    pub fn test(&self, handle: Handle) -> Result<Option<Completion>> {
        self.state.lock().take_finished(handle)
    }

    /// Cancels the operation `handle` if it has not been matched yet.
    ///
    /// A cancelled operation still has to be completed; its status reports the cancellation.
    /// Fails with `AlreadyMatched` if the operation has already finished, and with the error of
    /// the operation if it failed unmatched.
    pub fn cancel(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        let group = match state.operations.get(&handle) {
            None => return Err(Error::StaleHandle(handle)),
            Some(Operation::Pending { group }) => *group,
            Some(Operation::Failed(error)) => return Err(error.clone()),
            Some(Operation::Complete(_)) => return Err(Error::AlreadyMatched(handle)),
        };
        state.dequeue(group, handle);
        state.operations.insert(
            handle,
            Operation::Complete(Completion {
                status: Status::cancelled(),
                payload: None,
            }),
        );
        debug!(%handle, %group, "cancelled");
        self.progress.notify_all();
        Ok(())
    }

    /// Forgets the operation `handle`, cancelling it if it is still pending.
    pub(crate) fn discard(&self, handle: Handle) {
        let mut state = self.state.lock();
        if let Some(Operation::Pending { group }) = state.operations.remove(&handle) {
            state.dequeue(group, handle);
            debug!(%handle, %group, "discarded pending operation");
        }
    }

    /// Returns the status of the earliest pending send `envelope` would receive, without
    /// receiving it.
    pub fn probe(&self, envelope: &ReceiveEnvelope) -> Result<Option<Status>> {
        self.state.lock().probe(envelope)
    }

    /// Blocks until a send `envelope` would receive is pending and returns its status.
    pub fn wait_probe(&self, envelope: &ReceiveEnvelope) -> Result<Status> {
        let mut state = self.state.lock();
        loop {
            if let Some(status) = state.probe(envelope)? {
                return Ok(status);
            }
            self.progress.wait(&mut state);
        }
    }

    /// Number of unmatched operations in `group`
    pub fn pending(&self, group: GroupId) -> PendingCounts {
        let state = self.state.lock();
        state
            .queues
            .get(&group)
            .map(|queues| PendingCounts {
                sends: queues.sends.len(),
                receives: queues.receives.len(),
            })
            .unwrap_or_default()
    }

    /// Fails all pending operations of `group` and rejects new ones.
    pub fn release_group(&self, group: GroupId) {
        let mut state = self.state.lock();
        state.released.insert(group);
        if let Some(queues) = state.queues.remove(&group) {
            let handles = queues
                .sends
                .iter()
                .map(|send| send.handle)
                .chain(queues.receives.iter().map(|receive| receive.handle));
            for handle in handles {
                state
                    .operations
                    .insert(handle, Operation::Failed(Error::InvalidGroup(group)));
            }
            debug!(
                %group,
                sends = queues.sends.len(),
                receives = queues.receives.len(),
                "released group with pending operations"
            );
        }
        self.progress.notify_all();
    }
}
