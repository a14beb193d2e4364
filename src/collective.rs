//! Collective communication
//!
//! Two collective operations are supported: barrier synchronization and broadcast.
//!
//! Barriers are run by the `Coordinator`, which counts arrivals per group. Each completed
//! barrier advances the group's barrier epoch; a process waits for the epoch to move past the
//! one it arrived in, so back-to-back barriers never mix up arrivals.
//!
//! A broadcast is a fan-out of point to point transfers from the root to every other member,
//! matched by the `rendezvous::Matcher` on a reserved tag that user receives never match.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use conv::ConvUtil;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::datatype::traits::*;
use crate::datatype::{count_of, Payload};
use crate::error::{Error, Result};
use crate::point_to_point;
use crate::rendezvous::{Envelope, Handle, Matcher, ReceiveEnvelope, Selector};
use crate::request::Request;
use crate::topology::traits::*;
use crate::topology::{GroupId, Process, Rank, SimpleCommunicator};
use crate::Tag;

/// Collective communication traits
pub mod traits {
    pub use super::{CommunicatorCollectives, Root};
}

/// Tag of the transfers making up a broadcast
pub(crate) const BROADCAST_TAG: Tag = -1;

/// The state of a group's barrier as seen by a member
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BarrierPhase {
    /// No member is waiting in the barrier
    Idle,
    /// Some, but not all members have arrived
    Arriving,
    /// All members have arrived and the barrier has opened
    Released,
}

/// Receipt for an arrival at a barrier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    /// The epoch of the barrier the member arrived at
    pub epoch: u64,
    /// `Released` for the last member to arrive, `Arriving` for all others
    pub phase: BarrierPhase,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    epoch: u64,
}

#[derive(Default)]
struct State {
    barriers: HashMap<GroupId, BarrierState>,
    /// Freed groups with the epoch their barrier had reached. Group ids are never reused, so
    /// entries are kept for the lifetime of the coordinator.
    freed: HashMap<GroupId, u64>,
}

impl State {
    fn epoch(&self, group: GroupId) -> Result<u64> {
        if self.freed.contains_key(&group) {
            return Err(Error::InvalidGroup(group));
        }
        Ok(self
            .barriers
            .get(&group)
            .map_or(0, |barrier| barrier.epoch))
    }

    /// Whether the barrier of `group` in `epoch` has opened. Barriers that opened before the
    /// group was freed still count as opened.
    fn passed(&self, group: GroupId, epoch: u64) -> Result<bool> {
        match self.freed.get(&group) {
            Some(&last) if last > epoch => Ok(true),
            Some(_) => Err(Error::InvalidGroup(group)),
            None => Ok(self.epoch(group)? > epoch),
        }
    }
}

/// Runs the barriers of all groups.
#[derive(Default)]
pub struct Coordinator {
    state: Mutex<State>,
    released: Condvar,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coordinator")
            .field("barriers", &state.barriers.len())
            .field("freed", &state.freed.len())
            .finish()
    }
}

impl Coordinator {
    /// Creates a coordinator without barrier state.
    pub fn new() -> Coordinator {
        Coordinator::default()
    }

    /// Registers the arrival of one of `size` members of `group` at its current barrier.
    ///
    /// The last member to arrive opens the barrier: the arrival count is reset and the epoch
    /// advances.
    pub fn arrive(&self, group: GroupId, size: usize) -> Result<Ticket> {
        let mut state = self.state.lock();
        state.epoch(group)?;
        let barrier = state.barriers.entry(group).or_default();
        let epoch = barrier.epoch;
        barrier.arrived += 1;
        trace!(%group, epoch, arrived = barrier.arrived, size, "barrier arrival");
        if barrier.arrived < size {
            return Ok(Ticket {
                epoch,
                phase: BarrierPhase::Arriving,
            });
        }
        barrier.arrived = 0;
        barrier.epoch += 1;
        debug!(%group, epoch, "barrier released");
        self.released.notify_all();
        Ok(Ticket {
            epoch,
            phase: BarrierPhase::Released,
        })
    }

    /// Whether the barrier of `group` in `epoch` has opened
    pub fn is_released(&self, group: GroupId, epoch: u64) -> Result<bool> {
        self.state.lock().passed(group, epoch)
    }

    /// Blocks until the barrier of `group` in `epoch` has opened.
    pub fn wait_released(&self, group: GroupId, epoch: u64) -> Result<()> {
        let mut state = self.state.lock();
        while !state.passed(group, epoch)? {
            self.released.wait(&mut state);
        }
        Ok(())
    }

    /// Like `wait_released()`, but gives up after `timeout` and returns `false`.
    ///
    /// A timeout beyond the range of `Instant` waits indefinitely.
    pub fn wait_released_timeout(
        &self,
        group: GroupId,
        epoch: u64,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.wait_released(group, epoch).map(|()| true),
        };
        let mut state = self.state.lock();
        while !state.passed(group, epoch)? {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return state.passed(group, epoch);
            }
        }
        Ok(true)
    }

    /// Enters the barrier of `group` and blocks until all `size` members have entered it.
    pub fn barrier(&self, group: GroupId, size: usize) -> Result<()> {
        let ticket = self.arrive(group, size)?;
        self.wait_released(group, ticket.epoch)
    }

    /// Number of barriers `group` has completed
    pub fn epoch(&self, group: GroupId) -> Result<u64> {
        self.state.lock().epoch(group)
    }

    /// Whether members are currently waiting in the barrier of `group`
    ///
    /// Returns `Idle` or `Arriving`. A barrier is reset as soon as it opens, so `Released` is only
    /// reported to the last arrival through its `Ticket`.
    pub fn phase(&self, group: GroupId) -> Result<BarrierPhase> {
        let state = self.state.lock();
        state.epoch(group)?;
        let arrived = state.barriers.get(&group).map_or(0, |barrier| barrier.arrived);
        Ok(if arrived == 0 {
            BarrierPhase::Idle
        } else {
            BarrierPhase::Arriving
        })
    }

    /// Drops the barrier state of `group` and fails its waiters.
    pub fn release_group(&self, group: GroupId) {
        let mut state = self.state.lock();
        let barrier = state.barriers.remove(&group).unwrap_or_default();
        if barrier.arrived > 0 {
            debug!(%group, arrived = barrier.arrived, "released group inside a barrier");
        }
        state.freed.insert(group, barrier.epoch);
        self.released.notify_all();
    }
}

fn group_size(comm: &SimpleCommunicator) -> Result<usize> {
    let size = comm.runtime().registry.size(comm.group())?;
    size.value_as::<usize>().map_err(|_| Error::InvalidSize(0))
}

/// Collective communication patterns defined on communicators
pub trait CommunicatorCollectives: AsCommunicator {
    /// Barrier synchronization among all processes in a communicator
    ///
    /// Partake in a barrier synchronization across all processes in the communicator `&self`.
    ///
    /// Calling processes will enter the barrier and block execution until all processes in the
    /// communicator `&self` have entered the barrier.
    ///
    /// # Examples
    ///
    /// See `demos/barrier.rs`
    fn barrier(&self) -> Result<()> {
        let comm = self.as_communicator();
        let result = group_size(comm).and_then(|size| {
            comm.runtime()
                .coordinator
                .barrier(comm.group().id(), size)
        });
        comm.checked("barrier", result)
    }

    /// Non-blocking barrier synchronization among all processes in a communicator
    ///
    /// The arrival of the calling process is registered right away. The returned request
    /// completes once all processes in the communicator have entered the barrier. It cannot be
    /// cancelled.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    fn immediate_barrier(&self) -> Result<Request<'static>> {
        let comm = self.as_communicator();
        let result = group_size(comm)
            .and_then(|size| comm.runtime().coordinator.arrive(comm.group().id(), size))
            .map(|ticket| Request::barrier(comm, ticket.epoch));
        comm.checked("immediate_barrier", result)
    }
}

impl CommunicatorCollectives for SimpleCommunicator {}

/// Something that can take the role of 'root' in a collective operation.
///
/// Many collective operations define a 'root' process that takes a special role in the
/// communication. These collective operations are implemented as default methods of this trait.
pub trait Root: AsCommunicator {
    /// Rank of the root process
    fn root_rank(&self) -> Rank;

    /// Broadcast of the contents of a buffer
    ///
    /// After the call completes, the `Buffer` on all processes in the communicator holds the
    /// same data as the `Buffer` on the root process. Fails with `InvalidRoot` if the root rank
    /// is outside of the communicator.
    ///
    /// # Examples
    ///
    /// See `demos/broadcast.rs`
    fn broadcast_into<Buf: ?Sized>(&self, buffer: &mut Buf) -> Result<()>
    where
        Buf: BufferMut,
    {
        let comm = self.as_communicator();
        let result = broadcast(comm, self.root_rank(), buffer);
        comm.checked("broadcast", result)
    }
}

impl<'a> Root for Process<'a> {
    fn root_rank(&self) -> Rank {
        self.rank()
    }
}

/// Copies `buf` from `root` to all other members of `comm`.
pub(crate) fn broadcast<Buf>(comm: &SimpleCommunicator, root: Rank, buf: &mut Buf) -> Result<()>
where
    Buf: BufferMut + ?Sized,
{
    let runtime = comm.runtime();
    let size = runtime.registry.size(comm.group())?;
    if !(0..size).contains(&root) {
        return Err(Error::InvalidRoot { root, size });
    }
    let rank = runtime.registry.rank(comm.group(), comm.participant())?;
    let group = comm.group().id();
    let items = buf.as_items_mut();

    if rank == root {
        let mut handles: SmallVec<[Handle; 8]> = SmallVec::new();
        for destination in (0..size).filter(|&r| r != root) {
            let envelope = Envelope {
                source: root,
                destination,
                tag: BROADCAST_TAG,
                group,
            };
            match Payload::from_buffer(&*items)
                .and_then(|payload| runtime.matcher.post_send(envelope, payload))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    discard_all(&runtime.matcher, &handles);
                    return Err(e);
                }
            }
        }
        trace!(%group, root, sends = handles.len(), "broadcast fan-out posted");
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = runtime.matcher.wait(handle) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    } else {
        let envelope = ReceiveEnvelope {
            source: Selector::Exact(root),
            destination: rank,
            tag: Selector::Exact(BROADCAST_TAG),
            group,
        };
        let handle = runtime
            .matcher
            .post_receive(envelope, count_of(items.len())?)?;
        point_to_point::deliver(runtime.matcher.wait(handle)?, items).map(|_| ())
    }
}

fn discard_all(matcher: &Matcher, handles: &[Handle]) {
    for &handle in handles {
        matcher.discard(handle);
    }
}
