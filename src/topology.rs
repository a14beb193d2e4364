//! Organizing participants as groups and communicators
//!
//! Participants are the threads partaking in a computation, identified by a `ParticipantId`
//! from `0` to the size of the universe. The `Registry` organizes them in `Group`s, ordered and
//! immutable sets of participants in which every member has a `Rank` in `[0, size)`.
//!
//! Upon creation of a `Universe` the registry creates the world group containing all
//! participants. Every participant then holds its own `SimpleCommunicator`, a handle binding the
//! world group to the participant's rank. From a communicator further communicators can be
//! created with `duplicate()`; they have the same members but their message traffic is kept
//! apart. Processes are addressed via their `Rank` within a specific communicator, a pairing
//! encapsulated in a `Process`.
//!
//! Groups can be freed. Handles to a freed group are stale: lookups and communication on them
//! fail with `InvalidGroup`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use conv::ConvUtil;
use parking_lot::RwLock;
use tracing::debug;

use crate::collective;
use crate::environment::Runtime;
use crate::error::{self, Error, ErrorHandler, Result};

/// Topology traits
pub mod traits {
    pub use super::AsCommunicator;
}

/// Identifies a certain process within a group.
pub type Rank = i32;

/// Identifies a participant of the universe, independently of any group.
pub type ParticipantId = usize;

/// Identifies a group
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) const fn from_raw(raw: u64) -> GroupId {
        GroupId(raw)
    }

    pub(crate) fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An ordered, immutable set of participants
///
/// The position of a participant in the set is its rank. A `Group` is a handle; whether it is
/// still live is known to the `Registry` that created it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    id: GroupId,
    members: Arc<[ParticipantId]>,
}

impl Group {
    /// The identifier of this group
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// The participants in rank order
    pub fn members(&self) -> &[ParticipantId] {
        &self.members
    }

    fn rank_of(&self, participant: ParticipantId) -> Option<usize> {
        self.members.iter().position(|&member| member == participant)
    }
}

#[derive(Default)]
struct RegistryState {
    world: Option<GroupId>,
    groups: HashMap<GroupId, Group>,
    next_id: u64,
}

impl RegistryState {
    fn register(&mut self, members: Arc<[ParticipantId]>) -> Group {
        let group = Group {
            id: GroupId(self.next_id),
            members,
        };
        self.next_id += 1;
        self.groups.insert(group.id, group.clone());
        group
    }

    fn live(&self, group: &Group) -> Result<&Group> {
        self.groups
            .get(&group.id)
            .ok_or(Error::InvalidGroup(group.id))
    }
}

/// The authority on groups and ranks
///
/// The registry owns all groups. It creates the world group exactly once and afterwards
/// answers rank and size lookups, which fail for groups that have been freed.
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Registry")
            .field("world", &state.world)
            .field("groups", &state.groups.len())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Creates the group of all `participant_count` participants.
    ///
    /// Participant `i` has rank `i` in the world group. Fails with `AlreadyInitialized` if the
    /// world group has been created before.
    pub fn create_world_group(&self, participant_count: usize) -> Result<Group> {
        if participant_count == 0 {
            return Err(Error::InvalidSize(participant_count));
        }
        participant_count
            .value_as::<Rank>()
            .map_err(|_| Error::InvalidSize(participant_count))?;

        let mut state = self.state.write();
        if state.world.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let group = state.register((0..participant_count).collect());
        state.world = Some(group.id);
        debug!(group = %group.id, size = participant_count, "created world group");
        Ok(group)
    }

    /// The world group, if it has been created and not freed
    pub fn world(&self) -> Option<Group> {
        let state = self.state.read();
        state.world.and_then(|id| state.groups.get(&id).cloned())
    }

    /// Looks up a live group by its identifier.
    pub fn group(&self, id: GroupId) -> Result<Group> {
        self.state
            .read()
            .groups
            .get(&id)
            .cloned()
            .ok_or(Error::InvalidGroup(id))
    }

    /// Whether `group` has not been freed
    pub fn is_live(&self, group: &Group) -> bool {
        self.state.read().groups.contains_key(&group.id)
    }

    /// The rank of `participant` in `group`
    pub fn rank(&self, group: &Group, participant: ParticipantId) -> Result<Rank> {
        let state = self.state.read();
        let group = state.live(group)?;
        let size = group.members.len();
        group
            .rank_of(participant)
            .ok_or(Error::InvalidRank {
                rank: participant.value_as::<Rank>().unwrap_or(Rank::MAX),
                size: size.value_as::<Rank>().unwrap_or(Rank::MAX),
            })?
            .value_as::<Rank>()
            .map_err(|_| Error::InvalidSize(size))
    }

    /// The number of members of `group`
    pub fn size(&self, group: &Group) -> Result<Rank> {
        let state = self.state.read();
        let size = state.live(group)?.members.len();
        size.value_as::<Rank>().map_err(|_| Error::InvalidSize(size))
    }

    /// Registers a new group with the same members as `group`.
    pub fn duplicate_group(&self, group: &Group) -> Result<Group> {
        let mut state = self.state.write();
        let members = Arc::clone(&state.live(group)?.members);
        let duplicate = state.register(members);
        debug!(group = %group.id, duplicate = %duplicate.id, "duplicated group");
        Ok(duplicate)
    }

    /// Removes `group`, turning all handles to it stale.
    pub fn free_group(&self, group: &Group) -> Result<()> {
        let mut state = self.state.write();
        state
            .groups
            .remove(&group.id)
            .ok_or(Error::InvalidGroup(group.id))?;
        debug!(group = %group.id, "freed group");
        Ok(())
    }
}

/// Something that has a communicator associated with it
pub trait AsCommunicator {
    /// Returns the associated communicator.
    fn as_communicator(&self) -> &SimpleCommunicator;
}

/// A participant's handle to a group
///
/// Each participant holds its own communicator; the communicators of the members of a group
/// together form the communication context of that group.
///
/// # Examples
/// See `demos/simple.rs`
pub struct SimpleCommunicator {
    runtime: Arc<Runtime>,
    group: Group,
    participant: ParticipantId,
    error_handler: Arc<dyn ErrorHandler>,
}

impl fmt::Debug for SimpleCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCommunicator")
            .field("group", &self.group.id)
            .field("participant", &self.participant)
            .finish()
    }
}

impl AsCommunicator for SimpleCommunicator {
    fn as_communicator(&self) -> &SimpleCommunicator {
        self
    }
}

impl SimpleCommunicator {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        group: Group,
        participant: ParticipantId,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> SimpleCommunicator {
        SimpleCommunicator {
            runtime,
            group,
            participant,
            error_handler,
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub(crate) fn error_handler(&self) -> &Arc<dyn ErrorHandler> {
        &self.error_handler
    }

    /// Passes an error in `result` to the error handler of this communicator.
    pub(crate) fn checked<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        error::report(
            &*self.error_handler,
            operation,
            self.group.id,
            self.participant,
            result,
        )
    }

    /// The group of this communicator
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// The participant holding this communicator
    pub fn participant(&self) -> ParticipantId {
        self.participant
    }

    /// Number of processes in this communicator
    ///
    /// # Examples
    /// See `demos/simple.rs`
    pub fn size(&self) -> Result<Rank> {
        self.checked("size", self.runtime.registry.size(&self.group))
    }

    /// The `Rank` that identifies the calling process within this communicator
    ///
    /// # Examples
    /// See `demos/simple.rs`
    pub fn rank(&self) -> Result<Rank> {
        self.checked(
            "rank",
            self.runtime.registry.rank(&self.group, self.participant),
        )
    }

    /// Bundles a reference to this communicator with a specific `Rank` into a `Process`.
    ///
    /// The rank is validated by the operations using the `Process`.
    ///
    /// # Examples
    /// See `demos/broadcast.rs` `demos/send_receive.rs`
    pub fn process_at_rank(&self, r: Rank) -> Process<'_> {
        Process {
            comm: self,
            rank: r,
        }
    }

    /// Returns an `AnyProcess` identifier that can be used, e.g. as a `Source` in point to point
    /// communication.
    pub fn any_process(&self) -> AnyProcess<'_> {
        AnyProcess(self)
    }

    /// A `Process` for the calling process
    pub fn this_process(&self) -> Result<Process<'_>> {
        let rank = self.rank()?;
        Ok(self.process_at_rank(rank))
    }

    /// Replaces the error handler of this communicator.
    ///
    /// Communicators created from this one by `duplicate()` inherit the handler.
    ///
    /// # Examples
    /// See `demos/error_handler.rs`
    pub fn set_error_handler<H: ErrorHandler + 'static>(&mut self, handler: H) {
        self.error_handler = Arc::new(handler);
    }

    /// Duplicate a communicator.
    ///
    /// The new communicator has the same members, but messages sent on it are never matched by
    /// receives on `self` and vice versa. This is a collective operation: every member of the
    /// group has to call it, and each receives its own handle to the same new group.
    pub fn duplicate(&self) -> Result<SimpleCommunicator> {
        let result = self.duplicate_group();
        self.checked("duplicate", result)
    }

    fn duplicate_group(&self) -> Result<SimpleCommunicator> {
        let mut id = 0u64;
        if self.runtime.registry.rank(&self.group, self.participant)? == 0 {
            id = self.runtime.registry.duplicate_group(&self.group)?.id.as_raw();
        }
        collective::broadcast(self, 0, &mut id)?;
        let group = self.runtime.registry.group(GroupId(id))?;
        Ok(SimpleCommunicator::new(
            Arc::clone(&self.runtime),
            group,
            self.participant,
            Arc::clone(&self.error_handler),
        ))
    }

    /// Frees the group of this communicator.
    ///
    /// Takes effect for all members at once: pending operations on the group fail with
    /// `InvalidGroup`, as does any later use of the other members' handles.
    pub fn free(self) -> Result<()> {
        let result = self.runtime.free_group(&self.group);
        self.checked("free", result)
    }
}

/// Identifies a process by its `Rank` within a certain communicator.
#[derive(Copy, Clone)]
pub struct Process<'a> {
    comm: &'a SimpleCommunicator,
    rank: Rank,
}

impl<'a> Process<'a> {
    /// The process rank
    pub fn rank(&self) -> Rank {
        self.rank
    }
}

impl<'a> fmt::Debug for Process<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("group", &self.comm.group.id)
            .field("rank", &self.rank)
            .finish()
    }
}

impl<'a> AsCommunicator for Process<'a> {
    fn as_communicator(&self) -> &SimpleCommunicator {
        self.comm
    }
}

/// Identifies an arbitrary process that is a member of a certain communicator, e.g. for use as a
/// `Source` in point to point communication.
#[derive(Copy, Clone, Debug)]
pub struct AnyProcess<'a>(&'a SimpleCommunicator);

impl<'a> AsCommunicator for AnyProcess<'a> {
    fn as_communicator(&self) -> &SimpleCommunicator {
        self.0
    }
}
