//! Error handling and error handlers
//!
//! Every fallible operation returns a [`Result`] whose error is an [`Error`]. Errors carry the
//! context of the failed call; [`Error::kind`] reduces them to an [`ErrorKind`], the error class
//! in MPI terms. No error class is fatal to the runtime: registry, matcher and coordinator stay
//! consistent after any failure, so callers may keep communicating.
//!
//! In addition to being returned, errors raised on a communicator are passed to the
//! [`ErrorHandler`] attached to it (see `SimpleCommunicator::set_error_handler()`). The default
//! handler, [`ErrorsReturn`], does nothing. [`ErrorsLog`] reports the error through `tracing`.
//! Aborting the program is a policy decision left to user-supplied handlers.

use std::fmt;

use thiserror::Error;

use crate::rendezvous::Handle;
use crate::topology::{GroupId, ParticipantId, Rank};
use crate::{Count, Tag};

macro_rules! build_error_kind {
    {
        $(#[$doc:meta])*
        pub enum $name:ident {
            $(
                 #[$err_doc:meta]
                 #[class($class:literal)]
                 $rust_err:ident,
            )*
        }
    } => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
            #[$err_doc]
            $rust_err,
            )*
        }

        impl $name {
            /// The error class name, as printed in log output.
            pub fn class(&self) -> &'static str {
                match *self {
                    $(
                    $name::$rust_err => $class,
                    )*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.class())
            }
        }
    }
}

build_error_kind! {
    /// Set of error classes that can be reported by the runtime.
    pub enum ErrorKind {
        /// The world group was created a second time
        #[class("ERR_ALREADY_INITIALIZED")]
        AlreadyInitialized,
        /// Invalid group argument, the group is stale or has been freed
        #[class("ERR_GROUP")]
        InvalidGroup,
        /// Message truncated on receive
        #[class("ERR_TRUNCATE")]
        Truncation,
        /// Cancellation of a request that has already been matched or completed
        #[class("ERR_ALREADY_MATCHED")]
        AlreadyMatched,
        /// Invalid root argument
        #[class("ERR_ROOT")]
        InvalidRoot,
        /// A request handle that has already been completed and released
        #[class("ERR_REQUEST")]
        StaleHandle,
        /// Invalid rank argument
        #[class("ERR_RANK")]
        InvalidRank,
        /// Invalid tag argument
        #[class("ERR_TAG")]
        InvalidTag,
        /// Invalid size or count argument
        #[class("ERR_SIZE")]
        InvalidSize,
        /// Element type of the receive buffer does not match the message
        #[class("ERR_TYPE")]
        TypeMismatch,
        /// The request does not support cancellation
        #[class("ERR_CANCEL")]
        NotCancellable,
        /// Invalid configuration value
        #[class("ERR_CONFIG")]
        Configuration,
        /// Error in spawning participant threads
        #[class("ERR_SPAWN")]
        Spawn,
    }
}

/// An error raised by a runtime operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The world group has already been created.
    #[error("the runtime has already been initialized")]
    AlreadyInitialized,
    /// The group handle is stale or the group has been freed.
    #[error("group {0} is stale or has been freed")]
    InvalidGroup(GroupId),
    /// The matched message contained more elements than the receive buffer holds.
    ///
    /// The first `received` elements have been written to the receive buffer.
    #[error("message from rank {peer} with tag {tag} truncated: {sent} elements sent, {received} received")]
    Truncation {
        /// Rank of the sending process
        peer: Rank,
        /// Tag of the message
        tag: Tag,
        /// Number of elements sent
        sent: Count,
        /// Number of elements written to the receive buffer
        received: Count,
    },
    /// The operation has already been matched and can no longer be cancelled.
    #[error("{0} has already been matched")]
    AlreadyMatched(Handle),
    /// The root of a collective operation is outside of the group.
    #[error("root rank {root} is outside of a group of size {size}")]
    InvalidRoot {
        /// The offending root
        root: Rank,
        /// Size of the group
        size: Rank,
    },
    /// The request handle has already been completed and released.
    #[error("{0} is stale")]
    StaleHandle(Handle),
    /// A peer rank is outside of the group.
    #[error("rank {rank} is outside of a group of size {size}")]
    InvalidRank {
        /// The offending rank
        rank: Rank,
        /// Size of the group
        size: Rank,
    },
    /// A user tag is negative; negative tags are reserved for collective traffic.
    #[error("tag {0} is invalid, user tags must be non-negative")]
    InvalidTag(Tag),
    /// A size or count is zero where that is not allowed, or exceeds the range of `Count`.
    #[error("size {0} is invalid")]
    InvalidSize(usize),
    /// The receive buffer element type differs from the sent element type.
    #[error("type mismatch: message holds `{sent}`, receive buffer holds `{expected}`")]
    TypeMismatch {
        /// Element type of the receive buffer
        expected: &'static str,
        /// Element type of the message
        sent: &'static str,
    },
    /// The request cannot be cancelled.
    #[error("{0} requests cannot be cancelled")]
    NotCancellable(&'static str),
    /// A configuration value could not be understood.
    #[error("invalid value `{value}` for `{variable}`")]
    Configuration {
        /// Name of the configuration variable
        variable: &'static str,
        /// The value as found
        value: String,
    },
    /// A participant thread could not be spawned.
    #[error("failed to spawn participant {participant}: {reason}")]
    Spawn {
        /// Participant whose thread failed to start
        participant: ParticipantId,
        /// Reason reported by the operating system
        reason: String,
    },
}

impl Error {
    /// The error class of this error
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Error::InvalidGroup(_) => ErrorKind::InvalidGroup,
            Error::Truncation { .. } => ErrorKind::Truncation,
            Error::AlreadyMatched(_) => ErrorKind::AlreadyMatched,
            Error::InvalidRoot { .. } => ErrorKind::InvalidRoot,
            Error::StaleHandle(_) => ErrorKind::StaleHandle,
            Error::InvalidRank { .. } => ErrorKind::InvalidRank,
            Error::InvalidTag(_) => ErrorKind::InvalidTag,
            Error::InvalidSize(_) => ErrorKind::InvalidSize,
            Error::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Error::NotCancellable(_) => ErrorKind::NotCancellable,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Spawn { .. } => ErrorKind::Spawn,
        }
    }
}

/// Result type of all fallible runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Describes a failed operation to an `ErrorHandler`.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    /// Name of the operation that failed, e.g. `"send"`
    pub operation: &'static str,
    /// Group of the communicator the operation was issued on
    pub group: GroupId,
    /// Participant that issued the operation
    pub participant: ParticipantId,
    /// The error that is about to be returned
    pub error: &'a Error,
}

/// Something that is told about errors raised on a communicator.
///
/// Handlers are invoked on the thread of the participant that issued the failing call, right
/// before the error is returned to the caller.
pub trait ErrorHandler: Send + Sync {
    /// Handle the error described by `context`.
    fn handle(&self, context: &ErrorContext<'_>);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ErrorContext<'_>) + Send + Sync,
{
    fn handle(&self, context: &ErrorContext<'_>) {
        self(context)
    }
}

/// Error handler that does nothing, errors are only returned.
#[derive(Copy, Clone, Debug, Default)]
pub struct ErrorsReturn;

impl ErrorHandler for ErrorsReturn {
    fn handle(&self, _context: &ErrorContext<'_>) {}
}

/// Error handler that logs every error as a warning.
#[derive(Copy, Clone, Debug, Default)]
pub struct ErrorsLog;

impl ErrorHandler for ErrorsLog {
    fn handle(&self, context: &ErrorContext<'_>) {
        tracing::warn!(
            operation = context.operation,
            group = %context.group,
            participant = context.participant,
            class = %context.error.kind(),
            "{}",
            context.error
        );
    }
}

/// Passes the error in `result`, if any, to `handler`.
pub(crate) fn report<T>(
    handler: &dyn ErrorHandler,
    operation: &'static str,
    group: GroupId,
    participant: ParticipantId,
    result: Result<T>,
) -> Result<T> {
    if let Err(ref error) = result {
        handler.handle(&ErrorContext {
            operation,
            group,
            participant,
            error,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(Error::AlreadyInitialized.kind(), ErrorKind::AlreadyInitialized);
        assert_eq!(
            Error::InvalidRoot { root: 4, size: 4 }.kind(),
            ErrorKind::InvalidRoot
        );
        assert_eq!(Error::InvalidTag(-3).kind(), ErrorKind::InvalidTag);
        assert_eq!(ErrorKind::Truncation.class(), "ERR_TRUNCATE");
        assert_eq!(ErrorKind::InvalidGroup.to_string(), "ERR_GROUP");
    }

    #[test]
    fn messages_carry_context() {
        let error = Error::Truncation {
            peer: 2,
            tag: 7,
            sent: 8,
            received: 4,
        };
        assert_eq!(
            error.to_string(),
            "message from rank 2 with tag 7 truncated: 8 elements sent, 4 received"
        );
    }

    #[test]
    fn report_invokes_handler_only_on_error() {
        let calls = AtomicUsize::new(0);
        let handler = |context: &ErrorContext<'_>| {
            assert_eq!(context.operation, "probe");
            assert_eq!(context.error.kind(), ErrorKind::InvalidTag);
            calls.fetch_add(1, Ordering::SeqCst);
        };
        let group = GroupId::from_raw(3);

        assert_eq!(report(&handler, "probe", group, 0, Ok(5)), Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let res: Result<()> = report(&handler, "probe", group, 0, Err(Error::InvalidTag(-1)));
        assert_eq!(res, Err(Error::InvalidTag(-1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
