//! An in-process message passing runtime with MPI-style semantics
//!
//! A computation consists of a fixed number of participants, each running on its own thread.
//! Participants are organized in groups in which each has a rank, and communicate through
//! point to point transfers matched by source, tag and group, and through collective
//! operations. The semantics follow those of the [Message Passing Interface][MPI]: messages
//! between two processes with the same tag do not overtake each other, receives may accept any
//! source or any tag, oversized messages are truncated, and unmatched operations can be
//! cancelled.
//!
//! [MPI]: http://www.mpi-forum.org
//!
//! # Usage
//!
//! ```
//! use threadmpi::traits::*;
//! use threadmpi::{Config, Universe};
//!
//! let universe = Universe::new(Config::new(2)).unwrap();
//! universe
//!     .run(|world| {
//!         match world.rank()? {
//!             0 => {
//!                 let msg = vec![4.0f64, 8.0, 15.0];
//!                 world.process_at_rank(1).send(&msg[..])?;
//!             }
//!             1 => {
//!                 let (msg, status) = world.any_process().receive_vec::<f64>()?;
//!                 assert_eq!(msg, vec![4.0, 8.0, 15.0]);
//!                 assert_eq!(status.source_rank(), 0);
//!             }
//!             _ => unreachable!(),
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! ```
//!
//! # Features
//!
//! - **Groups and communicators**: the world group, duplication and freeing of communicators
//! - **Point to point communication**:
//!   - send and receive in blocking and non-blocking variants
//!   - wildcard source and tag on the receive side
//!   - send-receive
//!   - probe
//!   - cancellation of unmatched requests
//! - **Collective communication**:
//!   - barrier in blocking and non-blocking variants
//!   - broadcast
//! - **Error handlers** attached to communicators
//!
//! Runtime events are reported through `tracing`; install a subscriber to see them.

#![warn(missing_docs)]

pub mod collective;
pub mod datatype;
pub mod environment;
pub mod error;
pub mod point_to_point;
pub mod rendezvous;
pub mod request;
pub mod topology;

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::traits::*;
    pub use crate::datatype::traits::*;
    pub use crate::point_to_point::traits::*;
    pub use crate::topology::traits::*;
}

pub use crate::environment::{initialize, Config, Universe};
pub use crate::error::{Error, ErrorKind, Result};

/// Encodes number of values in multi-value messages.
pub type Count = i32;
/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
