//! Point to point communication
//!
//! Endpoints of communication are mostly described by types that implement the `Source` and
//! `Destination` trait. Communication operations are implemented as default methods on those
//! traits.
//!
//! Sends and receives are matched by the `rendezvous::Matcher` of the universe. A send copies
//! its buffer when it is posted; a receive writes to its buffer when it completes. Blocking
//! operations return once they have been matched, immediate operations return a `Request` that
//! has to be completed with `wait()` or `test()`.
//!
//! Tags passed to these operations have to be non-negative, negative tags are reserved for the
//! traffic of collective operations.

use std::fmt;

use crate::datatype::traits::*;
use crate::datatype::{count_of, Payload};
use crate::error::{Error, ErrorKind, Result};
use crate::rendezvous::{Completion, Envelope, ReceiveEnvelope, Selector};
use crate::request::Request;
use crate::topology::traits::*;
use crate::topology::{AnyProcess, Process, Rank, SimpleCommunicator};
use crate::{Count, Tag};

/// Point to point communication traits
pub mod traits {
    pub use super::{Destination, Source};
}

/// Checks that `tag` is a user tag.
fn user_tag(tag: Tag) -> Result<Tag> {
    if tag < 0 {
        Err(Error::InvalidTag(tag))
    } else {
        Ok(tag)
    }
}

/// Checks that `rank` addresses a member of `comm`.
fn peer_rank(comm: &SimpleCommunicator, rank: Rank) -> Result<Rank> {
    let size = comm.runtime().registry.size(comm.group())?;
    if (0..size).contains(&rank) {
        Ok(rank)
    } else {
        Err(Error::InvalidRank { rank, size })
    }
}

fn own_rank(comm: &SimpleCommunicator) -> Result<Rank> {
    comm.runtime()
        .registry
        .rank(comm.group(), comm.participant())
}

/// Writes the message of a completed receive to `buf`.
///
/// A message larger than `buf` fills `buf` and is reported as `Error::Truncation`.
pub(crate) fn deliver<T: Equivalence>(completion: Completion, buf: &mut [T]) -> Result<Status> {
    let status = completion.status;
    let payload = match completion.payload {
        Some(payload) => payload,
        None => return Ok(status),
    };
    let received = payload.copy_into(buf)?;
    if status.error() == Some(ErrorKind::Truncation) {
        return Err(Error::Truncation {
            peer: status.source_rank(),
            tag: status.tag(),
            sent: payload.count(),
            received,
        });
    }
    Ok(status)
}

/// Something that can be used as the source in a point to point receive operation
///
/// # Examples
///
/// - A `Process` used as a source for a receive operation will receive data only from the
/// identified process.
/// - A communicator can also be used as a source via the `AnyProcess` identifier.
pub trait Source: AsCommunicator {
    /// The ranks this source receives from
    fn source_selector(&self) -> Selector<Rank>;

    /// Builds the matching key of a receive from this source with the given tag.
    ///
    /// Validates the source rank and the tag and looks up the rank of the receiving process.
    fn receive_envelope(&self, tag: Selector<Tag>) -> Result<ReceiveEnvelope> {
        let comm = self.as_communicator();
        let source = match self.source_selector() {
            Selector::Exact(rank) => Selector::Exact(peer_rank(comm, rank)?),
            Selector::Any => Selector::Any,
        };
        let tag = match tag {
            Selector::Exact(tag) => Selector::Exact(user_tag(tag)?),
            Selector::Any => Selector::Any,
        };
        Ok(ReceiveEnvelope {
            source,
            destination: own_rank(comm)?,
            tag,
            group: comm.group().id(),
        })
    }

    /// Probe a source for incoming messages.
    ///
    /// Blocks until a message from `Source` `&self` tagged `tag` is pending and returns its
    /// `Status`, without receiving it. A subsequent receive is not guaranteed to obtain the
    /// probed message if other receives from the same source are posted concurrently.
    fn probe_with_tag(&self, tag: Tag) -> Result<Status> {
        let comm = self.as_communicator();
        let result = self
            .receive_envelope(Selector::Exact(tag))
            .and_then(|envelope| comm.runtime().matcher.wait_probe(&envelope));
        comm.checked("probe", result)
    }

    /// Probe a source for incoming messages.
    ///
    /// Like `probe_with_tag()`, but accepts messages with any tag.
    fn probe(&self) -> Result<Status> {
        let comm = self.as_communicator();
        let result = self
            .receive_envelope(Selector::Any)
            .and_then(|envelope| comm.runtime().matcher.wait_probe(&envelope));
        comm.checked("probe", result)
    }

    /// Asynchronous probe for incoming messages.
    ///
    /// Returns the `Status` of a pending message from `Source` `&self` tagged `tag`, or `None`
    /// if there is no such message.
    fn immediate_probe_with_tag(&self, tag: Tag) -> Result<Option<Status>> {
        let comm = self.as_communicator();
        let result = self
            .receive_envelope(Selector::Exact(tag))
            .and_then(|envelope| comm.runtime().matcher.probe(&envelope));
        comm.checked("immediate_probe", result)
    }

    /// Asynchronous probe for incoming messages with any tag.
    fn immediate_probe(&self) -> Result<Option<Status>> {
        let comm = self.as_communicator();
        let result = self
            .receive_envelope(Selector::Any)
            .and_then(|envelope| comm.runtime().matcher.probe(&envelope));
        comm.checked("immediate_probe", result)
    }

    /// Receive a message into a `Buffer`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` into `Buffer` `buf`. If the message
    /// holds more elements than `buf`, `buf` is filled and `Error::Truncation` is returned.
    fn receive_into_with_tag<Buf: ?Sized>(&self, buf: &mut Buf, tag: Tag) -> Result<Status>
    where
        Buf: BufferMut,
    {
        receive_into(self, buf, Selector::Exact(tag))
    }

    /// Receive a message into a `Buffer`.
    ///
    /// Receive a message from `Source` `&self` with any tag into `Buffer` `buf`.
    ///
    /// # Examples
    /// See `demos/send_receive.rs`
    fn receive_into<Buf: ?Sized>(&self, buf: &mut Buf) -> Result<Status>
    where
        Buf: BufferMut,
    {
        receive_into(self, buf, Selector::Any)
    }

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag` containing a single instance of type
    /// `Msg`.
    fn receive_with_tag<Msg>(&self, tag: Tag) -> Result<(Msg, Status)>
    where
        Msg: Equivalence + Default,
    {
        let mut res = Msg::default();
        let status = self.receive_into_with_tag(&mut res, tag)?;
        Ok((res, status))
    }

    /// Receive a message containing a single instance of type `Msg`.
    ///
    /// # Examples
    ///
    /// ```
    /// use threadmpi::traits::*;
    /// use threadmpi::{Config, Universe};
    ///
    /// let universe = Universe::new(Config::new(2)).unwrap();
    /// let sums = universe
    ///     .run(|world| {
    ///         if world.rank()? == 0 {
    ///             world.process_at_rank(1).send(&2.5f64)?;
    ///             Ok(0.0)
    ///         } else {
    ///             let (x, _) = world.any_process().receive::<f64>()?;
    ///             Ok(x)
    ///         }
    ///     })
    ///     .unwrap();
    /// assert_eq!(sums, vec![0.0, 2.5]);
    /// ```
    fn receive<Msg>(&self) -> Result<(Msg, Status)>
    where
        Msg: Equivalence + Default,
    {
        let mut res = Msg::default();
        let status = self.receive_into(&mut res)?;
        Ok((res, status))
    }

    /// Receive a message containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// Receive a message from `Source` `&self` tagged `tag`. The `Vec` is sized to the message,
    /// so the receive never truncates.
    fn receive_vec_with_tag<Msg>(&self, tag: Tag) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence,
    {
        receive_vec(self, Selector::Exact(tag))
    }

    /// Receive a message containing multiple instances of type `Msg` into a `Vec`.
    ///
    /// # Examples
    /// See `demos/send_receive.rs`
    fn receive_vec<Msg>(&self) -> Result<(Vec<Msg>, Status)>
    where
        Msg: Equivalence,
    {
        receive_vec(self, Selector::Any)
    }

    /// Initiate an immediate (non-blocking) receive operation.
    ///
    /// Initiate receiving a message matching `tag` into `buf`. The message is written to `buf`
    /// when the returned request is completed.
    fn immediate_receive_into_with_tag<'b, Buf: ?Sized>(
        &self,
        buf: &'b mut Buf,
        tag: Tag,
    ) -> Result<Request<'b>>
    where
        Buf: 'b + BufferMut,
    {
        immediate_receive_into(self, buf, Selector::Exact(tag))
    }

    /// Initiate an immediate (non-blocking) receive operation.
    ///
    /// Initiate receiving a message with any tag into `buf`.
    ///
    /// # Examples
    /// See `demos/immediate.rs`
    fn immediate_receive_into<'b, Buf: ?Sized>(&self, buf: &'b mut Buf) -> Result<Request<'b>>
    where
        Buf: 'b + BufferMut,
    {
        immediate_receive_into(self, buf, Selector::Any)
    }
}

fn receive_into<S, Buf>(source: &S, buf: &mut Buf, tag: Selector<Tag>) -> Result<Status>
where
    S: Source + ?Sized,
    Buf: BufferMut + ?Sized,
{
    let comm = source.as_communicator();
    let result = (|| -> Result<_> {
        let envelope = source.receive_envelope(tag)?;
        let items = buf.as_items_mut();
        let matcher = &comm.runtime().matcher;
        let handle = matcher.post_receive(envelope, count_of(items.len())?)?;
        deliver(matcher.wait(handle)?, items)
    })();
    comm.checked("receive", result)
}

fn receive_vec<S, Msg>(source: &S, tag: Selector<Tag>) -> Result<(Vec<Msg>, Status)>
where
    S: Source + ?Sized,
    Msg: Equivalence,
{
    let comm = source.as_communicator();
    let result = (|| -> Result<_> {
        let envelope = source.receive_envelope(tag)?;
        let matcher = &comm.runtime().matcher;
        let handle = matcher.post_receive(envelope, Count::MAX)?;
        let completion = matcher.wait(handle)?;
        let items = match completion.payload {
            Some(payload) => payload.into_vec()?,
            None => Vec::new(),
        };
        Ok((items, completion.status))
    })();
    comm.checked("receive_vec", result)
}

fn immediate_receive_into<'b, S, Buf>(
    source: &S,
    buf: &'b mut Buf,
    tag: Selector<Tag>,
) -> Result<Request<'b>>
where
    S: Source + ?Sized,
    Buf: 'b + BufferMut + ?Sized,
{
    let comm = source.as_communicator();
    let items = buf.as_items_mut();
    let result = count_of(items.len())
        .and_then(|capacity| {
            let envelope = source.receive_envelope(tag)?;
            comm.runtime().matcher.post_receive(envelope, capacity)
        })
        .map(|handle| Request::receive(comm, handle, items));
    comm.checked("immediate_receive", result)
}

impl<'a> Source for AnyProcess<'a> {
    fn source_selector(&self) -> Selector<Rank> {
        Selector::Any
    }
}

impl<'a> Source for Process<'a> {
    fn source_selector(&self) -> Selector<Rank> {
        Selector::Exact(self.rank())
    }
}

/// Something that can be used as the destination in a point to point send operation
///
/// # Examples
/// - Using a `Process` as the destination will send data to that specific process.
pub trait Destination: AsCommunicator {
    /// `Rank` that identifies the destination
    fn destination_rank(&self) -> Rank;

    /// Builds the matching key of a send to this destination with the given tag.
    fn send_envelope(&self, tag: Tag) -> Result<Envelope> {
        let comm = self.as_communicator();
        Ok(Envelope {
            source: own_rank(comm)?,
            destination: peer_rank(comm, self.destination_rank())?,
            tag: user_tag(tag)?,
            group: comm.group().id(),
        })
    }

    /// Blocking send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` and tag it. Returns once a
    /// matching receive has taken the message.
    fn send_with_tag<Buf: ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<()>
    where
        Buf: Buffer,
    {
        let comm = self.as_communicator();
        let result = (|| -> Result<_> {
            let matcher = &comm.runtime().matcher;
            let handle = matcher.post_send(self.send_envelope(tag)?, Payload::from_buffer(buf)?)?;
            matcher.wait(handle).map(|_| ())
        })();
        comm.checked("send", result)
    }

    /// Blocking send operation
    ///
    /// Send the contents of a `Buffer` to the `Destination` `&self` with tag `0`.
    ///
    /// # Examples
    /// See `demos/send_receive.rs`
    fn send<Buf: ?Sized>(&self, buf: &Buf) -> Result<()>
    where
        Buf: Buffer,
    {
        self.send_with_tag(buf, Tag::default())
    }

    /// Initiate an immediate (non-blocking) send operation.
    ///
    /// The contents of `buf` are copied before this returns, so `buf` is not borrowed by the
    /// request.
    fn immediate_send_with_tag<Buf: ?Sized>(&self, buf: &Buf, tag: Tag) -> Result<Request<'static>>
    where
        Buf: Buffer,
    {
        let comm = self.as_communicator();
        let result = (|| -> Result<_> {
            let handle = comm
                .runtime()
                .matcher
                .post_send(self.send_envelope(tag)?, Payload::from_buffer(buf)?)?;
            Ok(Request::send(comm, handle))
        })();
        comm.checked("immediate_send", result)
    }

    /// Initiate an immediate (non-blocking) send operation with tag `0`.
    ///
    /// # Examples
    /// See `demos/immediate.rs`
    fn immediate_send<Buf: ?Sized>(&self, buf: &Buf) -> Result<Request<'static>>
    where
        Buf: Buffer,
    {
        self.immediate_send_with_tag(buf, Tag::default())
    }
}

impl<'a> Destination for Process<'a> {
    fn destination_rank(&self) -> Rank {
        self.rank()
    }
}

/// Describes the result of a point to point receive operation.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Status {
    peer: Rank,
    tag: Tag,
    count: Count,
    error: Option<ErrorKind>,
    cancelled: bool,
}

impl Status {
    pub(crate) fn matched(peer: Rank, tag: Tag, count: Count, error: Option<ErrorKind>) -> Status {
        Status {
            peer,
            tag,
            count,
            error,
            cancelled: false,
        }
    }

    pub(crate) fn cancelled() -> Status {
        Status {
            cancelled: true,
            ..Status::empty()
        }
    }

    /// Status of an operation that does not transfer data.
    pub(crate) fn empty() -> Status {
        Status::matched(-1, -1, 0, None)
    }

    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.peer
    }

    /// The rank of the matched partner, the destination for sends and the source for receives
    pub fn peer_rank(&self) -> Rank {
        self.peer
    }

    /// The message tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of elements transferred
    pub fn count(&self) -> Count {
        self.count
    }

    /// The error class the operation finished with, if any
    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// Whether the operation was cancelled before being matched
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether the operation transferred its message without error
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status {{ peer: {}, tag: {}, count: {}",
            self.peer, self.tag, self.count
        )?;
        if let Some(error) = self.error {
            write!(f, ", error: {}", error)?;
        }
        if self.cancelled {
            f.write_str(", cancelled")?;
        }
        f.write_str(" }")
    }
}

/// Sends the contents of `msg` to `destination` tagging it `sendtag` and
/// simultaneously receives a message tagged `receivetag` from `source` into
/// `buf`.
///
/// The receive is posted before the send, so two processes exchanging messages with each other
/// this way do not deadlock.
pub fn send_receive_into_with_tags<M: ?Sized, D, B: ?Sized, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    buf: &mut B,
    source: &S,
    receivetag: Tag,
) -> Result<Status>
where
    M: Buffer,
    D: Destination,
    B: BufferMut,
    S: Source,
{
    send_receive(msg, destination, sendtag, buf, source, Selector::Exact(receivetag))
}

/// Sends the contents of `msg` to `destination` and
/// simultaneously receives a message from `source` into
/// `buf`.
///
/// # Examples
/// See `demos/send_receive.rs`
pub fn send_receive_into<M: ?Sized, D, B: ?Sized, S>(
    msg: &M,
    destination: &D,
    buf: &mut B,
    source: &S,
) -> Result<Status>
where
    M: Buffer,
    D: Destination,
    B: BufferMut,
    S: Source,
{
    send_receive(msg, destination, Tag::default(), buf, source, Selector::Any)
}

fn send_receive<M: ?Sized, D, B: ?Sized, S>(
    msg: &M,
    destination: &D,
    sendtag: Tag,
    buf: &mut B,
    source: &S,
    receivetag: Selector<Tag>,
) -> Result<Status>
where
    M: Buffer,
    D: Destination,
    B: BufferMut,
    S: Source,
{
    let comm = source.as_communicator();
    let result = (|| -> Result<_> {
        let matcher = &comm.runtime().matcher;
        let receive_envelope = source.receive_envelope(receivetag)?;
        let send_envelope = destination.send_envelope(sendtag)?;
        let items = buf.as_items_mut();
        let receive = matcher.post_receive(receive_envelope, count_of(items.len())?)?;
        let send = match Payload::from_buffer(msg)
            .and_then(|payload| matcher.post_send(send_envelope, payload))
        {
            Ok(send) => send,
            Err(e) => {
                matcher.discard(receive);
                return Err(e);
            }
        };
        let status = deliver(matcher.wait(receive)?, items);
        matcher.wait(send)?;
        status
    })();
    comm.checked("send_receive", result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_tags_are_non_negative() {
        assert_eq!(user_tag(0), Ok(0));
        assert_eq!(user_tag(42), Ok(42));
        assert_eq!(user_tag(-1), Err(Error::InvalidTag(-1)));
    }

    #[test]
    fn statuses_report_their_outcome() {
        let ok = Status::matched(2, 5, 4, None);
        assert!(ok.is_success());
        assert_eq!((ok.source_rank(), ok.tag(), ok.count()), (2, 5, 4));

        let truncated = Status::matched(2, 5, 1, Some(ErrorKind::Truncation));
        assert!(!truncated.is_success());
        assert_eq!(format!("{:?}", truncated), "Status { peer: 2, tag: 5, count: 1, error: ERR_TRUNCATE }");

        let cancelled = Status::cancelled();
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_success());
        assert_eq!(cancelled.count(), 0);
    }

    #[test]
    fn deliver_reports_truncation_after_filling_the_buffer() {
        let completion = Completion {
            status: Status::matched(1, 3, 2, Some(ErrorKind::Truncation)),
            payload: Some(Payload::from_buffer(&[1u8, 2, 3][..]).unwrap()),
        };
        let mut buf = [0u8; 2];
        assert_eq!(
            deliver(completion, &mut buf[..]),
            Err(Error::Truncation {
                peer: 1,
                tag: 3,
                sent: 3,
                received: 2
            })
        );
        assert_eq!(buf, [1, 2]);
    }
}
