//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_send()` return request objects. A request for a
//! receive borrows the receive buffer, which is written when the request is completed through
//! [`wait()`](struct.Request.html#method.wait), [`test()`](struct.Request.html#method.test) or
//! [`wait_timeout()`](struct.Request.html#method.wait_timeout). Completing a request consumes
//! it and releases the buffer.
//!
//! Dropping a request that has not been completed cancels the operation if it is still
//! unmatched and discards its outcome otherwise. To complete requests in an RAII style, wrap
//! them in a [`WaitGuard`](struct.WaitGuard.html) or [`CancelGuard`](struct.CancelGuard.html).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::datatype::Equivalence;
use crate::environment::Runtime;
use crate::error::{self, Error, ErrorHandler, Result};
use crate::point_to_point::{self, Status};
use crate::rendezvous::{Completion, Handle};
use crate::topology::{GroupId, ParticipantId, SimpleCommunicator};

/// Writes the message of a completed receive to the buffer borrowed by the request.
trait Sink {
    fn deliver(self: Box<Self>, completion: Completion) -> Result<Status>;
}

struct SliceSink<'a, T>(&'a mut [T]);

impl<'a, T: Equivalence> Sink for SliceSink<'a, T> {
    fn deliver(self: Box<Self>, completion: Completion) -> Result<Status> {
        point_to_point::deliver(completion, self.0)
    }
}

enum Pending<'a> {
    Transfer {
        handle: Handle,
        sink: Option<Box<dyn Sink + 'a>>,
    },
    Barrier {
        epoch: u64,
    },
}

fn released_barrier() -> Completion {
    Completion {
        status: Status::empty(),
        payload: None,
    }
}

fn finish<'a>(completion: Completion, sink: Option<Box<dyn Sink + 'a>>) -> Result<Status> {
    match sink {
        Some(sink) => sink.deliver(completion),
        None => Ok(completion.status),
    }
}

/// A request object for a non-blocking operation whose buffers live for `'a`
///
/// # Examples
///
/// See `demos/immediate.rs`
#[must_use]
pub struct Request<'a> {
    pending: Option<Pending<'a>>,
    runtime: Arc<Runtime>,
    error_handler: Arc<dyn ErrorHandler>,
    group: GroupId,
    participant: ParticipantId,
}

impl<'a> fmt::Debug for Request<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Request");
        s.field("group", &self.group);
        match self.pending {
            Some(Pending::Transfer { handle, .. }) => s.field("handle", &handle),
            Some(Pending::Barrier { epoch }) => s.field("barrier_epoch", &epoch),
            None => s.field("completed", &true),
        };
        s.finish()
    }
}

impl<'a> Request<'a> {
    fn new(comm: &SimpleCommunicator, pending: Pending<'a>) -> Request<'a> {
        Request {
            pending: Some(pending),
            runtime: Arc::clone(comm.runtime()),
            error_handler: Arc::clone(comm.error_handler()),
            group: comm.group().id(),
            participant: comm.participant(),
        }
    }

    pub(crate) fn send(comm: &SimpleCommunicator, handle: Handle) -> Request<'static> {
        Request::new(comm, Pending::Transfer { handle, sink: None })
    }

    pub(crate) fn receive<T: Equivalence>(
        comm: &SimpleCommunicator,
        handle: Handle,
        buf: &'a mut [T],
    ) -> Request<'a> {
        Request::new(
            comm,
            Pending::Transfer {
                handle,
                sink: Some(Box::new(SliceSink(buf))),
            },
        )
    }

    pub(crate) fn barrier(comm: &SimpleCommunicator, epoch: u64) -> Request<'static> {
        Request::new(comm, Pending::Barrier { epoch })
    }

    fn checked<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        error::report(
            &*self.error_handler,
            operation,
            self.group,
            self.participant,
            result,
        )
    }

    /// The matcher handle of a point to point request
    pub fn handle(&self) -> Option<Handle> {
        match self.pending {
            Some(Pending::Transfer { handle, .. }) => Some(handle),
            _ => None,
        }
    }

    /// Wait for an operation to finish.
    ///
    /// Will block execution of the calling thread until the associated operation has finished.
    /// The status of a receive describes the message; a receive that truncated its message
    /// returns `Error::Truncation` after filling its buffer.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn wait(mut self) -> Result<Status> {
        let result = match self.pending.take() {
            Some(Pending::Transfer { handle, sink }) => self
                .runtime
                .matcher
                .wait(handle)
                .and_then(|completion| finish(completion, sink)),
            Some(Pending::Barrier { epoch }) => self
                .runtime
                .coordinator
                .wait_released(self.group, epoch)
                .map(|()| Status::empty()),
            None => Ok(Status::empty()),
        };
        self.checked("wait", result)
    }

    /// Test whether an operation has finished.
    ///
    /// If the operation has finished, its result is returned. Otherwise returns the unfinished
    /// `Request`.
    ///
    /// # Examples
    ///
    /// See `demos/immediate.rs`
    pub fn test(self) -> std::result::Result<Result<Status>, Self> {
        self.poll("test", |runtime, group, pending| match *pending {
            Pending::Transfer { handle, .. } => runtime.matcher.test(handle),
            Pending::Barrier { epoch } => runtime
                .coordinator
                .is_released(group, epoch)
                .map(|released| released.then(released_barrier)),
        })
    }

    /// Wait for an operation to finish, but at most for `timeout`.
    ///
    /// Returns the unfinished `Request` if the timeout expires first. The operation stays posted
    /// in that case.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<Status>, Self> {
        self.poll("wait_timeout", |runtime, group, pending| match *pending {
            Pending::Transfer { handle, .. } => runtime.matcher.wait_timeout(handle, timeout),
            Pending::Barrier { epoch } => runtime
                .coordinator
                .wait_released_timeout(group, epoch, timeout)
                .map(|released| released.then(released_barrier)),
        })
    }

    fn poll<F>(mut self, operation: &'static str, f: F) -> std::result::Result<Result<Status>, Self>
    where
        F: FnOnce(&Runtime, GroupId, &Pending<'a>) -> Result<Option<Completion>>,
    {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(Ok(Status::empty())),
        };
        match f(&self.runtime, self.group, &pending) {
            Ok(None) => {
                self.pending = Some(pending);
                Err(self)
            }
            Ok(Some(completion)) => {
                let result = match pending {
                    Pending::Transfer { sink, .. } => finish(completion, sink),
                    Pending::Barrier { .. } => Ok(completion.status),
                };
                Ok(self.checked(operation, result))
            }
            Err(e) => Ok(self.checked(operation, Err(e))),
        }
    }

    /// Initiate cancellation of the request.
    ///
    /// Only operations that have not been matched yet can be cancelled; otherwise this fails
    /// with `AlreadyMatched`. A cancelled request still has to be completed, its `Status`
    /// reports `is_cancelled()`.
    pub fn cancel(&self) -> Result<()> {
        let result = match self.pending {
            Some(Pending::Transfer { handle, .. }) => self.runtime.matcher.cancel(handle),
            Some(Pending::Barrier { .. }) => Err(Error::NotCancellable("barrier")),
            None => Ok(()),
        };
        self.checked("cancel", result)
    }

    /// Cancels a still unmatched transfer without reporting to the error handler.
    fn cancel_unmatched(&self) {
        if let Some(Pending::Transfer { handle, .. }) = self.pending {
            // matched operations are waited for regularly
            let _ = self.runtime.matcher.cancel(handle);
        }
    }
}

impl<'a> Drop for Request<'a> {
    fn drop(&mut self) {
        if let Some(Pending::Transfer { handle, .. }) = self.pending.take() {
            self.runtime.matcher.discard(handle);
        }
    }
}

/// Wait for all requests to finish.
///
/// All requests are completed, even if some of them fail. Returns the statuses in request order
/// or the first error.
pub fn wait_all<'a, I>(requests: I) -> Result<Vec<Status>>
where
    I: IntoIterator<Item = Request<'a>>,
{
    let mut first_error = None;
    let mut statuses = Vec::new();
    for request in requests {
        match request.wait() {
            Ok(status) => statuses.push(status),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(statuses),
    }
}

/// Guard object that waits for the completion of an operation when it is dropped
///
/// The guard can be constructed from or deconstructed into a `Request`. Errors surfacing when
/// the guard is dropped are logged.
///
/// # Examples
///
/// See `demos/immediate.rs`
#[derive(Debug)]
pub struct WaitGuard<'a>(Option<Request<'a>>);

impl<'a> Drop for WaitGuard<'a> {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            if let Err(e) = request.wait() {
                warn!(error = %e, "request completed by guard failed");
            }
        }
    }
}

impl<'a> From<WaitGuard<'a>> for Request<'a> {
    fn from(mut guard: WaitGuard<'a>) -> Self {
        match guard.0.take() {
            Some(request) => request,
            None => unreachable!("wait guard without request"),
        }
    }
}

impl<'a> From<Request<'a>> for WaitGuard<'a> {
    fn from(req: Request<'a>) -> Self {
        WaitGuard(Some(req))
    }
}

/// Guard object that tries to cancel and waits for the completion of an operation when it is
/// dropped
///
/// The guard can be constructed from or deconstructed into a `Request`.
#[derive(Debug)]
pub struct CancelGuard<'a>(Option<Request<'a>>);

impl<'a> Drop for CancelGuard<'a> {
    fn drop(&mut self) {
        if let Some(request) = self.0.take() {
            request.cancel_unmatched();
            if let Err(e) = request.wait() {
                warn!(error = %e, "request completed by guard failed");
            }
        }
    }
}

impl<'a> From<CancelGuard<'a>> for Request<'a> {
    fn from(mut guard: CancelGuard<'a>) -> Self {
        match guard.0.take() {
            Some(request) => request,
            None => unreachable!("cancel guard without request"),
        }
    }
}

impl<'a> From<Request<'a>> for CancelGuard<'a> {
    fn from(req: Request<'a>) -> Self {
        CancelGuard(Some(req))
    }
}
