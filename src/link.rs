//! Facade/worker conversation primitives.
//!
//! The two sides share no mutable state; every exchange flows through the
//! slots defined here. A [`RequestSlot`] pair is a bounded channel of
//! capacity one carrying a request plus its one-shot reply sender, which
//! enforces single-outstanding-request semantics per channel by
//! construction: a second submission while one is pending either waits
//! (directives) or is rejected as busy (commands); requests are never
//! merged, never queued behind more than one.
//!
//! Status reports travel through a `watch` slot (latest report wins, stale
//! reports remain readable), and failures that occur outside any tracked
//! request land in the [`ExceptionSlot`], drained only by the watchdog.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::StewardError;
use crate::message::Response;

/// One in-flight request with its reply path.
pub(crate) struct Request<Q, P> {
    pub payload: Q,
    pub reply: oneshot::Sender<P>,
}

/// Why a submission did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitError {
    /// A request is already outstanding on this channel.
    Busy,
    /// The responding side is gone.
    Gone,
}

/// Requester half of a capacity-one request channel.
pub(crate) struct Requester<Q, P> {
    tx: mpsc::Sender<Request<Q, P>>,
}

impl<Q, P> Clone for Requester<Q, P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Q, P> Requester<Q, P> {
    /// Submit without waiting; fails with [`SubmitError::Busy`] when a
    /// request is already outstanding.
    pub(crate) fn try_submit(&self, payload: Q) -> Result<oneshot::Receiver<P>, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Request { payload, reply })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SubmitError::Busy,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Gone,
            })?;
        Ok(rx)
    }

    /// Submit, deferring until the channel has room.
    pub(crate) async fn submit(&self, payload: Q) -> Result<oneshot::Receiver<P>, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { payload, reply })
            .await
            .map_err(|_| SubmitError::Gone)?;
        Ok(rx)
    }
}

/// Responder half: the worker's receiving end.
pub(crate) type Responder<Q, P> = mpsc::Receiver<Request<Q, P>>;

/// Create a request channel pair with capacity one.
pub(crate) fn request_slot<Q, P>() -> (Requester<Q, P>, Responder<Q, P>) {
    let (tx, rx) = mpsc::channel(1);
    (Requester { tx }, rx)
}

/// One autonomous status poll's outcome.
#[derive(Debug, Clone)]
pub(crate) struct StatusReport {
    pub responses: Vec<Response>,
}

/// Failures with no request to carry them, held for the watchdog.
///
/// Exactly two parties touch this: the worker pushes, the watchdog (or a
/// facade wait that lost its worker mid-request) takes.
#[derive(Default)]
pub(crate) struct ExceptionSlot {
    queue: Mutex<VecDeque<StewardError>>,
}

impl ExceptionSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an untracked failure.
    pub(crate) fn push(&self, err: StewardError) {
        self.queue.lock().push_back(err);
    }

    /// Take the oldest pending failure, if any.
    pub(crate) fn take(&self) -> Option<StewardError> {
        self.queue.lock().pop_front()
    }

    /// Take everything pending.
    pub(crate) fn drain(&self) -> Vec<StewardError> {
        self.queue.lock().drain(..).collect()
    }
}
