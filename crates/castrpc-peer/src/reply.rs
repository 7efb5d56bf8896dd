use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use castrpc_codec::Value;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{PeerError, Result};

pub(crate) type ReplySender = oneshot::Sender<Result<Vec<Value>>>;

/// The eventual outcome of one call.
///
/// Resolves to the response arguments, or to the failure payload
/// ([`PeerError::Remote`]), or to [`PeerError::ConnectionClosed`] if the
/// channel goes away first. Dropping it abandons interest in the reply; a
/// late reply is then discarded.
#[derive(Debug)]
pub struct PendingReply {
    id: u16,
    rx: oneshot::Receiver<Result<Vec<Value>>>,
}

impl PendingReply {
    pub(crate) fn channel(id: u16) -> (ReplySender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    /// Call id this reply is correlated by.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Take the outcome without waiting, if it has been settled.
    pub fn try_take(&mut self) -> Option<Result<Vec<Value>>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(PeerError::Abandoned)),
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Vec<Value>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PeerError::Abandoned)))
    }
}
