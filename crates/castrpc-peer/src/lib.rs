//! Call multiplexing over a single castrpc channel.
//!
//! The [`Multiplexer`] is the protocol core: it assigns call ids, tracks
//! pending calls until their replies arrive, and routes unsolicited
//! notifications to registered handlers. It performs no I/O of its own; the
//! host feeds it channel events. [`Session`] is that host for async clients,
//! and [`Responder`] is the matching server side.

pub mod channel;
pub mod error;
pub mod lifecycle;
pub mod multiplexer;
pub mod reply;
pub mod responder;
pub mod session;
mod writer;

pub use channel::Channel;
pub use error::{PeerError, Result};
pub use lifecycle::{LifecycleEvent, LifecycleObserver, LifecycleState, Transition};
pub use multiplexer::{Dispatch, Multiplexer, NotificationHandler};
pub use reply::PendingReply;
pub use responder::{Dispatcher, Notifier, Responder, ResponderConfig, ServeSummary};
pub use session::{Session, SessionConfig};
