use std::fmt;
use std::sync::Arc;

/// Where a multiplexer is in its single pass from connecting to closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Open,
    /// Terminal. A new multiplexer is built for every reconnect.
    Closed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Components that come and go with the connection.
///
/// `opened` fires once when the channel opens, `closed` once when it closes
/// or fails. Both run outside the multiplexer's state update, so they may
/// issue calls.
pub trait LifecycleObserver: Send + Sync {
    fn opened(&self) {}
    fn closed(&self, _reason: &str) {}
}

/// A lifecycle change that happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Opened,
    Closed { reason: String },
}

/// The observable result of a lifecycle transition.
///
/// State has already changed when this is returned; [`Transition::deliver`]
/// informs the observers.
#[must_use = "observers only hear about the transition once it is delivered"]
pub struct Transition {
    event: Option<LifecycleEvent>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl Transition {
    pub(crate) fn none() -> Self {
        Self {
            event: None,
            observers: Vec::new(),
        }
    }

    pub(crate) fn new(event: LifecycleEvent, observers: Vec<Arc<dyn LifecycleObserver>>) -> Self {
        Self {
            event: Some(event),
            observers,
        }
    }

    /// `None` when the event did not change the state (e.g. a second close).
    pub fn event(&self) -> Option<&LifecycleEvent> {
        self.event.as_ref()
    }

    pub fn deliver(self) {
        match &self.event {
            Some(LifecycleEvent::Opened) => {
                for observer in &self.observers {
                    observer.opened();
                }
            }
            Some(LifecycleEvent::Closed { reason }) => {
                for observer in &self.observers {
                    observer.closed(reason);
                }
            }
            None => {}
        }
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("event", &self.event)
            .field("observers", &self.observers.len())
            .finish()
    }
}
