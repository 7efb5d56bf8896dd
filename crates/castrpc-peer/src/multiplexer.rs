use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use castrpc_codec::{CodecConfig, CodecError, Message, RawMessage, Side, Value, CALL_ID_SPACE};
use castrpc_transport::{TransportError, DEFAULT_MAX_MESSAGE};
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::error::{PeerError, Result};
use crate::lifecycle::{LifecycleEvent, LifecycleObserver, LifecycleState, Transition};
use crate::reply::{PendingReply, ReplySender};

/// Callback for one notification event; receives the notification's arguments.
pub type NotificationHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// What happened to one inbound frame.
///
/// Pending calls are settled during routing. A notification handler is
/// carried out in [`Dispatch::Notification`] and only runs on
/// [`Dispatch::deliver`], so hosts can release their locks first.
#[must_use = "notification handlers only run when the dispatch is delivered"]
pub enum Dispatch {
    /// A pending call was settled.
    Completed { id: u16, ok: bool },
    /// A reply for an id that is not pending; dropped.
    Unmatched { id: u16 },
    /// A notification with a registered handler.
    Notification {
        event: u16,
        handler: NotificationHandler,
        args: Vec<Value>,
    },
    /// A notification nobody listens for; dropped.
    Unhandled { event: u16 },
    /// The frame did not parse; dropped.
    Malformed(CodecError),
    /// The multiplexer is closed; the frame was ignored.
    Ignored,
}

impl Dispatch {
    pub fn deliver(self) {
        if let Self::Notification { handler, args, .. } = self {
            handler(&args);
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { id, ok } => f
                .debug_struct("Completed")
                .field("id", id)
                .field("ok", ok)
                .finish(),
            Self::Unmatched { id } => f.debug_struct("Unmatched").field("id", id).finish(),
            Self::Notification { event, args, .. } => f
                .debug_struct("Notification")
                .field("event", event)
                .field("args", args)
                .finish_non_exhaustive(),
            Self::Unhandled { event } => f.debug_struct("Unhandled").field("event", event).finish(),
            Self::Malformed(err) => f.debug_tuple("Malformed").field(err).finish(),
            Self::Ignored => f.write_str("Ignored"),
        }
    }
}

/// Client-side call multiplexer over one channel.
///
/// Owns the channel's outbound half, the pending-call table and the
/// notification handler table. It is driven entirely by the host:
/// [`handle_open`](Self::handle_open), [`handle_message`](Self::handle_message),
/// [`handle_close`](Self::handle_close) and [`handle_error`](Self::handle_error).
///
/// Call ids cycle through `0..0x8000`. An id is never handed out while a call
/// under it is still pending; reuse after wraparound assumes replies arrive
/// well before 32768 further calls are made.
pub struct Multiplexer<C> {
    channel: C,
    state: LifecycleState,
    next_id: u16,
    pending: HashMap<u16, ReplySender>,
    handlers: HashMap<u16, NotificationHandler>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    codec: CodecConfig,
    max_message: usize,
}

impl<C: Channel> Multiplexer<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            state: LifecycleState::Connecting,
            next_id: 0,
            pending: HashMap::new(),
            handlers: HashMap::new(),
            observers: Vec::new(),
            codec: CodecConfig::default(),
            max_message: DEFAULT_MAX_MESSAGE,
        }
    }

    /// Override decoding limits for inbound frames.
    pub fn with_codec_config(mut self, config: CodecConfig) -> Self {
        self.codec = config;
        self
    }

    /// Refuse outbound calls whose encoded size exceeds `max_message`.
    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids of calls awaiting a reply, ascending.
    pub fn pending_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_handler(&self, event: u16) -> bool {
        self.handlers.contains_key(&event)
    }

    #[cfg(test)]
    pub(crate) fn channel(&self) -> &C {
        &self.channel
    }

    /// Send a call and return its reply future immediately.
    ///
    /// Fails synchronously if the multiplexer is closed, the arguments cannot
    /// be encoded, the channel rejects the message, or every id is in flight.
    pub fn call(&mut self, code: u16, args: Vec<Value>) -> Result<PendingReply> {
        if self.state == LifecycleState::Closed {
            return Err(PeerError::Closed);
        }

        let id = self.allocate_id()?;
        let message = RawMessage::new(id, code, args).serialize()?;
        if message.len() > self.max_message {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max: self.max_message,
            }
            .into());
        }
        self.channel.send(message)?;

        let (tx, reply) = PendingReply::channel(id);
        self.pending.insert(id, tx);
        debug!(id, code, pending = self.pending.len(), "call sent");
        Ok(reply)
    }

    /// Stop waiting for the call with `id`. A reply arriving later is dropped
    /// as unmatched. Returns whether the call was still pending.
    pub fn cancel(&mut self, id: u16) -> bool {
        let cancelled = self.pending.remove(&id).is_some();
        if cancelled {
            debug!(id, "call cancelled");
        }
        cancelled
    }

    fn allocate_id(&mut self) -> Result<u16> {
        let capacity = usize::from(CALL_ID_SPACE);
        if self.pending.len() >= capacity {
            // Callers that dropped their reply futures no longer need their ids.
            self.pending.retain(|_, tx| !tx.is_closed());
            if self.pending.len() >= capacity {
                return Err(PeerError::IdsExhausted(capacity));
            }
        }

        let mut id = self.next_id;
        while self.pending.contains_key(&id) {
            id = (id + 1) % CALL_ID_SPACE;
        }
        self.next_id = (id + 1) % CALL_ID_SPACE;
        Ok(id)
    }

    /// Register or, with `None`, remove the handler for a notification event.
    ///
    /// At most one handler exists per event; the replaced one is returned.
    pub fn notify(
        &mut self,
        event: u16,
        handler: Option<NotificationHandler>,
    ) -> Option<NotificationHandler> {
        match handler {
            Some(handler) => self.handlers.insert(event, handler),
            None => self.handlers.remove(&event),
        }
    }

    pub fn on_notification<F>(&mut self, event: u16, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers.insert(event, Arc::new(handler));
    }

    /// Returns whether a handler was registered.
    pub fn clear_notification(&mut self, event: u16) -> bool {
        self.handlers.remove(&event).is_some()
    }

    pub fn observe(&mut self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.push(observer);
    }

    /// Mark the channel open. Only the first open from `Connecting` counts.
    pub fn open(&mut self) -> Transition {
        if self.state != LifecycleState::Connecting {
            return Transition::none();
        }
        self.state = LifecycleState::Open;
        info!("channel open");
        Transition::new(LifecycleEvent::Opened, self.observers.clone())
    }

    /// Mark the channel closed and reject every pending call.
    ///
    /// Handlers stay registered but never fire again.
    pub fn close(&mut self, reason: impl Into<String>) -> Transition {
        if self.state == LifecycleState::Closed {
            return Transition::none();
        }
        let reason = reason.into();
        self.state = LifecycleState::Closed;

        let rejected = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(PeerError::ConnectionClosed(reason.clone())));
        }

        info!(%reason, rejected, "channel closed");
        Transition::new(LifecycleEvent::Closed { reason }, self.observers.clone())
    }

    /// Route one inbound frame without running notification handlers.
    pub fn route(&mut self, frame: &[u8]) -> Dispatch {
        if self.state == LifecycleState::Closed {
            trace!(len = frame.len(), "ignoring frame after close");
            return Dispatch::Ignored;
        }

        let raw = match RawMessage::parse_with_config(frame, &self.codec) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, len = frame.len(), "dropping malformed frame");
                return Dispatch::Malformed(err);
            }
        };

        match Message::classify(raw, Side::Client) {
            Message::Notification { event, args } => match self.handlers.get(&event) {
                Some(handler) => Dispatch::Notification {
                    event,
                    handler: Arc::clone(handler),
                    args,
                },
                None => {
                    trace!(event, "no handler for notification");
                    Dispatch::Unhandled { event }
                }
            },
            Message::Response { id, ok, args } => self.settle(id, ok, args),
            Message::Request { id, .. } => Dispatch::Unmatched { id },
        }
    }

    fn settle(&mut self, id: u16, ok: bool, args: Vec<Value>) -> Dispatch {
        let Some(tx) = self.pending.remove(&id) else {
            debug!(id, "dropping reply for unknown call id");
            return Dispatch::Unmatched { id };
        };

        let outcome = if ok {
            Ok(args)
        } else {
            Err(PeerError::Remote(
                args.into_iter().next().unwrap_or(Value::Null),
            ))
        };
        if tx.send(outcome).is_err() {
            debug!(id, "caller dropped reply before it arrived");
        }
        debug!(id, ok, "call settled");
        Dispatch::Completed { id, ok }
    }

    pub fn handle_open(&mut self) {
        self.open().deliver();
    }

    pub fn handle_message(&mut self, frame: &[u8]) {
        self.route(frame).deliver();
    }

    pub fn handle_close(&mut self, reason: impl Into<String>) {
        self.close(reason).deliver();
    }

    pub fn handle_error(&mut self, err: impl fmt::Display) {
        self.close(format!("transport error: {err}")).deliver();
    }
}

impl<C> Drop for Multiplexer<C> {
    fn drop(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(PeerError::ConnectionClosed(
                "multiplexer dropped".to_string(),
            )));
        }
    }
}

impl<C> fmt::Debug for Multiplexer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &self.state)
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.len())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}
