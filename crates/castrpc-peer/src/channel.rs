use bytes::Bytes;
use castrpc_transport::TransportError;
use tokio::sync::mpsc;

/// Outbound half of a message-oriented duplex channel.
///
/// Each call to [`Channel::send`] hands over one whole message. Delivery of
/// inbound messages is the host's job: it feeds them to the multiplexer.
pub trait Channel {
    fn send(&mut self, message: Bytes) -> Result<(), TransportError>;
}

/// Queue-backed channel; a writer task drains the receiver onto the wire.
impl Channel for mpsc::UnboundedSender<Bytes> {
    fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| TransportError::Closed)
    }
}
