use bytes::Bytes;
use castrpc_transport::endpoint::BoxedWriter;
use castrpc_transport::{EnvelopeCodec, TransportError};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn the task that moves queued messages onto the wire.
///
/// The task ends when every queue sender is gone, or when `shutdown` fires;
/// in the latter case messages already queued are still written. The write
/// half is shut down on the way out. `on_error` runs if the stream fails.
pub(crate) fn spawn_writer<F>(
    writer: BoxedWriter,
    codec: EnvelopeCodec,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    shutdown: CancellationToken,
    on_error: F,
) -> JoinHandle<()>
where
    F: FnOnce(TransportError) + Send + 'static,
{
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, codec);
        let mut written = 0usize;

        let result = loop {
            tokio::select! {
                message = queue.recv() => match message {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            break Err(err);
                        }
                        written += 1;
                    }
                    None => break Ok(()),
                },
                () = shutdown.cancelled() => break drain(&mut sink, &mut queue, &mut written).await,
            }
        };

        match result.and(sink.close().await) {
            Ok(()) => debug!(written, "writer finished"),
            Err(err) => {
                warn!(error = %err, written, "writer failed");
                on_error(err);
            }
        }
    })
}

async fn drain(
    sink: &mut FramedWrite<BoxedWriter, EnvelopeCodec>,
    queue: &mut mpsc::UnboundedReceiver<Bytes>,
    written: &mut usize,
) -> Result<(), TransportError> {
    queue.close();
    while let Ok(message) = queue.try_recv() {
        sink.feed(message).await?;
        *written += 1;
    }
    Ok(())
}
