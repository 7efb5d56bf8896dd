use castrpc_codec::Value;
use castrpc_peer::{Responder, ResponderConfig, ServeSummary};
use castrpc_transport::{Connection, Listener};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmd::{block_on, ServeArgs};
use crate::exit::{transport_error, CliResult, SUCCESS};
use crate::output::{print_summary, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    block_on(serve(args, format))?
}

async fn serve(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = Listener::bind(&args.endpoint)
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    info!(endpoint = %listener.endpoint(), "echo responder ready");

    let mut served = 0usize;
    loop {
        let connection = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|err| transport_error("accept failed", err))?
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(SUCCESS);
            }
        };
        let peer = connection.peer().to_string();

        tokio::select! {
            result = serve_one(connection, args.notify_code, args.fail_code) => match result {
                Ok(summary) => print_summary(&summary, &peer, format),
                Err(err) => warn!(%peer, error = %err, "connection ended with error"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(SUCCESS);
            }
        }

        served += 1;
        if args.count.is_some_and(|count| served >= count) {
            return Ok(SUCCESS);
        }
    }
}

/// Echo every call back to its caller until the client hangs up.
async fn serve_one(
    connection: Connection,
    notify_code: Option<u16>,
    fail_code: Option<u16>,
) -> castrpc_peer::Result<ServeSummary> {
    let (echoed_tx, mut echoed_rx) = mpsc::unbounded_channel::<Vec<Value>>();
    let dispatcher = move |method: u16, args: Vec<Value>| -> Result<Vec<Value>, Value> {
        if fail_code == Some(method) {
            return Err(args.into_iter().next().unwrap_or(Value::Null));
        }
        if notify_code.is_some() {
            let _ = echoed_tx.send(args.clone());
        }
        Ok(args)
    };

    let responder = Responder::start(connection, dispatcher, ResponderConfig::default());

    // Runs after the dispatcher returns, so each notification trails its reply.
    if let Some(event) = notify_code {
        let notifier = responder.notifier();
        tokio::spawn(async move {
            while let Some(args) = echoed_rx.recv().await {
                if let Err(err) = notifier.notify(event, args) {
                    warn!(event, error = %err, "notification dropped");
                    break;
                }
            }
        });
    }

    responder.join().await
}
