use castrpc_codec::Value;
use castrpc_peer::{Session, SessionConfig};
use tokio::sync::mpsc;
use tracing::info;

use crate::cmd::{block_on, parse_duration, ListenArgs};
use crate::convert::parse_args;
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_notification, print_reply, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let join_args = match args.call {
        Some(_) => parse_args(Some(args.call_args.as_deref().unwrap_or("[]")), &[])?,
        None => Vec::new(),
    };
    let config = SessionConfig {
        connect_timeout: timeout,
        call_timeout: timeout,
        ..SessionConfig::default()
    };

    block_on(listen(args, join_args, config, format))?
}

async fn listen(
    args: ListenArgs,
    join_args: Vec<Value>,
    config: SessionConfig,
    format: OutputFormat,
) -> CliResult<i32> {
    let session = Session::connect(&args.endpoint, config)
        .await
        .map_err(|err| peer_error("connect failed", err))?;
    let peer = session.peer().to_string();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<(u16, Vec<Value>)>();
    for &event in &args.events {
        let events_tx = events_tx.clone();
        session.on_notification(event, move |values| {
            let _ = events_tx.send((event, values.to_vec()));
        });
    }
    drop(events_tx);
    info!(events = ?args.events, "subscribed");

    if let Some(code) = args.call {
        match session.request(code, join_args).await {
            Ok(reply) => print_reply(code, true, &reply, &peer, format),
            Err(err) => return Err(peer_error("call failed", err)),
        }
    }

    let mut printed = 0usize;
    loop {
        tokio::select! {
            received = events_rx.recv() => {
                let Some((event, values)) = received else {
                    return Ok(SUCCESS);
                };
                print_notification(event, &values, &peer, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    session.close().await;
                    return Ok(SUCCESS);
                }
            }
            reason = session.closed() => {
                // Notifications routed just before the close are still printed.
                while let Ok((event, values)) = events_rx.try_recv() {
                    print_notification(event, &values, &peer, format);
                    printed = printed.saturating_add(1);
                }
                if args.count.is_some_and(|count| printed < count) {
                    return Err(CliError::new(
                        FAILURE,
                        format!("connection closed after {printed} notifications: {reason}"),
                    ));
                }
                return Ok(SUCCESS);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                session.close().await;
                return Ok(SUCCESS);
            }
        }
    }
}
