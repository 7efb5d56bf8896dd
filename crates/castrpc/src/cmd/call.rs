use castrpc_codec::Value;
use castrpc_peer::{PeerError, Session, SessionConfig};
use tracing::debug;

use crate::cmd::{block_on, parse_duration, CallArgs};
use crate::convert::parse_args;
use crate::exit::{peer_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args = parse_args(args.args.as_deref(), &args.arg)?;
    let config = SessionConfig {
        connect_timeout: timeout,
        call_timeout: timeout,
        ..SessionConfig::default()
    };

    block_on(call(args, call_args, config, format))?
}

async fn call(
    args: CallArgs,
    call_args: Vec<Value>,
    config: SessionConfig,
    format: OutputFormat,
) -> CliResult<i32> {
    let session = Session::connect(&args.endpoint, config)
        .await
        .map_err(|err| peer_error("connect failed", err))?;
    debug!(code = args.code, args = call_args.len(), "calling");

    let outcome = session.request(args.code, call_args).await;
    let peer = session.peer().to_string();
    session.close().await;

    match outcome {
        Ok(reply) => {
            print_reply(args.code, true, &reply, &peer, format);
            Ok(SUCCESS)
        }
        Err(PeerError::Remote(payload)) => {
            print_reply(args.code, false, &[payload], &peer, format);
            Ok(FAILURE)
        }
        Err(err) => Err(peer_error("call failed", err)),
    }
}
