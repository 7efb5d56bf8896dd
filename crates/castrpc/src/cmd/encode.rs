use castrpc_codec::{RawMessage, NOTIFICATION_ID};

use crate::cmd::EncodeArgs;
use crate::convert::parse_args;
use crate::exit::{codec_error, CliResult, SUCCESS};
use crate::output::{print_encoded, OutputFormat};

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let values = parse_args(Some(&args.args), &[])?;
    let id = if args.notification {
        NOTIFICATION_ID
    } else {
        args.id
    };

    let wire = RawMessage::new(id, args.code, values)
        .serialize()
        .map_err(|err| codec_error("encode failed", err))?;
    print_encoded(&wire, format);
    Ok(SUCCESS)
}
