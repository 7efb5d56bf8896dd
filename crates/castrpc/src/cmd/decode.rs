use castrpc_codec::{Message, RawMessage};

use crate::cmd::DecodeArgs;
use crate::exit::{codec_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let wire = parse_hex(&args.hex)?;
    let raw = RawMessage::parse(&wire).map_err(|err| codec_error("decode failed", err))?;
    let code = raw.code;
    let message = Message::classify(raw, args.side.into());
    print_message(&message, code, format);
    Ok(SUCCESS)
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact
        .strip_prefix("0x")
        .unwrap_or(&compact)
        .to_string();
    hex::decode(&compact).map_err(|err| CliError::new(DATA_INVALID, format!("invalid hex: {err}")))
}
