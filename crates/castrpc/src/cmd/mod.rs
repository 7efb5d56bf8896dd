use std::future::Future;
use std::time::Duration;

use castrpc_transport::Endpoint;
use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod call;
pub mod decode;
pub mod encode;
pub mod listen;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Make one call and print its reply.
    Call(CallArgs),
    /// Subscribe to notifications and print them as they arrive.
    Listen(ListenArgs),
    /// Run an echo responder.
    Serve(ServeArgs),
    /// Encode one message and print its wire form as hex.
    Encode(EncodeArgs),
    /// Decode a hex wire message and print it.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Call(args) => call::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Encode(args) => encode::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to connect to (tcp://host:port, unix:///path or a socket path).
    #[arg(env = "CASTRPC_ENDPOINT")]
    pub endpoint: Endpoint,
    /// Method code.
    #[arg(long)]
    pub code: u16,
    /// One argument as JSON; repeat for more.
    #[arg(long = "arg", value_name = "JSON", conflicts_with = "args")]
    pub arg: Vec<String>,
    /// All arguments as one JSON array.
    #[arg(long, value_name = "JSON")]
    pub args: Option<String>,
    /// Connect and reply timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "CASTRPC_TIMEOUT")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Endpoint to connect to.
    #[arg(env = "CASTRPC_ENDPOINT")]
    pub endpoint: Endpoint,
    /// Notification events to subscribe to (comma-separated).
    #[arg(long, value_delimiter = ',', required = true)]
    pub events: Vec<u16>,
    /// Exit after receiving N notifications.
    #[arg(long)]
    pub count: Option<usize>,
    /// Call to make once subscribed, e.g. to join a room.
    #[arg(long, value_name = "CODE")]
    pub call: Option<u16>,
    /// Arguments for --call as one JSON array.
    #[arg(long, value_name = "JSON", requires = "call")]
    pub call_args: Option<String>,
    /// Connect timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s", env = "CASTRPC_TIMEOUT")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind.
    #[arg(env = "CASTRPC_ENDPOINT")]
    pub endpoint: Endpoint,
    /// After each reply, push the echoed arguments as this notification event.
    #[arg(long, value_name = "EVENT")]
    pub notify_code: Option<u16>,
    /// Calls to this method fail with their first argument as payload.
    #[arg(long, value_name = "CODE")]
    pub fail_code: Option<u16>,
    /// Exit after serving N connections.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Call id; ignored with --notification.
    #[arg(long, default_value = "0")]
    pub id: u16,
    /// Method, response or event code.
    #[arg(long)]
    pub code: u16,
    /// Arguments as one JSON array.
    #[arg(long, value_name = "JSON", default_value = "[]")]
    pub args: String,
    /// Encode as a notification (id 0xFFFF).
    #[arg(long)]
    pub notification: bool,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex-encoded message (whitespace is ignored).
    pub hex: String,
    /// Which side is reading the message.
    #[arg(long, value_enum, default_value = "client")]
    pub side: SideArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SideArg {
    Client,
    Server,
}

impl From<SideArg> for castrpc_codec::Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Client => Self::Client,
            SideArg::Server => Self::Server,
        }
    }
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Run a command body on a single-threaded runtime.
pub(crate) fn block_on<F: Future>(future: F) -> CliResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))?;
    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }
}
