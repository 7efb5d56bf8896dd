use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use castrpc_codec::{Message, Value};
use castrpc_peer::ServeSummary;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::convert::values_to_json;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    kind: &'static str,
    code: u16,
    ok: bool,
    args: Vec<serde_json::Value>,
    peer: &'a str,
}

#[derive(Serialize)]
struct NotificationOutput<'a> {
    kind: &'static str,
    event: u16,
    args: Vec<serde_json::Value>,
    peer: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct MessageOutput {
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u16>,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    args: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct EncodedOutput {
    kind: &'static str,
    length: usize,
    hex: String,
}

#[derive(Serialize)]
struct SummaryOutput<'a> {
    kind: &'static str,
    peer: &'a str,
    requests: u64,
    failures: u64,
    notifications: u64,
    malformed: u64,
}

/// Print the outcome of one call. `args` is the failure payload alone when `ok` is false.
pub fn print_reply(code: u16, ok: bool, args: &[Value], peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ReplyOutput {
            kind: "reply",
            code,
            ok,
            args: values_to_json(args),
            peer,
        }),
        OutputFormat::Table => print_table(
            vec!["CODE", "OK", "PEER", "ARGS"],
            vec![
                code.to_string(),
                ok.to_string(),
                peer.to_string(),
                args_preview(args),
            ],
        ),
        OutputFormat::Pretty => {
            let status = if ok { "ok" } else { "failed" };
            println!("code={code} {status} peer={peer} args={}", args_preview(args));
        }
    }
}

pub fn print_notification(event: u16, args: &[Value], peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&NotificationOutput {
            kind: "notification",
            event,
            args: values_to_json(args),
            peer,
            timestamp: now_unix_seconds(),
        }),
        OutputFormat::Table => print_table(
            vec!["EVENT", "PEER", "ARGS"],
            vec![event.to_string(), peer.to_string(), args_preview(args)],
        ),
        OutputFormat::Pretty => {
            println!("event={event} peer={peer} args={}", args_preview(args));
        }
    }
}

/// Print a decoded message. `code` is the header code as it was on the wire.
pub fn print_message(message: &Message, code: u16, format: OutputFormat) {
    let (kind, id, ok) = match message {
        Message::Request { id, .. } => ("request", Some(*id), None),
        Message::Response { id, ok, .. } => ("response", Some(*id), Some(*ok)),
        Message::Notification { .. } => ("notification", None, None),
    };
    let args = message.args();

    match format {
        OutputFormat::Json => print_json(&MessageOutput {
            kind,
            id,
            code,
            ok,
            args: values_to_json(args),
        }),
        OutputFormat::Table => {
            let mut table = new_table(vec!["KIND", "ID", "CODE", "TAG", "VALUE"]);
            let id = id.map_or_else(|| "-".to_string(), |id| id.to_string());
            if args.is_empty() {
                table.add_row(vec![
                    kind.to_string(),
                    id.clone(),
                    code.to_string(),
                    String::new(),
                    String::new(),
                ]);
            }
            for arg in args {
                table.add_row(vec![
                    kind.to_string(),
                    id.clone(),
                    code.to_string(),
                    arg.tag().name().to_string(),
                    arg.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let id = id.map_or_else(|| "notify".to_string(), |id| id.to_string());
            println!("{kind} id={id} code={code} args={}", args_preview(args));
        }
    }
}

pub fn print_encoded(wire: &[u8], format: OutputFormat) {
    let hex = hex::encode(wire);
    match format {
        OutputFormat::Json => print_json(&EncodedOutput {
            kind: "encoded",
            length: wire.len(),
            hex,
        }),
        OutputFormat::Table => print_table(
            vec!["LENGTH", "HEX"],
            vec![wire.len().to_string(), hex],
        ),
        OutputFormat::Pretty => println!("{hex}"),
    }
}

pub fn print_summary(summary: &ServeSummary, peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&SummaryOutput {
            kind: "served",
            peer,
            requests: summary.requests,
            failures: summary.failures,
            notifications: summary.notifications,
            malformed: summary.malformed,
        }),
        OutputFormat::Table => print_table(
            vec!["PEER", "REQUESTS", "FAILURES", "NOTIFICATIONS", "MALFORMED"],
            vec![
                peer.to_string(),
                summary.requests.to_string(),
                summary.failures.to_string(),
                summary.notifications.to_string(),
                summary.malformed.to_string(),
            ],
        ),
        OutputFormat::Pretty => println!(
            "served peer={peer} requests={} failures={} malformed={}",
            summary.requests, summary.failures, summary.malformed
        ),
    }
}

fn print_json<T: Serialize>(out: &T) {
    println!(
        "{}",
        serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
    );
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_table(header: Vec<&str>, row: Vec<String>) {
    let mut table = new_table(header);
    table.add_row(row);
    println!("{table}");
}

fn args_preview(args: &[Value]) -> String {
    Value::List(args.to_vec()).to_string()
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
