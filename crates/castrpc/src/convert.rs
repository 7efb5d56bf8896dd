//! JSON text on the command line, [`Value`]s on the wire.
//!
//! Numbers go through [`Value::number`], so `42` travels as Int32 and `0.5`
//! as Float64. Objects become string-keyed maps. Byte strings have no JSON
//! form of their own and are written as `{"$bytes": "<hex>"}`.

use castrpc_codec::Value;
use serde_json::{Map, Number};

use crate::exit::{CliError, CliResult};

pub const BYTES_KEY: &str = "$bytes";

pub fn json_to_value(json: &serde_json::Value) -> CliResult<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(int) => Value::from(int),
            None => Value::number(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::List(
            items
                .iter()
                .map(json_to_value)
                .collect::<CliResult<Vec<_>>>()?,
        ),
        serde_json::Value::Object(entries) => {
            if let Some(bytes) = bytes_literal(entries)? {
                return Ok(Value::from(bytes));
            }
            Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((Value::from(k.as_str()), json_to_value(v)?)))
                    .collect::<CliResult<Vec<_>>>()?,
            )
        }
    })
}

fn bytes_literal(entries: &Map<String, serde_json::Value>) -> CliResult<Option<Vec<u8>>> {
    if entries.len() != 1 {
        return Ok(None);
    }
    let Some(serde_json::Value::String(encoded)) = entries.get(BYTES_KEY) else {
        return Ok(None);
    };
    hex::decode(encoded)
        .map(Some)
        .map_err(|err| CliError::usage(format!("invalid {BYTES_KEY} hex: {err}")))
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int32(n) => serde_json::Value::from(*n),
        Value::Float64(n) => match Number::from_f64(*n) {
            Some(number) => serde_json::Value::Number(number),
            // JSON has no NaN or infinity.
            None => serde_json::Value::String(n.to_string()),
        },
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => {
            let mut map = Map::new();
            map.insert(BYTES_KEY.to_string(), hex::encode(b).into());
            serde_json::Value::Object(map)
        }
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => {
            let mut map = Map::new();
            for (key, val) in entries {
                let key = match key.as_str() {
                    Some(s) => s.to_string(),
                    None => key.to_string(),
                };
                map.insert(key, value_to_json(val));
            }
            serde_json::Value::Object(map)
        }
    }
}

/// Parse call arguments: either one JSON array, or one JSON value per `--arg`.
pub fn parse_args(array: Option<&str>, each: &[String]) -> CliResult<Vec<Value>> {
    if let Some(array) = array {
        let json: serde_json::Value = serde_json::from_str(array)
            .map_err(|err| CliError::usage(format!("--args is not valid JSON: {err}")))?;
        let serde_json::Value::Array(items) = json else {
            return Err(CliError::usage("--args must be a JSON array"));
        };
        return items.iter().map(json_to_value).collect();
    }

    each.iter()
        .map(|raw| {
            let json: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
                CliError::usage(format!("--arg {raw:?} is not valid JSON: {err}"))
            })?;
            json_to_value(&json)
        })
        .collect()
}

pub fn values_to_json(values: &[Value]) -> Vec<serde_json::Value> {
    values.iter().map(value_to_json).collect()
}
