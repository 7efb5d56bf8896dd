use std::fmt;

use bytes::Bytes;

/// Wire tag preceding every encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Bool = 1,
    Null = 2,
    Int32 = 3,
    Float64 = 4,
    String = 5,
    Bytes = 6,
    List = 7,
    Map = 8,
}

impl Tag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::Bool,
            2 => Self::Null,
            3 => Self::Int32,
            4 => Self::Float64,
            5 => Self::String,
            6 => Self::Bytes,
            7 => Self::List,
            8 => Self::Map,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Null => "null",
            Self::Int32 => "int32",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

/// One value exchanged over the wire.
///
/// Maps keep their entries in wire order. Keys are values too, conventionally
/// strings; [`Value::get`] looks entries up by string key.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    Bool(bool),
    #[default]
    Null,
    Int32(i32),
    Float64(f64),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Pick the compact wire form for a number.
    ///
    /// Exact integers in `i32` range become [`Value::Int32`]; everything else,
    /// including `-0.0`, NaN and infinities, stays [`Value::Float64`].
    pub fn number(n: f64) -> Self {
        let is_exact_i32 = n.fract() == 0.0
            && n >= i32::MIN as f64
            && n <= i32::MAX as f64
            && !(n == 0.0 && n.is_sign_negative());
        if is_exact_i32 {
            Self::Int32(n as i32)
        } else {
            Self::Float64(n)
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            Self::Bool(_) => Tag::Bool,
            Self::Null => Tag::Null,
            Self::Int32(_) => Tag::Int32,
            Self::Float64(_) => Tag::Float64,
            Self::String(_) => Tag::String,
            Self::Bytes(_) => Tag::Bytes,
            Self::List(_) => Tag::List,
            Self::Map(_) => Tag::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value of either number form.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a map entry by string key. Returns `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => f.write_str("null"),
            Self::Int32(n) => write!(f, "{n}"),
            Self::Float64(n) => write!(f, "{n:?}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int32(n)
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Self::Int32(i32::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        match i32::try_from(n) {
            Ok(small) => Self::Int32(small),
            Err(_) => Self::Float64(n as f64),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}
