//! Common types used across sessions, registries and events

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an interpreter session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a script value registered with a session.
///
/// A handle pairs a slot index with the generation stamped on the slot when
/// the value was registered. Generations come from a per-table counter that
/// only moves forward, so the raw form (`generation << 32 | index`) strictly
/// increases and a released handle is never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    generation: u32,
    index: u32,
}

impl Handle {
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { generation, index }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            generation: (raw >> 32) as u32,
            index: raw as u32,
        }
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.generation)
    }
}

/// Which execution limit tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Instructions,
    WallTime,
    Memory,
    /// The host asked the running script to stop
    Cancelled,
    /// A configured environment probe reported an untrusted context
    HostileEnvironment,
}

impl LimitKind {
    /// Stable reason code reported to hosts
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Instructions => "instructions",
            Self::WallTime => "wall_time",
            Self::Memory => "memory",
            Self::Cancelled => "cancelled",
            Self::HostileEnvironment => "hostile_environment",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Host-side copy of a value produced by a script.
///
/// Strings are kept as bytes because scripts may carry binary payloads.
/// Values with no host representation (functions, userdata, threads) are
/// reported by type name only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(Vec<u8>),
    Table(Vec<(ScriptValue, ScriptValue)>),
    Opaque(String),
}

impl ScriptValue {
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Number(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Table(_) => "table",
            Self::Opaque(_) => "opaque",
        }
    }
}

impl std::fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Self::Table(entries) => write!(f, "table({} entries)", entries.len()),
            Self::Opaque(name) => write!(f, "<{name}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_raw_roundtrip_orders_by_generation() {
        let older = Handle::new(7, 1);
        let newer = Handle::new(0, 2);
        assert_eq!(Handle::from_raw(older.to_raw()), older);
        assert!(newer.to_raw() > older.to_raw());
        assert!(newer > older);
    }

    #[test]
    fn script_value_integer_view() {
        assert_eq!(ScriptValue::Integer(2).as_integer(), Some(2));
        assert_eq!(ScriptValue::Number(4.0).as_integer(), Some(4));
        assert_eq!(ScriptValue::Number(4.5).as_integer(), None);
        assert_eq!(ScriptValue::String(b"hi".to_vec()).as_str(), Some("hi"));
    }

    #[test]
    fn script_value_serialization() {
        let value = ScriptValue::Table(vec![(
            ScriptValue::String(b"k".to_vec()),
            ScriptValue::Boolean(true),
        )]);
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("table"));
        let back: ScriptValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
