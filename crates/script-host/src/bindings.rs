//! Conversions between Lua values and host values, and the helpers native
//! functions use to read arguments and report failures
//!
//! Native functions never raise. A failure returns `nil, message` so the
//! script decides what to do with it.

use std::fmt::Display;

use mlua::{IntoLua, IntoLuaMulti, Lua, MultiValue, Table, Value};
use tether_protocol::ScriptValue;

/// Deepest table nesting copied into a `ScriptValue`
pub const MAX_VALUE_DEPTH: usize = 32;

/// Copy a Lua value into its host representation.
///
/// Tables nested deeper than `MAX_VALUE_DEPTH` (including cycles) are
/// reported as opaque.
pub fn to_script_value(value: &Value) -> ScriptValue {
    convert(value, 0)
}

fn convert(value: &Value, depth: usize) -> ScriptValue {
    match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Boolean(*b),
        Value::Integer(i) => ScriptValue::Integer(*i),
        Value::Number(n) => ScriptValue::Number(*n),
        Value::String(s) => ScriptValue::String(s.as_bytes().to_vec()),
        Value::Table(table) if depth < MAX_VALUE_DEPTH => {
            let entries = table
                .clone()
                .pairs::<Value, Value>()
                .filter_map(Result::ok)
                .map(|(k, v)| (convert(&k, depth + 1), convert(&v, depth + 1)))
                .collect();
            ScriptValue::Table(entries)
        }
        other => ScriptValue::Opaque(other.type_name().to_string()),
    }
}

/// Convert every value of a call result
pub fn to_script_values(values: MultiValue) -> Vec<ScriptValue> {
    values.iter().map(to_script_value).collect()
}

/// Build a Lua value from a host value. Opaque values become `nil`.
pub fn to_lua_value(lua: &Lua, value: &ScriptValue) -> mlua::Result<Value> {
    Ok(match value {
        ScriptValue::Nil | ScriptValue::Opaque(_) => Value::Nil,
        ScriptValue::Boolean(b) => Value::Boolean(*b),
        ScriptValue::Integer(i) => Value::Integer(*i),
        ScriptValue::Number(n) => Value::Number(*n),
        ScriptValue::String(bytes) => Value::String(lua.create_string(bytes)?),
        ScriptValue::Table(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (k, v) in entries {
                let key = to_lua_value(lua, k)?;
                if !key.is_nil() {
                    table.raw_set(key, to_lua_value(lua, v)?)?;
                }
            }
            Value::Table(table)
        }
    })
}

/// Return `value` on success, `nil, message` on failure
pub fn ok_or_nil<T: IntoLua, E: Display>(
    lua: &Lua,
    result: Result<T, E>,
) -> mlua::Result<MultiValue> {
    match result {
        Ok(value) => value.into_lua_multi(lua),
        Err(e) => nil_with(lua, e),
    }
}

/// `nil, message`
pub fn nil_with(lua: &Lua, message: impl Display) -> mlua::Result<MultiValue> {
    (Value::Nil, message.to_string()).into_lua_multi(lua)
}

/// Byte-string argument; numbers are accepted the way Lua coerces them
pub fn arg_bytes(value: &Value, name: &str) -> Result<Vec<u8>, String> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Integer(i) => Ok(i.to_string().into_bytes()),
        Value::Number(n) => Ok(n.to_string().into_bytes()),
        other => Err(bad_argument(name, "string", other)),
    }
}

pub fn arg_string(value: &Value, name: &str) -> Result<String, String> {
    arg_bytes(value, name).and_then(|bytes| {
        String::from_utf8(bytes).map_err(|_| format!("argument '{name}' is not valid UTF-8"))
    })
}

/// Optional string argument; `nil` gives `None`
pub fn opt_string(value: &Value, name: &str) -> Result<Option<String>, String> {
    match value {
        Value::Nil => Ok(None),
        other => arg_string(other, name).map(Some),
    }
}

pub fn arg_number(value: &Value, name: &str) -> Result<f64, String> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) => Ok(*n),
        Value::String(s) => s
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| bad_argument(name, "number", value)),
        other => Err(bad_argument(name, "number", other)),
    }
}

pub fn arg_integer(value: &Value, name: &str) -> Result<i64, String> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Ok(*n as i64),
        other => Err(bad_argument(name, "integer", other)),
    }
}

pub fn arg_table(value: &Value, name: &str) -> Result<Table, String> {
    match value {
        Value::Table(t) => Ok(t.clone()),
        other => Err(bad_argument(name, "table", other)),
    }
}

pub fn arg_function(value: &Value, name: &str) -> Result<mlua::Function, String> {
    match value {
        Value::Function(f) => Ok(f.clone()),
        other => Err(bad_argument(name, "function", other)),
    }
}

fn bad_argument(name: &str, expected: &str, got: &Value) -> String {
    format!("argument '{name}' must be a {expected}, got {}", got.type_name())
}

/// Text form of a value as `print` shows it
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".into(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => format!("{n:.1}"),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lua_to_host_values() {
        let lua = Lua::new();
        let value: Value = lua
            .load(r#"return {1, "two", flag = true}"#)
            .eval()
            .unwrap();
        let ScriptValue::Table(entries) = to_script_value(&value) else {
            panic!("Expected table");
        };
        assert_eq!(entries.len(), 3);
        assert!(entries.contains(&(ScriptValue::Integer(2), ScriptValue::String(b"two".to_vec()))));
        assert!(entries.contains(&(
            ScriptValue::String(b"flag".to_vec()),
            ScriptValue::Boolean(true)
        )));

        let f: Value = lua.load("return print").eval().unwrap();
        assert_eq!(to_script_value(&f), ScriptValue::Opaque("function".into()));
    }

    #[test]
    fn cyclic_tables_stop_at_depth_limit() {
        let lua = Lua::new();
        let value: Value = lua.load("local t = {} t.self = t return t").eval().unwrap();
        let mut current = to_script_value(&value);
        let mut depth = 0;
        while let ScriptValue::Table(mut entries) = current {
            current = entries.pop().map(|(_, v)| v).unwrap_or(ScriptValue::Nil);
            depth += 1;
        }
        assert_eq!(depth, MAX_VALUE_DEPTH);
        assert_eq!(current, ScriptValue::Opaque("table".into()));
    }

    #[test]
    fn host_to_lua_values() {
        let lua = Lua::new();
        let host = ScriptValue::Table(vec![
            (ScriptValue::String(b"n".to_vec()), ScriptValue::Integer(7)),
            (ScriptValue::Nil, ScriptValue::Integer(1)),
        ]);
        let value = to_lua_value(&lua, &host).unwrap();
        lua.globals().set("t", value).unwrap();
        let n: i64 = lua.load("return t.n").eval().unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn failures_become_nil_and_message() {
        let lua = Lua::new();
        let values = ok_or_nil::<i64, _>(&lua, Err("broken")).unwrap();
        let values: Vec<Value> = values.into_iter().collect();
        assert!(values[0].is_nil());
        assert_eq!(display_value(&values[1]), "broken");

        let values = ok_or_nil::<_, String>(&lua, Ok(5)).unwrap();
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn argument_helpers() {
        let lua = Lua::new();
        let s = Value::String(lua.create_string("12").unwrap());
        assert_eq!(arg_number(&s, "n").unwrap(), 12.0);
        assert_eq!(arg_bytes(&Value::Integer(3), "d").unwrap(), b"3");
        assert!(arg_table(&Value::Nil, "t").unwrap_err().contains("got nil"));
        assert_eq!(opt_string(&Value::Nil, "o").unwrap(), None);
        assert_eq!(display_value(&Value::Number(1.0)), "1.0");
        assert_eq!(display_value(&Value::Number(0.5)), "0.5");
    }
}
