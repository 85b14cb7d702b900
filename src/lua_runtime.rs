//! Shared Lua 5.4 runtime pieces for the engine's scripting session.
//!
//! Provides sandboxing, the `json` and `log` host modules, `print` capture,
//! and JSON ↔ Lua value conversions. The `editor` module is registered by
//! [`crate::executor`], which owns the host it talks to.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `json` | `parse`, `encode` |
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `print` | captured into the execution's stdout |
//!
//! # Sandboxing
//!
//! Dangerous Lua standard libraries (`os`, `io`, `debug`, `loadfile`, `dofile`)
//! are removed.

use mlua::prelude::*;
use std::sync::{Arc, Mutex};

// ═══════════════════════════════════════════════════════════════════════
// Public helpers
// ═══════════════════════════════════════════════════════════════════════

/// Sandbox the globals and register every shared host module.
///
/// `stdout` receives everything the script passes to `print`.
pub(crate) fn register_all_host_apis(lua: &Lua, stdout: Arc<Mutex<String>>) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_json_api(lua)?;
    register_log_api(lua)?;
    register_print_capture(lua, stdout)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

/// Remove dangerous standard library functions from the Lua globals.
pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: log
// ═══════════════════════════════════════════════════════════════════════

fn register_log_api(lua: &Lua) -> LuaResult<()> {
    let log = lua.create_table()?;

    log.set(
        "info",
        lua.create_function(|_lua, msg: String| {
            tracing::info!(target: "script", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "warn",
        lua.create_function(|_lua, msg: String| {
            tracing::warn!(target: "script", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "error",
        lua.create_function(|_lua, msg: String| {
            tracing::error!(target: "script", "{}", msg);
            Ok(())
        })?,
    )?;
    log.set(
        "debug",
        lua.create_function(|_lua, msg: String| {
            tracing::debug!(target: "script", "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: print
// ═══════════════════════════════════════════════════════════════════════

/// Replace `print` with a version that appends to `sink` instead of the
/// process stdout. Arguments are joined by tabs, like the stock `print`.
fn register_print_capture(lua: &Lua, sink: Arc<Mutex<String>>) -> LuaResult<()> {
    let print = lua.create_function(move |lua, args: LuaMultiValue| {
        let tostring: LuaFunction = lua.globals().get("tostring")?;
        let mut line = String::new();
        for (i, value) in args.into_iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            let text: String = tostring.call(value)?;
            line.push_str(&text);
        }
        line.push('\n');
        sink.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_str(&line);
        Ok(())
    })?;
    lua.globals().set("print", print)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            // Heuristic: if raw_len > 0, treat as array; otherwise as object
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with_apis() -> (Lua, Arc<Mutex<String>>) {
        let lua = Lua::new();
        let out = Arc::new(Mutex::new(String::new()));
        register_all_host_apis(&lua, out.clone()).unwrap();
        (lua, out)
    }

    #[test]
    fn sandbox_removes_os_and_io() {
        let (lua, _) = lua_with_apis();
        let os: LuaValue = lua.globals().get("os").unwrap();
        let io: LuaValue = lua.globals().get("io").unwrap();
        assert!(os.is_nil());
        assert!(io.is_nil());
    }

    #[test]
    fn print_is_captured_tab_separated() {
        let (lua, out) = lua_with_apis();
        lua.load(r#"print("a", 1, true) print(nil)"#).exec().unwrap();
        assert_eq!(out.lock().unwrap().as_str(), "a\t1\ttrue\nnil\n");
    }

    #[test]
    fn json_roundtrip_through_lua() {
        let (lua, out) = lua_with_apis();
        lua.load(r#"local t = json.parse('{"xs":[1,2,3],"name":"hero"}') print(json.encode(t.xs), t.name)"#)
            .exec()
            .unwrap();
        assert_eq!(out.lock().unwrap().as_str(), "[1,2,3]\thero\n");
    }

    #[test]
    fn empty_table_encodes_as_object() {
        let v = lua_value_to_json(LuaValue::Table(Lua::new().create_table().unwrap())).unwrap();
        assert_eq!(v, serde_json::json!({}));
    }
}
