//! Lua command builders and the shapes of their printed results.
//!
//! Each builder returns a self-contained script for the engine's scripting
//! session. Query scripts print a single JSON document as their last line;
//! [`ExecutionResult::parse_json`](crate::protocol::ExecutionResult::parse_json)
//! decodes it.

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};

use crate::models::PathFilter;

/// Quote `s` as a Lua long-bracket string literal.
///
/// The bracket level is chosen so that no closing bracket of that level
/// appears in `s`. A newline directly after the opening bracket is dropped by
/// Lua, so one is always inserted to keep leading newlines in `s` intact.
pub fn lua_quote(s: &str) -> String {
    let mut level = 0;
    loop {
        let close = format!("]{}]", "=".repeat(level));
        if !s.contains(&close) {
            break;
        }
        level += 1;
    }
    let eq = "=".repeat(level);
    format!("[{eq}[\n{s}]{eq}]")
}

/// One page of the enumeration of `filter`: up to `limit` descriptors whose
/// paths sort after `after`, or from the start when `after` is `None`.
///
/// Pages are keyed by the last path of the previous page rather than by
/// position, so assets added or removed between pages never shift unseen
/// paths past the cursor.
pub fn enumerate_page(filter: &PathFilter, after: Option<&str>, limit: usize) -> String {
    let after = match after {
        Some(path) => lua_quote(path),
        None => "nil".to_string(),
    };
    format!(
        r#"local paths = editor.list_assets({filter})
local after = {after}
local first = 1
if after ~= nil then
  local lo, hi = 1, #paths + 1
  while lo < hi do
    local mid = (lo + hi) // 2
    if paths[mid] <= after then lo = mid + 1 else hi = mid end
  end
  first = lo
end
local last = math.min(#paths, first + {limit} - 1)
local out = {{}}
for i = first, last do
  local d = editor.find_asset(paths[i])
  if d ~= nil then out[#out + 1] = d end
end
local cursor = nil
if last >= first then cursor = paths[last] end
print(json.encode({{ total = #paths, assets = out, cursor = cursor, more = last < #paths }}))
"#,
        filter = lua_quote(filter.as_str()),
        after = after,
        limit = limit.max(1),
    )
}

/// Render one object at `size`×`size`.
pub fn render_thumbnail(object_path: &str, size: u32) -> String {
    format!(
        "print(json.encode(editor.render_thumbnail({}, {})))\n",
        lua_quote(object_path),
        size
    )
}

/// Ask the session to release what it can between thumbnail batches.
pub fn trim_memory() -> &'static str {
    "collectgarbage(\"collect\")\n"
}

/// Result of [`enumerate_page`].
#[derive(Debug, Deserialize)]
pub struct EnumerationPage {
    /// Assets in scope at the time the page was produced.
    pub total: u64,
    /// Raw descriptors; each is validated separately by the synchronizer.
    #[serde(default, deserialize_with = "de_lua_seq")]
    pub assets: Vec<serde_json::Value>,
    /// Last path covered by this page; the next page starts after it.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Whether paths remain after `cursor`.
    #[serde(default)]
    pub more: bool,
}

/// Result of [`render_thumbnail`].
#[derive(Debug, Deserialize)]
pub struct RenderReply {
    pub status: String,
    #[serde(default)]
    pub resolution: u32,
    /// Base64-encoded PNG.
    #[serde(default)]
    pub data: Option<String>,
}

/// Deserialize a Lua sequence, which encodes as `{}` when empty.
fn de_lua_seq<'de, D, T>(d: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        v @ serde_json::Value::Array(_) => serde_json::from_value(v).map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected a list, got {}", other))),
    }
}
