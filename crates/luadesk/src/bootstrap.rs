//! Guest-side bootstrap executed once when a session opens.
//!
//! The script makes sure the host namespaces exist, fills in compatibility
//! shims older scripts expect (`unpack`, `loadstring`, `math.pow`,
//! `table.getn`), makes the protected-call builtins let a session shutdown
//! through, and finally locks the builtin module tables.
//!
//! Locking moves every field of a module into a hidden table and leaves the
//! module as an empty proxy whose metatable reads through to it and rejects
//! writes. The global table gets a metatable of its own that rejects
//! reassigning a locked module name, and `rawset` is replaced by a version
//! that refuses the same writes. Because the global entries are moved out,
//! the proxies are reached through `__index` and the module names do not show
//! up as raw globals.
//!
//! The chunk receives one argument: a function returning `true` once the
//! session is shutting down. `pcall`, `xpcall` and `coroutine.resume` re-raise
//! any error they caught while it returns `true`, so guest code cannot swallow
//! the shutdown signal raised by the host hook.

use mlua::{Function, Lua};

use crate::capability::{CAPABILITY_VIOLATION, LOCKED_MODULES};

/// Chunk name of the bootstrap script in interpreter error messages.
pub const BOOTSTRAP_CHUNK: &str = "=bootstrap";

const PRELUDE: &str = r"
local stopping = ...

gui = gui or {}
socket = socket or {}
time = time or {}

unpack = unpack or (table and table.unpack)
loadstring = loadstring or load
if math then
  math.pow = math.pow or function(x, y) return x ^ y end
  math.ldexp = math.ldexp or function(m, e) return m * 2.0 ^ e end
end
if table then
  table.getn = table.getn or function(t) return #t end
end
";

const SHUTDOWN_PASSTHROUGH: &str = r"
if stopping then
  local error = error
  local function settle(ok, ...)
    if not ok and stopping() then
      error((...), 0)
    end
    return ok, ...
  end

  local raw_pcall, raw_xpcall = pcall, xpcall
  pcall = function(f, ...) return settle(raw_pcall(f, ...)) end
  xpcall = function(f, handler, ...) return settle(raw_xpcall(f, handler, ...)) end
  if coroutine then
    local raw_resume = coroutine.resume
    coroutine.resume = function(co, ...) return settle(raw_resume(co, ...)) end
  end
end
";

const LOCKER: &str = r"
do
  local rawget, raw_set, next, error, setmetatable = rawget, rawset, next, error, setmetatable
  local locked = {}
  local proxies = {}

  for _, name in ipairs(names) do
    local module = rawget(_G, name)
    if type(module) == 'table' then
      local hidden = {}
      for key, value in next, module do
        hidden[key] = value
      end
      for key in next, hidden do
        module[key] = nil
      end
      setmetatable(module, {
        __index = hidden,
        __newindex = function() error(violation, 2) end,
        __pairs = function() return next, hidden, nil end,
        __len = function() return #hidden end,
        __metatable = false,
      })
      locked[name] = module
      proxies[module] = true
      raw_set(_G, name, nil)
    end
  end

  setmetatable(_G, {
    __index = locked,
    __newindex = function(t, key, value)
      if locked[key] ~= nil then
        error(violation, 2)
      end
      raw_set(t, key, value)
    end,
    __metatable = false,
  })

  rawset = function(t, key, value)
    if proxies[t] or (t == _G and locked[key] ~= nil) then
      error(violation, 2)
    end
    return raw_set(t, key, value)
  end
end
";

/// Builds the bootstrap script for the builtin module list.
#[must_use]
pub fn bootstrap_script() -> String {
    let names = LOCKED_MODULES
        .iter()
        .map(|name| format!("{name:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut script = String::from(PRELUDE);
    script.push_str(SHUTDOWN_PASSTHROUGH);
    script.push_str(&format!("local names = {{ {names} }}\n"));
    script.push_str(&format!("local violation = {CAPABILITY_VIOLATION:?}\n"));
    script.push_str(LOCKER);
    script
}

/// Runs the bootstrap script; `stopping` reports whether the session is shutting down.
///
/// # Errors
/// Returns the interpreter error when the script fails.
pub fn run_bootstrap(lua: &Lua, stopping: Function) -> mlua::Result<()> {
    lua.load(bootstrap_script()).set_name(BOOTSTRAP_CHUNK).call::<()>(stopping)
}
