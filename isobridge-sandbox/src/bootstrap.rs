//! Guest bootstrap and the host-generated glue scripts.
//!
//! `bootstrap.js` runs once per sandbox and installs a single frozen
//! `__sandbox` namespace (plus the legacy global aliases). Every script the
//! host generates afterwards goes through `__sandbox`, never through the
//! aliases, so guest code that reassigns `referenceToObject` or `Plugins`
//! cannot break later injections.

use crate::capability::CapabilityObject;
use crate::events::{ConsoleLevel, EventBus, SandboxEvent};
use crate::execution::SandboxId;
use serde_json::Value;
use std::sync::Arc;

const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Script that places the raw console reference where the bootstrap picks it up.
pub(crate) fn console_prelude(reference: u32) -> String {
    format!("globalThis._console = {};", reference)
}

/// The bootstrap script with the tolerance policy baked in.
pub(crate) fn bootstrap_script(strict: bool) -> String {
    BOOTSTRAP_JS.replace("__STRICT__", if strict { "true" } else { "false" })
}

fn quoted(name: &str) -> String {
    // serde_json escaping yields a valid JS string literal
    serde_json::to_string(name).unwrap_or_else(|_| "\"\"".to_string())
}

/// Caller-supplied code, run with `this === globalThis` after the decode.
fn extra_script(extra: Option<&str>) -> String {
    match extra {
        Some(extra) => format!("\n(function () {{\n{extra}\n}}).call(globalThis);"),
        None => String::new(),
    }
}

/// Assign a capability reference to a guest global and decode it in place.
/// The root reference is released once decoded.
pub(crate) fn inject_global_script(name: &str, reference: u32, extra: Option<&str>) -> String {
    let name = quoted(name);
    format!(
        "(function () {{\n\
         globalThis[{name}] = __sandbox.reference({reference});\n\
         globalThis[{name}] = __sandbox.consume(globalThis[{name}]);\n\
         }}).call(globalThis);{extra}",
        extra = extra_script(extra)
    )
}

/// Decode a capability reference into `Plugins[name]`; the transient raw
/// global is deleted before the extra code runs.
pub(crate) fn register_plugin_script(name: &str, reference: u32, extra: Option<&str>) -> String {
    let raw = quoted(&format!("_Plugins_{}", name));
    let name = quoted(name);
    format!(
        "(function () {{\n\
         globalThis[{raw}] = __sandbox.reference({reference});\n\
         try {{\n\
         __sandbox.Plugins[{name}] = __sandbox.consume(globalThis[{raw}]);\n\
         }} finally {{\n\
         delete globalThis[{raw}];\n\
         }}\n\
         }}).call(globalThis);{extra}",
        extra = extra_script(extra)
    )
}

/// Globals a module file sees while it runs.
pub(crate) fn module_prelude() -> String {
    "globalThis.module = { exports: {} };\nglobalThis.exports = globalThis.module.exports;"
        .to_string()
}

/// Register the module's exports under `name` (only if it ran to the end)
/// and remove the `module`/`exports` globals.
pub(crate) fn module_epilogue(name: &str, loaded: bool) -> String {
    let name = quoted(name);
    format!(
        "(function () {{\n\
         const module = globalThis.module;\n\
         delete globalThis.module;\n\
         delete globalThis.exports;\n\
         if ({loaded} && module !== null && typeof module === \"object\") {{\n\
         __sandbox.registerModule({name}, module.exports);\n\
         }}\n\
         }})();"
    )
}

/// Wrap a plugin script so it sees its options as `options`.
pub(crate) fn plugin_entry_script(source: &str, options: &Value) -> String {
    format!(
        "(function (options) {{\n{source}\n}}).call(globalThis, {options});",
        options = options
    )
}

/// Walk a dotted path from the guest global.
pub(crate) fn property_script(path: &str) -> String {
    let segments: Vec<&str> = path.split('.').collect();
    let segments = serde_json::to_string(&segments).unwrap_or_else(|_| "[]".to_string());
    format!(
        "(() => {{ let value = globalThis; for (const key of {segments}) {{ value = value[key]; }} return value; }})()"
    )
}

/// Host side of the guest `console`.
///
/// Each method receives one JSON-encoded argument list. With logging off the
/// call is a no-op; undecodable payloads are dropped.
pub(crate) fn console_capability(
    id: SandboxId,
    token: String,
    logging: bool,
    events: Arc<EventBus>,
) -> CapabilityObject {
    let log_events = events.clone();
    let log_token = token.clone();
    CapabilityObject::new()
        .function("log", move |args| {
            forward(id, &log_token, logging, &log_events, ConsoleLevel::Log, args);
            Ok(Value::Null)
        })
        .function("dir", move |args| {
            forward(id, &token, logging, &events, ConsoleLevel::Dir, args);
            Ok(Value::Null)
        })
}

fn forward(
    id: SandboxId,
    token: &str,
    logging: bool,
    events: &EventBus,
    level: ConsoleLevel,
    args: Vec<Value>,
) {
    if !logging {
        return;
    }
    let Some(payload) = args.first().and_then(Value::as_str) else {
        return;
    };
    let args: Vec<Value> = match serde_json::from_str(payload) {
        Ok(args) => args,
        Err(e) => {
            tracing::trace!(sandbox = %id, error = %e, "dropping undecodable console payload");
            return;
        }
    };
    let line = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    match level {
        ConsoleLevel::Log => tracing::info!(sandbox = %id, token, "{}", line),
        ConsoleLevel::Dir => tracing::debug!(sandbox = %id, token, "{}", line),
    }
    events.emit(&SandboxEvent::Console { id, level, args });
}
