//! The host side of the sandbox RPC: whitelisted read-through accessors.
//!
//! Every method is a single round-trip; nothing hands the worker a live
//! reference. Anything outside the whitelist is answered with an error, and
//! the attempt is a security event.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::bus::{topics, EventBus};
use crate::state::StateManager;
use crate::vfs::Vfs;

/// Methods the worker may call.
const WHITELIST: &[&str] = &[
    "vfs.read",
    "vfs.list",
    "vfs.exists",
    "vfs.stat",
    "state.snapshot",
];

pub struct SandboxShim {
    vfs: Arc<Vfs>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
}

impl SandboxShim {
    pub fn new(vfs: Arc<Vfs>, state: Arc<StateManager>, bus: Arc<EventBus>) -> Self {
        Self { vfs, state, bus }
    }

    /// Handles one shim call. Non-whitelisted methods fail and emit
    /// `security:violation`.
    pub fn handle(&self, method: &str, params: &Value) -> Result<Value, String> {
        if !WHITELIST.contains(&method) {
            self.bus.emit(
                topics::SECURITY_VIOLATION,
                json!({ "kind": "shim_method", "method": method }),
            );
            return Err(format!("method not allowed: {method}"));
        }
        match method {
            "vfs.read" => {
                let path = str_param(params, "path")?;
                let artifact = self.vfs.read(path).map_err(|e| e.to_string())?;
                Ok(json!({ "path": artifact.path, "content": artifact.content }))
            }
            "vfs.list" => {
                let prefix = params.get("prefix").and_then(|v| v.as_str()).unwrap_or("/");
                let paths = self.vfs.list(prefix).map_err(|e| e.to_string())?;
                Ok(json!(paths))
            }
            "vfs.exists" => {
                let path = str_param(params, "path")?;
                Ok(json!(self.vfs.exists(path).map_err(|e| e.to_string())?))
            }
            "vfs.stat" => {
                let path = str_param(params, "path")?;
                let stat = self.vfs.stat(path).map_err(|e| e.to_string())?;
                serde_json::to_value(stat).map_err(|e| e.to_string())
            }
            "state.snapshot" => {
                serde_json::to_value(self.state.snapshot()).map_err(|e| e.to_string())
            }
            _ => unreachable!("whitelist covers all arms"),
        }
    }
}

fn str_param<'a>(params: &'a Value, field: &str) -> Result<&'a str, String> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing {field}"))
}
