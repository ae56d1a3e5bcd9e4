//! The `bastion` host namespace: the only imports a plugin module may have.
//!
//! ## Calling convention
//!
//! Strings and byte buffers are passed as `(ptr, len)` pairs into the
//! guest's exported `memory`. Functions that return data take an output
//! buffer `(out_ptr, out_cap)` and return the number of bytes the full
//! answer needs; the answer is written only if it fits, so a guest can
//! retry with a larger buffer. `-1` means "nothing there" (missing key,
//! failed request). Context values and bindings are JSON.
//!
//! | function | signature | permission |
//! |---|---|---|
//! | `print` | `(ptr, len)` | none |
//! | `ctx_get` | `(name_ptr, name_len, out_ptr, out_cap) -> i32` | none |
//! | `attr_get` | `(path_ptr, path_len, out_ptr, out_cap) -> i32` | none |
//! | `bind` | `(name_ptr, name_len, val_ptr, val_len) -> i32` | none |
//! | `log` | `(ptr, len)` | `log.write` |
//! | `clock_now` | `() -> i64` (unix millis) | `clock.read` |
//! | `storage_get` | `(key_ptr, key_len, out_ptr, out_cap) -> i32` | `storage.read` |
//! | `storage_set` | `(key_ptr, key_len, val_ptr, val_len) -> i32` | `storage.write` |
//! | `fs_read` | `(path_ptr, path_len, out_ptr, out_cap) -> i32` | `fs.read` |
//! | `fs_write` | `(path_ptr, path_len, data_ptr, data_len) -> i32` | `fs.write` |
//! | `http_get` | `(url_ptr, url_len, out_ptr, out_cap) -> i32` | `network.fetch` |
//! | `notify` | `(ptr, len) -> i32` | `notifications.show` |
//!
//! A gated call without the grant traps before any argument is read.

use std::sync::Arc;
use tracing::{debug, warn};
use wasmtime::{Caller, Extern, Linker, Memory};

use crate::sandbox::ExecState;
use crate::sandbox::ceiling::Interrupt;
use crate::sandbox::guard::{guarded_path, is_attribute_allowed};
use crate::sandbox::services::ServiceError;

pub const HOST_MODULE: &str = "bastion";

/// Permission reported when a guest reaches for a reflective attribute.
pub const REFLECTION: &str = "reflection";

/// Every host function and the permission it requires.
pub const HOST_FUNCTIONS: &[(&str, Option<&str>)] = &[
    ("print", None),
    ("ctx_get", None),
    ("attr_get", None),
    ("bind", None),
    ("log", Some("log.write")),
    ("clock_now", Some("clock.read")),
    ("storage_get", Some("storage.read")),
    ("storage_set", Some("storage.write")),
    ("fs_read", Some("fs.read")),
    ("fs_write", Some("fs.write")),
    ("http_get", Some("network.fetch")),
    ("notify", Some("notifications.show")),
];

/// `None` if `name` is not a host function, `Some(None)` if it is ungated.
pub fn required_permission(name: &str) -> Option<Option<&'static str>> {
    HOST_FUNCTIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, p)| *p)
}

type Ctx<'a> = Caller<'a, ExecState>;

// ── Guest memory ───────────────────────────────────────────────

fn memory(caller: &mut Ctx<'_>) -> wasmtime::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(m)) => Ok(m),
        _ => Err(Interrupt::Fault("module does not export 'memory'".into()).trap()),
    }
}

fn read_bytes(caller: &mut Ctx<'_>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let mem = memory(caller)?;
    let start = ptr as u32 as usize;
    let len = len as u32 as usize;
    let data = mem.data(&*caller);
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Interrupt::Fault(format!("guest buffer {start}+{len} out of bounds")).trap())?;
    Ok(data[start..end].to_vec())
}

fn read_str(caller: &mut Ctx<'_>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    let bytes = read_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).map_err(|_| Interrupt::Fault("guest string is not valid UTF-8".into()).trap())
}

/// Write `bytes` into the guest's output buffer if they fit; always
/// return the length the full answer needs.
fn reply(caller: &mut Ctx<'_>, out_ptr: i32, out_cap: i32, bytes: &[u8]) -> wasmtime::Result<i32> {
    let needed = i32::try_from(bytes.len())
        .map_err(|_| Interrupt::Fault("host answer larger than 2 GiB".into()).trap())?;
    if bytes.len() <= out_cap.max(0) as usize {
        let mem = memory(caller)?;
        mem.write(&mut *caller, out_ptr as u32 as usize, bytes)
            .map_err(|e| Interrupt::Fault(format!("guest output buffer: {e}")).trap())?;
    }
    Ok(needed)
}

fn encode(value: &serde_json::Value) -> wasmtime::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Interrupt::Fault(format!("context value: {e}")).trap())
}

// ── Gates ──────────────────────────────────────────────────────

fn require(caller: &Ctx<'_>, permission: &'static str) -> wasmtime::Result<()> {
    let state = caller.data();
    if state.permissions.has(&state.plugin, permission) {
        return Ok(());
    }
    warn!(plugin = %state.plugin, permission, "gated host call denied");
    Err(Interrupt::PermissionDenied(permission.into()).trap())
}

fn service_denied(permission: &'static str, err: ServiceError) -> wasmtime::Error {
    debug!(permission, error = %err, "host service refused request");
    Interrupt::PermissionDenied(permission.into()).trap()
}

// ── Linking ────────────────────────────────────────────────────

pub(crate) fn link(linker: &mut Linker<ExecState>) -> wasmtime::Result<()> {
    linker.func_wrap(HOST_MODULE, "print", |mut caller: Ctx<'_>, ptr: i32, len: i32| -> wasmtime::Result<()> {
        let bytes = read_bytes(&mut caller, ptr, len)?;
        caller.data_mut().output.push(&bytes);
        Ok(())
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "ctx_get",
        |mut caller: Ctx<'_>, name_ptr: i32, name_len: i32, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            let name = read_str(&mut caller, name_ptr, name_len)?;
            if !is_attribute_allowed(&name) {
                return Err(Interrupt::PermissionDenied(REFLECTION.into()).trap());
            }
            let encoded = match caller.data().context.get(&name) {
                Some(v) => encode(v)?,
                None => return Ok(-1),
            };
            reply(&mut caller, out_ptr, out_cap, &encoded)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "attr_get",
        |mut caller: Ctx<'_>, path_ptr: i32, path_len: i32, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            let path = read_str(&mut caller, path_ptr, path_len)?;
            let (root, rest) = match path.split_once('.') {
                Some((root, rest)) => (root, Some(rest)),
                None => (path.as_str(), None),
            };
            if !is_attribute_allowed(root) {
                return Err(Interrupt::PermissionDenied(REFLECTION.into()).trap());
            }
            let encoded = {
                let state = caller.data();
                let Some(value) = state.context.get(root) else {
                    return Ok(-1);
                };
                let found = match rest {
                    Some(rest) => guarded_path(value, rest).map_err(|denied| {
                        warn!(plugin = %state.plugin, attribute = %denied.name, "reflective attribute access denied");
                        Interrupt::PermissionDenied(REFLECTION.into()).trap()
                    })?,
                    None => Some(value),
                };
                match found {
                    Some(v) => encode(v)?,
                    None => return Ok(-1),
                }
            };
            reply(&mut caller, out_ptr, out_cap, &encoded)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "bind",
        |mut caller: Ctx<'_>, name_ptr: i32, name_len: i32, val_ptr: i32, val_len: i32| -> wasmtime::Result<i32> {
            let name = read_str(&mut caller, name_ptr, name_len)?;
            if !is_attribute_allowed(&name) {
                return Ok(-1);
            }
            let raw = read_bytes(&mut caller, val_ptr, val_len)?;
            let value = serde_json::from_slice(&raw)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&raw).into_owned()));
            caller.data_mut().bindings.insert(name, value);
            Ok(0)
        },
    )?;

    linker.func_wrap(HOST_MODULE, "log", |mut caller: Ctx<'_>, ptr: i32, len: i32| -> wasmtime::Result<()> {
        require(&caller, "log.write")?;
        let message = read_str(&mut caller, ptr, len)?;
        let state = caller.data();
        state.services.log(&state.plugin, &message);
        Ok(())
    })?;

    linker.func_wrap(HOST_MODULE, "clock_now", |caller: Ctx<'_>| -> wasmtime::Result<i64> {
        require(&caller, "clock.read")?;
        Ok(chrono::Utc::now().timestamp_millis())
    })?;

    linker.func_wrap(
        HOST_MODULE,
        "storage_get",
        |mut caller: Ctx<'_>, key_ptr: i32, key_len: i32, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            require(&caller, "storage.read")?;
            let key = read_str(&mut caller, key_ptr, key_len)?;
            let value = {
                let state = caller.data();
                state.services.storage_get(&state.plugin, &key)
            };
            match value {
                Some(v) => reply(&mut caller, out_ptr, out_cap, &v),
                None => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "storage_set",
        |mut caller: Ctx<'_>, key_ptr: i32, key_len: i32, val_ptr: i32, val_len: i32| -> wasmtime::Result<i32> {
            require(&caller, "storage.write")?;
            let key = read_str(&mut caller, key_ptr, key_len)?;
            let value = read_bytes(&mut caller, val_ptr, val_len)?;
            let state = caller.data();
            Ok(match state.services.storage_set(&state.plugin, &key, &value) {
                Ok(()) => 0,
                Err(_) => -1,
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "fs_read",
        |mut caller: Ctx<'_>, path_ptr: i32, path_len: i32, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            require(&caller, "fs.read")?;
            let path = read_str(&mut caller, path_ptr, path_len)?;
            let result = {
                let state = caller.data();
                state.services.read_file(&state.plugin, &path)
            };
            match result {
                Ok(bytes) => reply(&mut caller, out_ptr, out_cap, &bytes),
                Err(e @ ServiceError::Denied(_)) => Err(service_denied("fs.read", e)),
                Err(_) => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "fs_write",
        |mut caller: Ctx<'_>, path_ptr: i32, path_len: i32, data_ptr: i32, data_len: i32| -> wasmtime::Result<i32> {
            require(&caller, "fs.write")?;
            let path = read_str(&mut caller, path_ptr, path_len)?;
            let data = read_bytes(&mut caller, data_ptr, data_len)?;
            let state = caller.data();
            match state.services.write_file(&state.plugin, &path, &data) {
                Ok(()) => Ok(0),
                Err(e @ ServiceError::Denied(_)) => Err(service_denied("fs.write", e)),
                Err(_) => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "http_get",
        |mut caller: Ctx<'_>, url_ptr: i32, url_len: i32, out_ptr: i32, out_cap: i32| -> wasmtime::Result<i32> {
            require(&caller, "network.fetch")?;
            let url = read_str(&mut caller, url_ptr, url_len)?;
            let services = Arc::clone(&caller.data().services);
            let plugin = caller.data().plugin.clone();
            match services.fetch(&plugin, &url) {
                Ok(body) => reply(&mut caller, out_ptr, out_cap, &body),
                Err(e @ ServiceError::Denied(_)) => Err(service_denied("network.fetch", e)),
                Err(_) => Ok(-1),
            }
        },
    )?;

    linker.func_wrap(HOST_MODULE, "notify", |mut caller: Ctx<'_>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
        require(&caller, "notifications.show")?;
        let message = read_str(&mut caller, ptr, len)?;
        let state = caller.data();
        Ok(match state.services.notify(&state.plugin, &message) {
            Ok(()) => 0,
            Err(_) => -1,
        })
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gated_and_ungated_lookup() {
        assert_eq!(required_permission("print"), Some(None));
        assert_eq!(required_permission("fs_write"), Some(Some("fs.write")));
        assert_eq!(required_permission("system"), None);
    }

    #[test]
    fn every_gate_is_in_the_catalog() {
        for (name, perm) in HOST_FUNCTIONS {
            if let Some(p) = perm {
                assert!(bastion_permissions::catalog::is_known(p), "{name} gated by unknown {p}");
            }
        }
    }
}
