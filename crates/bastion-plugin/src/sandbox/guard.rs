//! Guarded attribute access on context objects.
//!
//! Plugins never receive host objects wholesale; they read context values
//! one attribute at a time, and every step goes through
//! [`guarded_attribute_access`].

use serde_json::Value;
use thiserror::Error;

/// Attribute names that expose reflective or host internals in common
/// plugin languages. Matched case-insensitively.
pub const DENIED_ATTRIBUTES: &[&str] = &[
    "constructor",
    "prototype",
    "globals",
    "builtins",
    "mro",
    "subclasses",
    "getattribute",
    "caller",
    "callee",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("attribute '{name}' is not accessible")]
pub struct AttributeDenied {
    pub name: String,
}

/// Whether `name` may be read from a context object.
pub fn is_attribute_allowed(name: &str) -> bool {
    if name.is_empty() || name.starts_with("__") {
        return false;
    }
    let lowered = name.to_ascii_lowercase();
    !DENIED_ATTRIBUTES.contains(&lowered.as_str())
}

/// Read attribute `name` of `object`.
///
/// Objects are indexed by key and arrays by decimal index. Returns
/// `Ok(None)` for an absent attribute and `Err` for a denied one; denial
/// is decided by name alone, before the object is looked at.
pub fn guarded_attribute_access<'a>(
    object: &'a Value,
    name: &str,
) -> Result<Option<&'a Value>, AttributeDenied> {
    if !is_attribute_allowed(name) {
        return Err(AttributeDenied {
            name: name.to_string(),
        });
    }
    Ok(match object {
        Value::Object(map) => map.get(name),
        Value::Array(items) => name.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Follow a dotted path (`user.address.city`) through nested values.
pub fn guarded_path<'a>(root: &'a Value, path: &str) -> Result<Option<&'a Value>, AttributeDenied> {
    let mut current = root;
    for segment in path.split('.') {
        match guarded_attribute_access(current, segment)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}
