//! JSON-facing validation entry points, used by the state store's
//! `validate`/`commit`. These accept raw `serde_json::Value`s — the
//! shape the staged snapshot actually stores — and fail with
//! [`ValidationError::UnknownType`] when the value doesn't even parse into
//! the expected record, which is how an unknown `type` string surfaces.

use serde_json::Value;

use jack_types::{Interface, Route};

use crate::error::ValidationError;
use crate::interface::validate_interface;
use crate::route::validate_route;

/// Validate the whole `interfaces` map: `{name: Interface, ...}`.
pub fn validate_interfaces(value: &Value) -> Result<(), ValidationError> {
    let map = value.as_object().ok_or(ValidationError::NotAnObject)?;
    for (name, v) in map {
        let iface: Interface = serde_json::from_value(v.clone())
            .map_err(|e| ValidationError::UnknownType(e.to_string()))?;
        validate_interface(name, &iface)?;
    }
    Ok(())
}

/// Validate the whole `routes` map: `{name: Route, ...}`.
pub fn validate_routes(value: &Value) -> Result<(), ValidationError> {
    let map = value.as_object().ok_or(ValidationError::NotAnObject)?;
    for v in map.values() {
        let route: Route = serde_json::from_value(v.clone())
            .map_err(|e| ValidationError::UnknownType(e.to_string()))?;
        validate_route(&route)?;
    }
    Ok(())
}

/// Validation for an unrecognized (plugin-namespace) path: only
/// verify the value is a JSON object — the plugin owns its own schema.
pub fn validate_opaque(value: &Value) -> Result<(), ValidationError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(ValidationError::NotAnObject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_interface_type_fails() {
        let v = json!({"eth0": {"type": "ethernet", "device": "eth0"}});
        assert!(validate_interfaces(&v).is_err());
    }

    #[test]
    fn opaque_requires_object() {
        assert!(validate_opaque(&json!({"enabled": true})).is_ok());
        assert!(validate_opaque(&json!([1, 2, 3])).is_err());
    }
}
