//! Syntactic validation of a [`Route`] record.

use jack_types::Route;

use crate::error::ValidationError;
use crate::net::{is_valid_cidr, is_valid_interface_name, is_valid_ip};

pub fn validate_route(route: &Route) -> Result<(), ValidationError> {
    if !route.is_default() && !is_valid_cidr(&route.destination) {
        return Err(ValidationError::field(
            "destination",
            "must be a CIDR or the literal \"default\"",
        ));
    }

    if !route.gateway.is_empty() && !is_valid_ip(&route.gateway) {
        return Err(ValidationError::field(
            "gateway",
            "not a valid IP address",
        ));
    }

    if route.gateway.is_empty() && route.interface.is_none() {
        return Err(ValidationError::field(
            "gateway",
            "either gateway or interface must be set",
        ));
    }

    if let Some(iface) = &route.interface
        && !is_valid_interface_name(iface)
    {
        return Err(ValidationError::field("interface", "invalid interface name"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(destination: &str, gateway: &str, interface: Option<&str>) -> Route {
        Route {
            destination: destination.into(),
            gateway: gateway.into(),
            interface: interface.map(String::from),
            metric: 0,
            table: 0,
            enabled: true,
        }
    }

    #[test]
    fn default_destination_accepted() {
        assert!(validate_route(&route("default", "10.0.0.1", None)).is_ok());
    }

    #[test]
    fn non_cidr_destination_rejected() {
        assert!(validate_route(&route("not-a-cidr", "10.0.0.1", None)).is_err());
    }

    #[test]
    fn requires_gateway_or_interface() {
        assert!(validate_route(&route("10.0.0.0/24", "", None)).is_err());
        assert!(validate_route(&route("10.0.0.0/24", "", Some("eth0"))).is_ok());
    }
}
