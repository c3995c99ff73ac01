//! jack-validate: syntactic predicates over the jack type model.
//!
//! Pure functions, no I/O. Kernel-state invariants (a vlan's parent existing,
//! a bridge's ports existing) are apply-time checks owned by the netlink
//! reconciler, not this crate.

pub mod error;
pub mod interface;
pub mod json;
pub mod net;
pub mod route;
pub mod wireguard;

pub use error::ValidationError;
pub use interface::validate_interface;
pub use json::{validate_interfaces, validate_opaque, validate_routes};
pub use route::validate_route;
