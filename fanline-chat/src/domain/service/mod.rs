pub mod ttl_policy;

pub use ttl_policy::{DEFAULT_TIMEZONE, RoomTtlPolicy};
