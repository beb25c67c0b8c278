pub mod identifiers;

pub use identifiers::{CorrelationId, InstanceId, RoomId, SessionId};
