pub mod authorization_service;
pub mod correlator;
pub mod handshake_service;
pub mod room_service;
pub mod session_registry;
pub mod token_service;
pub mod traffic_monitor;

pub use authorization_service::{
    AuthorizationCommand, AuthorizationError, AuthorizationGrant, AuthorizationService,
    AuthorizationSettings,
};
pub use correlator::{CorrelationError, RequestReplyCorrelator};
pub use handshake_service::{AdmittedSession, HandshakeRejection, HandshakeRequest, HandshakeService};
pub use room_service::{NewRoom, RoomService};
pub use session_registry::{RegistrySettings, SessionRegistry, SweepReport};
pub use token_service::{SessionTokenService, TokenError};
pub use traffic_monitor::{TrafficMonitor, TrafficSettings};
