pub mod authorization;
pub mod frame;
pub mod room;
pub mod session;

pub use authorization::{
    AuthAction, AuthorizationReply, AuthorizationRequest, AuthorizationState, CallerClaims,
    CorrelationEnvelope, DenialReason, Gender, GenderFilter, IdentitySnapshot, RoomConditions,
    RoomType,
};
pub use frame::{ChatFrame, ClientFrame, RoomEvent, close_code};
pub use room::{RoomRecord, RoomStatus};
pub use session::{SessionInfo, SessionToken, SessionTokenInfo};
