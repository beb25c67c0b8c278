//! Fanline 聊天服务
//!
//! 体育赛事场景下的房间聊天：通过外部身份服务授权创建/加入房间，签发短时效会话令牌，
//! 多实例之间共享会话注册表并转发房间广播。

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod service;

pub use service::ApplicationBootstrap;
