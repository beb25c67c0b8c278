//! 服务模块 - 包含依赖装配、后台任务与服务启动

pub mod bootstrap;
pub mod tasks;
pub mod wire;

pub use bootstrap::ApplicationBootstrap;
pub use wire::{ChatContext, assemble};
