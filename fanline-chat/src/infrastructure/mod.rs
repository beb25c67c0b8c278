pub mod auth;
pub mod connection;
pub mod messaging;
pub mod store;
