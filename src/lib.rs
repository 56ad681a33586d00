pub mod address;
pub mod command;
pub mod config;
pub mod limits;
pub mod logger;
pub mod registry;
pub mod reputation;
pub mod server;
pub mod session;
pub mod store;
