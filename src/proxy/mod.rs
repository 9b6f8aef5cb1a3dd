pub mod group;
pub mod listener;
pub mod proxy_protocol;
pub mod registry;
pub mod relay;
pub mod server;
