pub mod api;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod gateway;
pub mod kv;
pub mod lifecycle;
pub mod registry;
pub mod relay;
