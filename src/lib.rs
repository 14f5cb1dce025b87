pub mod config;
pub mod dial;
pub mod error;
pub mod ntp;
pub mod relay;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod store;
pub mod traits;
pub mod web;
