//! Shared building blocks for the Courier notification service.

pub mod cipher;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod types;
