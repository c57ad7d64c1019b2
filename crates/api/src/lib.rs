//! HTTP surface of the Courier notification service.

pub mod middleware;
pub mod routes;
pub mod state;
