//! Directory adapter for UAA (identities, scopes) and the Cloud Controller
//! v2 API (spaces, organizations, memberships).

mod client;
mod models;

pub use client::{CloudDirectory, DirectoryConfig};
