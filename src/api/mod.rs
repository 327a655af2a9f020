//! Diagnostics and control HTTP surface for the position guard

pub mod routes;
pub mod server;

pub use server::{create_app, AppState};
