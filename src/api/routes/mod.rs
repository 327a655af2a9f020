//! API route handlers

pub mod monitor;
