//! CIMA proxy library
//!
//! Exposes the client, dataset cache and router for the binary and for
//! integration tests.

pub mod api;
pub mod cache;
pub mod cli;
pub mod data;
pub mod startup;
