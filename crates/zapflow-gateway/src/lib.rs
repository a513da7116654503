//! # Zapflow Gateway
//! JSON-over-HTTP control surface: register instances, create jobs, attach
//! items, and drive the dispatch lifecycle. Every call returns immediately;
//! `start` and `resume` only launch the background loop.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
