//! The request dispatch engine (spec's core subject): classify -> resolve
//! model -> select candidate -> enforce affinity -> stream forward with
//! mid-stream failover -> update circuit/health/quota/session state ->
//! compensate headers -> emit structured log + cost snapshot. Deliberately
//! free of any HTTP framework dependency; `autorouter-router` adapts
//! `engine::dispatch` onto axum.

pub mod affinity;
pub mod auth;
pub mod billing;
pub mod bootstrap;
pub mod circuit;
pub mod classify;
pub mod data;
pub mod engine;
pub mod error;
pub mod failover;
pub mod forwarder;
pub mod headers;
pub mod health;
pub mod quota;
pub mod registry;
pub mod selector;
pub mod state;

pub use engine::{dispatch, DispatchContext, DispatchRequest, DispatchResponse};
pub use error::DispatchError;
pub use state::AppState;
