//! Axum adapter over `autorouter_core`: a generic proxy surface that calls
//! `dispatch` for every inbound request, plus a minimal health/readiness
//! surface. Admin CRUD, the web dashboard, and schema management are
//! external collaborators and live outside this crate.

pub mod admin;
pub mod proxy;

pub use admin::admin_router;
pub use proxy::proxy_router;
