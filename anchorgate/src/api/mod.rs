//! HTTP API surface: the client-facing proxy path and the admin/query
//! endpoints. Routes are assembled in [`crate::create_router`].

pub mod handlers;
