//! API routes and handlers

pub mod generate;
pub mod request_context;
mod router;

pub use router::create_router;
