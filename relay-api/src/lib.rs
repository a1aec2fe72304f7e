pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;

pub use server::{build_router, run};
