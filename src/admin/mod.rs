//! Admin HTTP surface

pub mod http;
pub mod server;

pub use http::{create_router, AdminState};
pub use server::AdminServer;
