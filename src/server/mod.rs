//! HTTP surface: health check and operator endpoints

mod router;
mod server;

pub use router::{AppState, create_router};
pub use server::Server;
