//! Gateway server implementation

mod admission;
pub mod proxy;
mod router;
mod server;

pub use admission::admission_middleware;
pub use router::{AppState, create_router};
pub use server::Gateway;
