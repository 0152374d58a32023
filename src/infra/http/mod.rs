mod middleware;
mod modules;
mod sink;

pub use middleware::REQUEST_ID_HEADER;
pub use modules::{HttpState, build_router};
