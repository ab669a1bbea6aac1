pub mod routes;
pub mod server;
pub mod urls;

pub use routes::RouteMounter;
pub use server::{build_router, AppState, Server};
pub use urls::UrlResolver;
