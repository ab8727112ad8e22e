//! HTTP adapter: identity extraction, the rate limiting middleware and the
//! server that hosts it.

mod middleware;
mod server;

pub use middleware::{
    client_identity, rate_limit_middleware, rejection, with_rate_limit, REJECTION_MESSAGE,
};
pub use server::HttpServer;
