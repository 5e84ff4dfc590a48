//! HTTP entrypoint: the webhook the messaging gateway posts to, plus liveness.

mod server;

pub use server::{build_router, run_gateway, AppState};
