//! Live waiting room: one doctor's queue shared with their patients, plus
//! per-patient chat and whiteboard, over a WebSocket per doctor room.

pub mod config;
pub mod error;
pub mod pin;
pub mod protocol;
pub mod queue;
pub mod routes;
pub mod session;
pub mod state;
pub mod status;
pub mod store;
pub mod utils {
    pub mod jwt;
}

use axum::{extract::DefaultBodyLimit, Extension, Router};
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{config::Config, state::Rooms, store::Store};

pub fn app(store: Store, rooms: Rooms, cfg: Arc<Config>) -> Router {
    let limit = cfg.body_limit;
    routes::router()
        .layer(Extension(store))
        .layer(Extension(rooms))
        .layer(Extension(cfg))
        .layer(DefaultBodyLimit::max(limit))
        .layer(RequestBodyLimitLayer::new(limit))
        .layer(TraceLayer::new_for_http())
}
