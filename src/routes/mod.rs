use axum::Router;

pub mod conference;
pub mod doctors;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .nest("/api",        doctors::router())
        .nest("/live",       ws::router())
        .nest("/conference", conference::router())
}
