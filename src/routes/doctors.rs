//! routes/doctors.rs
use axum::{
    routing::get,
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    config::Config,
    error::{AppErr, AppResult},
    protocol::EntryView,
    status::Status,
    store::{Doctor, Store},
    utils::jwt,
};

#[derive(Deserialize)]
struct NewDoctor {
    name: String,
}

#[derive(Serialize)]
struct DoctorJson {
    id: i64,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    status: Option<Status>,
}

pub fn router() -> Router {
    Router::new()
        .route("/doctors", get(list).post(create))
        .route("/doctors/:doctor_id/history", get(history))
}

/* ---------------- Doctors ---------------- */
async fn list(Extension(store): Extension<Store>) -> AppResult<Json<Vec<Doctor>>> {
    Ok(Json(store.list_doctors().await?))
}

async fn create(
    Extension(store): Extension<Store>,
    Extension(cfg): Extension<Arc<Config>>,
    Json(p): Json<NewDoctor>,
) -> AppResult<(StatusCode, Json<DoctorJson>)> {
    let name = p.name.trim();
    if name.is_empty() {
        return Err(AppErr::Bad("name is required".into()));
    }
    let d = store.create_doctor(name).await?;
    // dashboard credential, only meaningful when connections are checked
    let token = match &cfg.jwt_secret {
        Some(secret) => Some(jwt::sign(d.id, secret)?),
        None => None,
    };
    tracing::info!(doctor_id = d.id, "doctor created");
    Ok((StatusCode::CREATED, Json(DoctorJson { id: d.id, name: d.name, token })))
}

/* ---------------- History ---------------- */
async fn history(
    Extension(store): Extension<Store>,
    Path(doctor_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> AppResult<Json<Vec<EntryView>>> {
    store.get_doctor(doctor_id).await?.ok_or(AppErr::RoomNotFound(doctor_id))?;
    let list = store.list_history(doctor_id, q.status).await?;
    Ok(Json(list.iter().map(EntryView::for_doctor).collect()))
}
