//! Video-conference bridge hooks: external policy lookup and event sink.
//!
//! The conference alias is the patient's token, so both hooks resolve the
//! patient's live entry from it.
use axum::{
    routing::{get, post},
    extract::{Extension, Json, Query},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{AppErr, AppResult},
    queue,
    state::Rooms,
    status::Status,
    store::Store,
};

#[derive(Deserialize)]
struct PolicyQuery {
    local_alias: Option<String>,
    #[serde(default)]
    remote_display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct SinkEvent {
    pub event: String,
    #[serde(default)]
    pub data: SinkData,
}

#[derive(Deserialize, Default)]
pub struct SinkData {
    pub destination_alias: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
}

pub fn router() -> Router {
    Router::new()
        .route("/policy/service/configuration", get(policy))
        .route("/events", post(events))
}

fn reject(cause: Option<&str>) -> Json<Value> {
    let result = match cause {
        Some(msg) => json!({ "disconnect": true, "disconnect_cause": "INVALID_CONFERENCE_ALIAS", "message": msg }),
        None => json!({}),
    };
    Json(json!({ "status": "success", "action": "reject", "result": result }))
}

/* ---------------- Policy ---------------- */
async fn policy(
    Extension(store): Extension<Store>,
    Query(q): Query<PolicyQuery>,
) -> AppResult<Json<Value>> {
    let Some(alias) = q.local_alias else {
        tracing::debug!("policy request without alias");
        return Ok(Json(json!({ "status": "success", "action": "continue", "result": {} })));
    };
    let Ok(token) = Uuid::parse_str(&alias) else {
        tracing::warn!(alias = %alias, "policy request with invalid alias");
        return Ok(reject(Some("Invalid patient token provided as conference alias.")));
    };

    let entry = store.live_entry_by_token(&token).await?;
    let Some(e) = entry.filter(|e| matches!(e.status, Status::InProgress | Status::InCall | Status::LeftCall)) else {
        tracing::info!(alias = %alias, "no consultation in progress, rejecting conference");
        return Ok(reject(None));
    };
    let doctor = store.get_doctor(e.doctor_id).await?.map(|d| d.name).unwrap_or_default();
    tracing::info!(entry_id = e.id, caller = q.remote_display_name.as_deref().unwrap_or("Guest"), "conference allowed");

    Ok(Json(json!({
        "status": "success",
        "action": "continue",
        "result": {
            "name": format!("Dr. {doctor}'s Room ({})", e.patient_name),
            "service_tag": alias,
            "service_type": "conference",
            "allow_guests": true,
            "direct_media": "best_effort",
            "enable_overlay_text": true,
            "pin": e.host_pin,
            "guest_pin": e.guest_pin,
            "disconnect_on_host_disconnect": true,
        }
    })))
}

/// Status the sink event moves the patient's entry to, if any.
pub fn target_status(ev: &SinkEvent) -> Option<Status> {
    let guest = ev.data.role.as_deref() == Some("guest");
    match ev.event.as_str() {
        "participant_connected" if guest => Some(Status::InCall),
        "participant_disconnected" if guest => Some(Status::LeftCall),
        "conference_ended" => Some(Status::LeftCall),
        _ => None,
    }
}

/* ---------------- Event sink ---------------- */
async fn events(
    Extension(store): Extension<Store>,
    Extension(rooms): Extension<Rooms>,
    Json(ev): Json<SinkEvent>,
) -> AppResult<Json<Value>> {
    let alias = ev
        .data
        .destination_alias
        .as_deref()
        .ok_or_else(|| AppErr::Bad("missing destination_alias".into()))?;
    let Some(to) = target_status(&ev) else {
        return Ok(Json(json!({ "status": "success", "message": "Event ignored" })));
    };
    let token = Uuid::parse_str(alias).map_err(|_| AppErr::Bad(format!("alias {alias:?} is not a patient token")))?;

    match store.live_entry_by_token(&token).await? {
        None => tracing::warn!(alias, event = %ev.event, "no live entry for conference event"),
        Some(e) => match queue::transition(&store, &rooms, e.doctor_id, e.id, to).await {
            Ok(_) => tracing::info!(entry_id = e.id, who = ev.data.display_name.as_deref().unwrap_or("?"), status = %to, "conference event applied"),
            Err(err @ (AppErr::InvalidTransition { .. } | AppErr::Conflict(_))) => {
                tracing::info!(entry_id = e.id, error = %err, "conference event left status unchanged")
            }
            Err(err) => return Err(err),
        },
    }
    Ok(Json(json!({ "status": "success", "message": "Event received" })))
}
