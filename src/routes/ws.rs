use axum::{
    Router, routing::get, response::IntoResponse,
    extract::{ws::{WebSocketUpgrade, WebSocket, Message}, Path, Query, Extension},
};
use futures_util::{SinkExt, stream::{SplitSink, StreamExt}};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;
use crate::{
    config::Config,
    error::{AppErr, AppResult, bad},
    protocol::{Role, ServerMessage},
    session::{error_reply, Ctx, Session},
    state::Rooms,
    store::Store,
    utils::jwt,
};

#[derive(Deserialize)] struct LiveQuery { role:Role, token:Option<String> }

pub fn router() -> Router {
    Router::new().route("/waiting-room/:doctor_id", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(doctor_id): Path<i64>,
    Query(q): Query<LiveQuery>,
    Extension(store): Extension<Store>,
    Extension(rooms): Extension<Rooms>,
    Extension(cfg): Extension<Arc<Config>>,
) -> AppResult<impl IntoResponse> {
    store.get_doctor(doctor_id).await?.ok_or(AppErr::RoomNotFound(doctor_id))?;

    let ctx = match q.role {
        Role::Doctor => {
            if let Some(secret) = &cfg.jwt_secret {
                let ok = q.token.as_deref().and_then(|t| jwt::verify(t, secret)) == Some(doctor_id);
                if !ok { return Err(AppErr::Forbidden("unauthenticated doctor")); }
            }
            Ctx::doctor(doctor_id)
        }
        Role::Patient => {
            let patient = match q.token.as_deref() {
                Some(t) => store.patient_by_token(&Uuid::parse_str(t).map_err(bad)?).await?,
                None => None,
            };
            Ctx::patient(doctor_id, patient)
        }
    };
    Ok(ws.on_upgrade(move |s| live(s, ctx, store, rooms)))
}

/* ---------------- per connection ---------------- */
async fn live(sock: WebSocket, ctx: Ctx, store: Store, rooms: Rooms) {
    let (mut tx, mut rx) = sock.split();
    let mut sub = rooms.join(ctx.doctor_id, ctx.conn.clone(), ctx.role).await;
    tracing::info!(conn = %ctx.conn, doctor_id = ctx.doctor_id, role = ctx.role.as_str(), "connected");
    let mut sess = Session::new(ctx, store, rooms.clone());

    /* greeting */
    let hello = sess.greet().await.unwrap_or_else(|e| vec![error_reply(&e)]);
    let mut open = send_all(&mut tx, hello).await;

    while open {
        let out = tokio::select! {
            frame = rx.next() => match frame {
                Some(Ok(Message::Text(raw))) => sess.handle_text(&raw).await,
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!(conn = %sess.ctx.conn, "binary frame ignored");
                    vec![error_reply(&AppErr::Malformed("binary frames are not supported".into()))]
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,                        // ping/pong: axum answers
                Some(Err(e)) => { tracing::debug!(conn = %sess.ctx.conn, error = %e, "receive error"); break }
            },
            ev = sub.rx.recv() => match ev {
                Ok(env) => sess.relay(&env).await.unwrap_or_else(|e| vec![error_reply(&e)]),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(conn = %sess.ctx.conn, skipped = n, "client lagging, resyncing");
                    sess.catch_up(&mut sub.rx).await.unwrap_or_else(|e| vec![error_reply(&e)])
                }
                Err(RecvError::Closed) => break,
            },
        };
        open = send_all(&mut tx, out).await;
    }

    tracing::info!(conn = %sess.ctx.conn, doctor_id = sub.doctor_id, "disconnected");
    rooms.leave(sub).await;
}

async fn send_all(tx: &mut SplitSink<WebSocket, Message>, msgs: Vec<ServerMessage>) -> bool {
    for m in msgs {
        let text = match serde_json::to_string(&m) {
            Ok(t) => t,
            Err(e) => { tracing::error!(error = %e, "cannot encode reply"); continue }
        };
        if tx.send(Message::Text(text)).await.is_err() { return false; }
    }
    true
}
