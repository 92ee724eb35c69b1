//! Per-connection state and message dispatch for the live channel.
//!
//! A [`Session`] never touches the socket: it turns inbound messages and room
//! events into replies, and `routes::ws` moves those over the wire.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::{
    error::{AppErr, AppResult},
    protocol::{ClientMessage, EntryView, Role, ServerMessage, WhiteboardEvent, JOIN_QUEUE_PATH},
    queue,
    state::{conn_id, ConnId, Envelope, RoomEvent, Rooms},
    store::{Entry, Patient, Store},
};

/// Who is on the other end. The role is taken from the connect request as-is.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub conn: ConnId,
    pub doctor_id: i64,
    pub role: Role,
    pub patient: Option<Patient>,
    /// Patient's live entry in this room, once known.
    pub entry_id: Option<i64>,
}

impl Ctx {
    pub fn doctor(doctor_id: i64) -> Self {
        Self { conn: conn_id(), doctor_id, role: Role::Doctor, patient: None, entry_id: None }
    }

    pub fn patient(doctor_id: i64, patient: Option<Patient>) -> Self {
        Self { conn: conn_id(), doctor_id, role: Role::Patient, patient, entry_id: None }
    }
}

pub struct Session {
    pub ctx: Ctx,
    store: Store,
    rooms: Rooms,
    last_seq: u64,
}

impl Session {
    pub fn new(ctx: Ctx, store: Store, rooms: Rooms) -> Self {
        Self { ctx, store, rooms, last_seq: 0 }
    }

    /* ------------ on connect ------------ */

    /// Doctors get the full snapshot; a resuming patient gets their own
    /// entry, the whiteboard log and buffered chat.
    pub async fn greet(&mut self) -> AppResult<Vec<ServerMessage>> {
        match self.ctx.role {
            Role::Doctor => Ok(vec![self.snapshot().await?]),
            Role::Patient => {
                let Some(p) = self.ctx.patient.clone() else { return Ok(vec![]) };
                match self.store.live_entry_for(self.ctx.doctor_id, p.id).await? {
                    Some(e) => {
                        tracing::info!(conn = %self.ctx.conn, entry_id = e.id, "patient resumed");
                        self.ctx.entry_id = Some(e.id);
                        self.resume(&e).await
                    }
                    None => Ok(vec![]),
                }
            }
        }
    }

    async fn resume(&self, e: &Entry) -> AppResult<Vec<ServerMessage>> {
        Ok(vec![
            ServerMessage::EntryState { entry: self.own_view(e).await? },
            self.replay(e.id).await?,
            ServerMessage::ChatReplay { entry_id: e.id, lines: self.store.chat_log(e.id).await? },
        ])
    }

    /* ------------ inbound ------------ */

    /// Raw frame text: one JSON message (pretty-printed or not), or several
    /// separated by whitespace. Never fails; problems turn into `error`
    /// replies. A syntax error drops the rest of the frame, an unknown or
    /// ill-shaped message only itself.
    pub async fn handle_text(&mut self, raw: &str) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        for item in serde_json::Deserializer::from_str(raw).into_iter::<Value>() {
            let parsed = match item {
                Ok(v) => serde_json::from_value::<ClientMessage>(v),
                Err(e) => {
                    tracing::warn!(conn = %self.ctx.conn, error = %e, "unparsable frame");
                    out.push(error_reply(&AppErr::Malformed(e.to_string())));
                    break;
                }
            };
            match parsed {
                Ok(msg) => out.extend(self.dispatch(msg).await),
                Err(e) => {
                    tracing::warn!(conn = %self.ctx.conn, error = %e, "malformed message ignored");
                    out.push(error_reply(&AppErr::Malformed(e.to_string())));
                }
            }
        }
        out
    }

    pub async fn dispatch(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        let kind = msg.kind();
        match self.handle(msg).await {
            Ok(out) => out,
            Err(e) => {
                if e.is_internal() {
                    tracing::error!(conn = %self.ctx.conn, kind, error = %e, "store failure");
                } else {
                    tracing::warn!(conn = %self.ctx.conn, kind, error = %e, "message rejected");
                }
                vec![error_reply(&e)]
            }
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) -> AppResult<Vec<ServerMessage>> {
        if let Some(role) = msg.required_role() {
            if role != self.ctx.role {
                return Err(AppErr::Forbidden(self.ctx.role.as_str()));
            }
        }
        let (store, rooms, doc) = (&self.store, &self.rooms, self.ctx.doctor_id);

        match msg {
            ClientMessage::JoinQueue { name, token } => {
                let patient = self.resolve_patient(name, token).await?;
                let (e, created) = queue::enqueue(store, rooms, doc, &patient, false).await?;
                let reattached = !created && self.ctx.entry_id != Some(e.id);
                self.ctx.patient = Some(patient.clone());
                self.ctx.entry_id = Some(e.id);
                let mut out = vec![ServerMessage::Joined { entry: self.own_view(&e).await?, token: patient.token }];
                if reattached {
                    // older entry: bring this client up to date, minus the entry_state
                    out.extend(self.resume(&e).await?.into_iter().skip(1));
                }
                Ok(out)
            }
            ClientMessage::AdmitPatient { name, token } => {
                let patient = match token {
                    Some(t) => self.store.patient_by_token(&t).await?.ok_or_else(|| AppErr::Bad("unknown patient token".into()))?,
                    None => self.store.create_patient(non_blank(name.as_deref().unwrap_or_default())?).await?,
                };
                let (e, _) = queue::enqueue(store, rooms, doc, &patient, true).await?;
                Ok(vec![ServerMessage::Admitted { entry: EntryView::for_doctor(&e), token: patient.token }])
            }
            ClientMessage::SetStatus { entry_id, status } => {
                match queue::transition(store, rooms, doc, entry_id, status).await {
                    Ok(_) => Ok(vec![]),
                    Err(e @ (AppErr::InvalidTransition { .. } | AppErr::Conflict(_))) => {
                        tracing::warn!(conn = %self.ctx.conn, entry_id, requested = %status, "status rejected");
                        Ok(vec![ServerMessage::StatusRejected { entry_id, requested: status, reason: e.to_string() }])
                    }
                    Err(e) => Err(e),
                }
            }
            ClientMessage::RemoveEntry { entry_id } => {
                queue::remove(store, rooms, doc, entry_id).await?;
                Ok(vec![])
            }
            ClientMessage::ChatMessage { entry_id, text } => {
                let id = self.target(entry_id)?;
                queue::chat(store, rooms, doc, id, self.ctx.role, &text).await?;
                Ok(vec![])
            }
            ClientMessage::WhiteboardStroke { entry_id, data } => {
                let id = self.target(entry_id)?;
                queue::draw(store, rooms, doc, id, self.ctx.role, WhiteboardEvent::Stroke { data }).await?;
                Ok(vec![])
            }
            ClientMessage::WhiteboardClear { entry_id } => {
                let id = self.target(entry_id)?;
                queue::draw(store, rooms, doc, id, self.ctx.role, WhiteboardEvent::Clear).await?;
                Ok(vec![])
            }
            ClientMessage::WhiteboardToggle { entry_id } => {
                queue::toggle_whiteboard(store, rooms, doc, entry_id).await?;
                Ok(vec![])
            }
            ClientMessage::WhiteboardOpen { entry_id } => {
                let id = self.target(entry_id)?;
                queue::live_entry(store, doc, id).await?;
                Ok(vec![self.replay(id).await?])
            }
            ClientMessage::RequestSnapshot => self.resync().await,
        }
    }

    async fn resolve_patient(&self, name: Option<String>, token: Option<uuid::Uuid>) -> AppResult<Patient> {
        if let Some(t) = token {
            if let Some(p) = self.store.patient_by_token(&t).await? {
                return Ok(p);
            }
        }
        if let Some(p) = &self.ctx.patient {
            return Ok(p.clone());
        }
        let name = name.unwrap_or_default();
        self.store.create_patient(non_blank(&name)?).await
    }

    /// Patients always act on their own entry; doctors must name one.
    fn target(&self, entry_id: Option<i64>) -> AppResult<i64> {
        match self.ctx.role {
            Role::Patient => {
                let own = self.ctx.entry_id.ok_or_else(|| AppErr::Bad("join the queue first".into()))?;
                match entry_id {
                    Some(id) if id != own => Err(AppErr::UnknownEntry(id)),
                    _ => Ok(own),
                }
            }
            Role::Doctor => entry_id.ok_or_else(|| AppErr::Bad("entry_id is required".into())),
        }
    }

    /* ------------ room events ------------ */

    /// Turns one room event into what this client should see.
    pub async fn relay(&mut self, env: &Envelope) -> AppResult<Vec<ServerMessage>> {
        if env.seq <= self.last_seq {
            return Ok(vec![]);
        }
        let gap = self.last_seq != 0 && env.seq > self.last_seq + 1;
        self.last_seq = env.seq;
        if gap {
            // the store already holds this event's effect
            tracing::debug!(conn = %self.ctx.conn, seq = env.seq, "missed room events, resyncing");
            return self.resync().await;
        }
        self.relay_event(&env.event).await
    }

    /// Called once the room buffer overflowed for this connection: skips
    /// everything still queued and rebuilds from the store a single time.
    pub async fn catch_up(&mut self, rx: &mut broadcast::Receiver<Arc<Envelope>>) -> AppResult<Vec<ServerMessage>> {
        loop {
            match rx.try_recv() {
                Ok(env) => self.last_seq = self.last_seq.max(env.seq),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.resync().await
    }

    async fn relay_event(&mut self, ev: &RoomEvent) -> AppResult<Vec<ServerMessage>> {
        let me = self.ctx.role;
        Ok(match ev {
            RoomEvent::QueueChanged => vec![self.snapshot().await?],
            RoomEvent::Closed { entry_id, status } => {
                if me == Role::Patient && self.ctx.entry_id == Some(*entry_id) {
                    self.ctx.entry_id = None;
                    vec![ServerMessage::ForceRedirect {
                        entry_id: *entry_id,
                        status: *status,
                        location: JOIN_QUEUE_PATH.to_string(),
                    }]
                } else {
                    vec![]
                }
            }
            RoomEvent::Chat(line) if line.from != me && self.in_scope(line.entry_id) => {
                vec![ServerMessage::ChatRelay(line.clone())]
            }
            RoomEvent::Whiteboard { entry_id, from, event } if *from != me && self.in_scope(*entry_id) => {
                vec![ServerMessage::WhiteboardRelay { entry_id: *entry_id, from: *from, event: event.clone() }]
            }
            RoomEvent::WhiteboardToggled { entry_id, active } if me == Role::Patient && self.in_scope(*entry_id) => {
                let mut out = vec![ServerMessage::WhiteboardState { entry_id: *entry_id, active: *active }];
                if *active {
                    out.push(self.replay(*entry_id).await?);
                }
                out
            }
            RoomEvent::Chat(_) | RoomEvent::Whiteboard { .. } | RoomEvent::WhiteboardToggled { .. } => vec![],
        })
    }

    fn in_scope(&self, entry_id: i64) -> bool {
        match self.ctx.role {
            Role::Doctor => true,
            Role::Patient => self.ctx.entry_id == Some(entry_id),
        }
    }

    /// Fresh state after lag or on request: the snapshot plus every log the
    /// client could have lost. Patients get their own entry, whiteboard and
    /// chat (or the redirect if it closed meanwhile); doctors get the open
    /// boards and the chat of every live entry.
    pub async fn resync(&mut self) -> AppResult<Vec<ServerMessage>> {
        let mut out = vec![self.snapshot().await?];
        match self.ctx.role {
            Role::Patient => {
                let Some(id) = self.ctx.entry_id else { return Ok(out) };
                let e = self.store.get_entry(id).await?;
                if e.status.is_terminal() {
                    self.ctx.entry_id = None;
                    out.push(ServerMessage::ForceRedirect {
                        entry_id: id,
                        status: e.status,
                        location: JOIN_QUEUE_PATH.to_string(),
                    });
                } else {
                    out.extend(self.resume(&e).await?);
                }
            }
            Role::Doctor => {
                for e in self.store.list_active(self.ctx.doctor_id).await? {
                    if e.whiteboard_active {
                        out.push(self.replay(e.id).await?);
                    }
                    let lines = self.store.chat_log(e.id).await?;
                    if !lines.is_empty() {
                        out.push(ServerMessage::ChatReplay { entry_id: e.id, lines });
                    }
                }
            }
        }
        Ok(out)
    }

    /* ------------ views ------------ */

    pub async fn snapshot(&self) -> AppResult<ServerMessage> {
        let list = self.store.list_active(self.ctx.doctor_id).await?;
        let entries = list
            .iter()
            .enumerate()
            .map(|(i, e)| self.view(e).at(i + 1))
            .collect();
        Ok(ServerMessage::QueueSnapshot { entries })
    }

    fn view(&self, e: &Entry) -> EntryView {
        match self.ctx.role {
            Role::Doctor => EntryView::for_doctor(e),
            Role::Patient => EntryView::for_patient(e, self.ctx.entry_id == Some(e.id)),
        }
    }

    async fn own_view(&self, e: &Entry) -> AppResult<EntryView> {
        let pos = self
            .store
            .list_active(e.doctor_id)
            .await?
            .iter()
            .position(|x| x.id == e.id);
        let v = match self.ctx.role {
            Role::Doctor => EntryView::for_doctor(e),
            Role::Patient => EntryView::for_patient(e, true),
        };
        Ok(match pos {
            Some(i) => v.at(i + 1),
            None => v,
        })
    }

    async fn replay(&self, entry_id: i64) -> AppResult<ServerMessage> {
        Ok(ServerMessage::WhiteboardReplay { entry_id, events: self.store.whiteboard_log(entry_id).await? })
    }
}

pub fn error_reply(e: &AppErr) -> ServerMessage {
    let message = if e.is_internal() { "internal error".to_string() } else { e.to_string() };
    ServerMessage::Error { code: e.code().to_string(), message }
}

fn non_blank(name: &str) -> AppResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppErr::Bad("name is required".into()));
    }
    Ok(name)
}
