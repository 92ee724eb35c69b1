//! Messages carried over `/live/waiting-room/{doctor_id}`.
//!
//! Every message is `{"kind": "...", "payload": {...}}`. A frame holds one
//! message, possibly pretty-printed, or several separated by whitespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{status::Status, store::Entry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Patient,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Doctor => "doctor",
            Role::Patient => "patient",
        }
    }
}

/// One item of the append-only whiteboard log. Stroke data is opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WhiteboardEvent {
    Stroke { data: serde_json::Value },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub entry_id: i64,
    pub from: Role,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/* ------------ client → server ------------ */

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Self-service join. `token` resumes an existing patient.
    JoinQueue {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        token: Option<Uuid>,
    },
    /// Doctor-side admission: `token` re-admits a known patient, otherwise
    /// `name` creates one.
    AdmitPatient {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        token: Option<Uuid>,
    },
    SetStatus { entry_id: i64, status: Status },
    RemoveEntry { entry_id: i64 },
    ChatMessage {
        #[serde(default)]
        entry_id: Option<i64>,
        text: String,
    },
    WhiteboardStroke {
        #[serde(default)]
        entry_id: Option<i64>,
        data: serde_json::Value,
    },
    WhiteboardClear {
        #[serde(default)]
        entry_id: Option<i64>,
    },
    WhiteboardToggle { entry_id: i64 },
    WhiteboardOpen {
        #[serde(default)]
        entry_id: Option<i64>,
    },
    RequestSnapshot,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinQueue { .. } => "join_queue",
            ClientMessage::AdmitPatient { .. } => "admit_patient",
            ClientMessage::SetStatus { .. } => "set_status",
            ClientMessage::RemoveEntry { .. } => "remove_entry",
            ClientMessage::ChatMessage { .. } => "chat_message",
            ClientMessage::WhiteboardStroke { .. } => "whiteboard_stroke",
            ClientMessage::WhiteboardClear { .. } => "whiteboard_clear",
            ClientMessage::WhiteboardToggle { .. } => "whiteboard_toggle",
            ClientMessage::WhiteboardOpen { .. } => "whiteboard_open",
            ClientMessage::RequestSnapshot => "request_snapshot",
        }
    }

    /// Roles allowed to send this kind; `None` means either.
    pub fn required_role(&self) -> Option<Role> {
        match self {
            ClientMessage::JoinQueue { .. } => Some(Role::Patient),
            ClientMessage::AdmitPatient { .. }
            | ClientMessage::SetStatus { .. }
            | ClientMessage::RemoveEntry { .. }
            | ClientMessage::WhiteboardToggle { .. } => Some(Role::Doctor),
            ClientMessage::ChatMessage { .. }
            | ClientMessage::WhiteboardStroke { .. }
            | ClientMessage::WhiteboardClear { .. }
            | ClientMessage::WhiteboardOpen { .. }
            | ClientMessage::RequestSnapshot => None,
        }
    }
}

/* ------------ server → client ------------ */

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    QueueSnapshot { entries: Vec<EntryView> },
    Joined { entry: EntryView, token: Uuid },
    Admitted { entry: EntryView, token: Uuid },
    EntryState { entry: EntryView },
    StatusRejected {
        entry_id: i64,
        requested: Status,
        reason: String,
    },
    ChatRelay(ChatLine),
    /// Whole chat log of one entry; replaces what the client holds.
    ChatReplay { entry_id: i64, lines: Vec<ChatLine> },
    WhiteboardRelay {
        entry_id: i64,
        from: Role,
        event: WhiteboardEvent,
    },
    WhiteboardReplay {
        entry_id: i64,
        events: Vec<WhiteboardEvent>,
    },
    WhiteboardState { entry_id: i64, active: bool },
    ForceRedirect {
        entry_id: i64,
        status: Status,
        location: String,
    },
    Error { code: String, message: String },
}

pub const JOIN_QUEUE_PATH: &str = "/join-queue/";

/// Entry as one connection is allowed to see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryView {
    pub id: i64,
    pub doctor_id: i64,
    pub status: Status,
    pub arrived_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_token: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_pin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_pin: Option<String>,
    pub added_by_doctor: bool,
    pub whiteboard_active: bool,
    pub mine: bool,
}

impl EntryView {
    fn bare(e: &Entry) -> Self {
        Self {
            id: e.id,
            doctor_id: e.doctor_id,
            status: e.status,
            arrived_at: e.arrived_at,
            position: None,
            patient_name: None,
            patient_token: None,
            host_pin: None,
            guest_pin: None,
            added_by_doctor: e.added_by_doctor,
            whiteboard_active: e.whiteboard_active,
            mine: false,
        }
    }

    /// Dashboard view: everything, including both pins.
    pub fn for_doctor(e: &Entry) -> Self {
        Self {
            patient_name: Some(e.patient_name.clone()),
            patient_token: Some(e.patient_token),
            host_pin: e.host_pin.clone(),
            guest_pin: e.guest_pin.clone(),
            ..Self::bare(e)
        }
    }

    /// Patients only learn names and their guest pin for their own entry.
    pub fn for_patient(e: &Entry, own: bool) -> Self {
        if !own {
            return Self::bare(e);
        }
        Self {
            patient_name: Some(e.patient_name.clone()),
            patient_token: Some(e.patient_token),
            guest_pin: e.guest_pin.clone(),
            mine: true,
            ..Self::bare(e)
        }
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}
