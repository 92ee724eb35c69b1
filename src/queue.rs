//! Mutations on a doctor's queue: validate, persist, then publish to the room.

use crate::{
    error::{AppErr, AppResult},
    protocol::{ChatLine, Role, WhiteboardEvent},
    state::{RoomEvent, Rooms},
    status::Status,
    store::{Entry, Patient, Store},
};

/// Live entry that belongs to `doctor_id`, otherwise `UnknownEntry`.
pub async fn live_entry(store: &Store, doctor_id: i64, entry_id: i64) -> AppResult<Entry> {
    match store.get_entry(entry_id).await {
        Ok(e) if e.doctor_id == doctor_id && !e.status.is_terminal() => Ok(e),
        Ok(_) | Err(AppErr::UnknownEntry(_)) => Err(AppErr::UnknownEntry(entry_id)),
        Err(e) => Err(e),
    }
}

/// Puts `patient` in the queue. Returns the entry and whether it is new;
/// an already-live entry is reattached rather than duplicated.
pub async fn enqueue(
    store: &Store,
    rooms: &Rooms,
    doctor_id: i64,
    patient: &Patient,
    added_by_doctor: bool,
) -> AppResult<(Entry, bool)> {
    if let Some(e) = store.live_entry_for(doctor_id, patient.id).await? {
        return Ok((e, false));
    }
    let e = store.create_entry(doctor_id, patient.id, added_by_doctor).await?;
    tracing::info!(doctor_id, entry_id = e.id, added_by_doctor, "patient queued");
    rooms.publish(doctor_id, RoomEvent::QueueChanged).await;
    Ok((e, true))
}

pub async fn transition(store: &Store, rooms: &Rooms, doctor_id: i64, entry_id: i64, to: Status) -> AppResult<Entry> {
    let cur = live_entry(store, doctor_id, entry_id).await?;
    cur.status.transition_to(to)?;
    let e = store.update_status(entry_id, cur.status, to).await?;
    tracing::info!(doctor_id, entry_id, from = %cur.status, to = %to, "status changed");
    if to.is_terminal() {
        rooms.publish(doctor_id, RoomEvent::Closed { entry_id, status: to }).await;
    }
    rooms.publish(doctor_id, RoomEvent::QueueChanged).await;
    Ok(e)
}

/// Doctor removal: every live status may go to `Cancelled`.
pub async fn remove(store: &Store, rooms: &Rooms, doctor_id: i64, entry_id: i64) -> AppResult<Entry> {
    transition(store, rooms, doctor_id, entry_id, Status::Cancelled).await
}

pub async fn toggle_whiteboard(store: &Store, rooms: &Rooms, doctor_id: i64, entry_id: i64) -> AppResult<Entry> {
    let cur = live_entry(store, doctor_id, entry_id).await?;
    if !cur.status.allows_whiteboard() {
        return Err(AppErr::WhiteboardUnavailable { id: entry_id, status: cur.status });
    }
    let active = !cur.whiteboard_active;
    store.set_whiteboard_active(entry_id, active).await?;
    tracing::debug!(doctor_id, entry_id, active, "whiteboard toggled");
    rooms.publish(doctor_id, RoomEvent::WhiteboardToggled { entry_id, active }).await;
    rooms.publish(doctor_id, RoomEvent::QueueChanged).await;
    store.get_entry(entry_id).await
}

pub async fn draw(
    store: &Store,
    rooms: &Rooms,
    doctor_id: i64,
    entry_id: i64,
    from: Role,
    event: WhiteboardEvent,
) -> AppResult<()> {
    live_entry(store, doctor_id, entry_id).await?;
    store.append_whiteboard(entry_id, &event).await?;
    rooms.publish(doctor_id, RoomEvent::Whiteboard { entry_id, from, event }).await;
    Ok(())
}

pub async fn chat(
    store: &Store,
    rooms: &Rooms,
    doctor_id: i64,
    entry_id: i64,
    from: Role,
    text: &str,
) -> AppResult<ChatLine> {
    if text.trim().is_empty() {
        return Err(AppErr::Bad("empty chat message".into()));
    }
    live_entry(store, doctor_id, entry_id).await?;
    let line = store.append_chat(entry_id, from, text).await?;
    rooms.publish(doctor_id, RoomEvent::Chat(line.clone())).await;
    Ok(line)
}
