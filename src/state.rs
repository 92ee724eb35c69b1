use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::{
    protocol::{ChatLine, Role, WhiteboardEvent},
    status::Status,
};

pub type ConnId = String;

pub fn conn_id() -> ConnId { nanoid::nanoid!(10) }

/* ------------ events published into a doctor's room ------------ */
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Something in the live queue changed; re-read the snapshot.
    QueueChanged,
    /// Entry reached Done/Cancelled.
    Closed { entry_id: i64, status: Status },
    Chat(ChatLine),
    Whiteboard { entry_id: i64, from: Role, event: WhiteboardEvent },
    WhiteboardToggled { entry_id: i64, active: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Per-room, strictly increasing in delivery order.
    pub seq: u64,
    pub event: RoomEvent,
}

pub type Tx = broadcast::Sender<Arc<Envelope>>;

/* ------------ one room per doctor ------------ */
struct RoomState {
    tx: Tx,
    members: HashMap<ConnId, Role>,
    /// Last sequence number sent; held across the send so seq order is send order.
    seq: Arc<Mutex<u64>>,
}

/// Handle returned by [`Rooms::join`]; give it back to [`Rooms::leave`].
pub struct Subscription {
    pub doctor_id: i64,
    pub conn: ConnId,
    pub rx: broadcast::Receiver<Arc<Envelope>>,
}

/// Process-wide registry: doctor id -> subscribed connections.
///
/// Each room owns a bounded broadcast buffer. Publishing never waits on a
/// subscriber; one that falls behind loses the oldest events and sees
/// `RecvError::Lagged` on its next receive.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<RwLock<HashMap<i64, RoomState>>>,
    capacity: usize,
}

impl Default for Rooms {
    fn default() -> Self { Self::new(100) }
}

impl Rooms {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::default(), capacity: capacity.max(1) }
    }

    /// Creates the room on first join.
    pub async fn join(&self, doctor_id: i64, conn: ConnId, role: Role) -> Subscription {
        let mut m = self.inner.write().await;
        let st = m.entry(doctor_id).or_insert_with(|| {
            tracing::debug!(doctor_id, "room opened");
            RoomState { tx: broadcast::channel(self.capacity).0, members: HashMap::new(), seq: Arc::default() }
        });
        st.members.insert(conn.clone(), role);
        let rx = st.tx.subscribe();
        Subscription { doctor_id, conn, rx }
    }

    /// Drops the subscription; the room goes away with its last member.
    pub async fn leave(&self, sub: Subscription) {
        let Subscription { doctor_id, conn, rx } = sub;
        drop(rx);
        let mut m = self.inner.write().await;
        if let Some(st) = m.get_mut(&doctor_id) {
            st.members.remove(&conn);
            if st.members.is_empty() {
                m.remove(&doctor_id);
                tracing::debug!(doctor_id, "room closed");
            }
        }
    }

    /// Fan-out to everyone currently in the room. Returns the event's
    /// sequence number, or `None` when nobody is listening.
    pub async fn publish(&self, doctor_id: i64, event: RoomEvent) -> Option<u64> {
        let (tx, counter) = {
            let m = self.inner.read().await;
            let st = m.get(&doctor_id)?;
            (st.tx.clone(), st.seq.clone())
        };
        let mut last = counter.lock().await;
        let seq = *last + 1;
        tx.send(Arc::new(Envelope { seq, event })).ok()?;
        *last = seq;
        Some(seq)
    }

    pub async fn members(&self, doctor_id: i64) -> usize {
        self.inner.read().await.get(&doctor_id).map_or(0, |st| st.members.len())
    }

    pub async fn count_role(&self, doctor_id: i64, role: Role) -> usize {
        self.inner
            .read()
            .await
            .get(&doctor_id)
            .map_or(0, |st| st.members.values().filter(|r| **r == role).count())
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn join_creates_and_last_leave_prunes() {
        let rooms = Rooms::new(8);
        let a = rooms.join(1, conn_id(), Role::Doctor).await;
        let b = rooms.join(1, conn_id(), Role::Patient).await;
        assert_eq!(rooms.room_count().await, 1);
        assert_eq!(rooms.members(1).await, 2);
        assert_eq!(rooms.count_role(1, Role::Patient).await, 1);

        rooms.leave(a).await;
        assert_eq!(rooms.members(1).await, 1);
        rooms.leave(b).await;
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn every_member_gets_the_event() {
        let rooms = Rooms::new(8);
        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(rooms.join(7, conn_id(), Role::Patient).await);
        }
        assert_eq!(rooms.publish(7, RoomEvent::QueueChanged).await, Some(1));
        for s in subs.iter_mut() {
            let env = s.rx.recv().await.unwrap();
            assert_eq!(env.event, RoomEvent::QueueChanged);
            assert_eq!(env.seq, 1);
        }
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let rooms = Rooms::new(8);
        let mut one = rooms.join(1, conn_id(), Role::Doctor).await;
        let mut two = rooms.join(2, conn_id(), Role::Doctor).await;
        rooms.publish(1, RoomEvent::QueueChanged).await;
        assert!(one.rx.try_recv().is_ok());
        assert!(matches!(two.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn busy_room_does_not_hold_up_others() {
        let rooms = Rooms::new(8);
        let mut one = rooms.join(1, conn_id(), Role::Doctor).await;
        let _two = rooms.join(2, conn_id(), Role::Doctor).await;
        let counter = rooms.inner.read().await[&2].seq.clone();
        let _busy = counter.lock().await;

        let sent = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            rooms.publish(1, RoomEvent::QueueChanged),
        )
        .await;
        assert_eq!(sent.ok().flatten(), Some(1));
        assert!(one.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn concurrent_publishers_get_distinct_ordered_seqs() {
        let rooms = Rooms::new(64);
        let mut s = rooms.join(4, conn_id(), Role::Doctor).await;
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let rooms = rooms.clone();
            tasks.push(tokio::spawn(async move { rooms.publish(4, RoomEvent::QueueChanged).await }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_some());
        }
        for want in 1..=16u64 {
            assert_eq!(s.rx.recv().await.unwrap().seq, want);
        }
    }

    #[tokio::test]
    async fn publish_to_missing_room_is_noop() {
        let rooms = Rooms::new(8);
        assert_eq!(rooms.publish(42, RoomEvent::QueueChanged).await, None);
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn same_publisher_order_is_kept() {
        let rooms = Rooms::new(16);
        let mut s = rooms.join(3, conn_id(), Role::Doctor).await;
        for id in 1..=5 {
            rooms.publish(3, RoomEvent::WhiteboardToggled { entry_id: id, active: true }).await;
        }
        for want in 1..=5 {
            let env = s.rx.recv().await.unwrap();
            assert_eq!(env.seq, want as u64);
            assert_eq!(env.event, RoomEvent::WhiteboardToggled { entry_id: want, active: true });
        }
    }

    #[tokio::test]
    async fn slow_member_lags_without_blocking_publisher() {
        let rooms = Rooms::new(2);
        let mut slow = rooms.join(5, conn_id(), Role::Patient).await;
        for _ in 0..10 {
            assert!(rooms.publish(5, RoomEvent::QueueChanged).await.is_some());
        }
        assert!(matches!(slow.rx.recv().await, Err(RecvError::Lagged(8))));
        assert_eq!(slow.rx.recv().await.unwrap().seq, 9);
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_settle() {
        let rooms = Rooms::new(8);
        let mut tasks = Vec::new();
        for i in 0..20 {
            let rooms = rooms.clone();
            tasks.push(tokio::spawn(async move {
                let s = rooms.join(i % 3, conn_id(), Role::Patient).await;
                rooms.publish(i % 3, RoomEvent::QueueChanged).await;
                rooms.leave(s).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(rooms.room_count().await, 0);
    }
}
