//! Authoritative persistence for doctors, patients and queue entries (SQLite).

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, Sqlite, SqlitePool,
};
use std::{collections::HashSet, str::FromStr, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{bad, AppErr, AppResult},
    pin::PinAllocator,
    protocol::{ChatLine, Role, WhiteboardEvent},
    status::Status,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS doctors (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS patients (
        id    INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT NOT NULL UNIQUE,
        name  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS entries (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        doctor_id         INTEGER NOT NULL REFERENCES doctors(id) ON DELETE CASCADE,
        patient_id        INTEGER NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
        status            TEXT    NOT NULL DEFAULT 'Waiting',
        arrived_at        TEXT    NOT NULL,
        host_pin          TEXT,
        guest_pin         TEXT,
        added_by_doctor   INTEGER NOT NULL DEFAULT 0,
        whiteboard_active INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS entries_one_live
        ON entries (doctor_id, patient_id) WHERE status NOT IN ('Done', 'Cancelled')",
    "CREATE INDEX IF NOT EXISTS entries_by_doctor ON entries (doctor_id, arrived_at)",
    "CREATE TABLE IF NOT EXISTS live_pins (
        pin      TEXT PRIMARY KEY,
        entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE
    )",
    "CREATE TABLE IF NOT EXISTS whiteboard_events (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        body     TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
        sender   TEXT NOT NULL,
        body     TEXT NOT NULL,
        sent_at  TEXT NOT NULL
    )",
];

const ENTRY_SELECT: &str = "SELECT e.id, e.doctor_id, e.patient_id, p.name AS patient_name,
        p.token AS patient_token, e.status, e.arrived_at, e.host_pin, e.guest_pin,
        e.added_by_doctor, e.whiteboard_active
    FROM entries e JOIN patients p ON p.id = e.patient_id";

const LIVE: &str = "e.status NOT IN ('Done', 'Cancelled')";

#[derive(Debug, Clone, PartialEq, serde::Serialize, FromRow)]
pub struct Doctor {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub id: i64,
    pub token: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: i64,
    pub doctor_id: i64,
    pub patient_id: i64,
    pub patient_name: String,
    pub patient_token: Uuid,
    pub status: Status,
    pub arrived_at: DateTime<Utc>,
    pub host_pin: Option<String>,
    pub guest_pin: Option<String>,
    pub added_by_doctor: bool,
    pub whiteboard_active: bool,
}

#[derive(FromRow)]
struct PatientRow {
    id: i64,
    token: String,
    name: String,
}

impl TryFrom<PatientRow> for Patient {
    type Error = AppErr;
    fn try_from(r: PatientRow) -> AppResult<Self> {
        Ok(Patient { id: r.id, token: Uuid::parse_str(&r.token).map_err(bad)?, name: r.name })
    }
}

#[derive(FromRow)]
struct EntryRow {
    id: i64,
    doctor_id: i64,
    patient_id: i64,
    patient_name: String,
    patient_token: String,
    status: String,
    arrived_at: DateTime<Utc>,
    host_pin: Option<String>,
    guest_pin: Option<String>,
    added_by_doctor: bool,
    whiteboard_active: bool,
}

impl TryFrom<EntryRow> for Entry {
    type Error = AppErr;
    fn try_from(r: EntryRow) -> AppResult<Self> {
        Ok(Entry {
            id: r.id,
            doctor_id: r.doctor_id,
            patient_id: r.patient_id,
            patient_name: r.patient_name,
            patient_token: Uuid::parse_str(&r.patient_token).map_err(bad)?,
            status: r.status.parse()?,
            arrived_at: r.arrived_at,
            host_pin: r.host_pin,
            guest_pin: r.guest_pin,
            added_by_doctor: r.added_by_doctor,
            whiteboard_active: r.whiteboard_active,
        })
    }
}

fn entries(rows: Vec<EntryRow>) -> AppResult<Vec<Entry>> {
    rows.into_iter().map(Entry::try_from).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())
}

async fn taken_pins<'e, E>(ex: E) -> AppResult<HashSet<String>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> = sqlx::query_as("SELECT pin FROM live_pins").fetch_all(ex).await?;
    Ok(rows.into_iter().map(|(p,)| p).collect())
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    pins: PinAllocator,
    /// Serializes pin allocation + insert inside this process.
    admit: Arc<Mutex<()>>,
}

impl Store {
    pub async fn connect(url: &str, pins: PinAllocator) -> AppResult<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().max_connections(8).connect_with(opts).await?;
        Self::with_pool(pool, pins).await
    }

    /// Private in-memory database; one pinned connection so it never disappears.
    pub async fn memory(pins: PinAllocator) -> AppResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool, pins).await
    }

    pub async fn with_pool(pool: SqlitePool, pins: PinAllocator) -> AppResult<Self> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool, pins, admit: Arc::new(Mutex::new(())) })
    }

    /* ------------ doctors / patients ------------ */

    pub async fn create_doctor(&self, name: &str) -> AppResult<Doctor> {
        let id = sqlx::query("INSERT INTO doctors (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(Doctor { id, name: name.to_string() })
    }

    pub async fn get_doctor(&self, id: i64) -> AppResult<Option<Doctor>> {
        Ok(sqlx::query_as("SELECT id, name FROM doctors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_doctors(&self) -> AppResult<Vec<Doctor>> {
        Ok(sqlx::query_as("SELECT id, name FROM doctors ORDER BY name, id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn create_patient(&self, name: &str) -> AppResult<Patient> {
        let token = Uuid::new_v4();
        let id = sqlx::query("INSERT INTO patients (token, name) VALUES (?, ?)")
            .bind(token.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(Patient { id, token, name: name.to_string() })
    }

    pub async fn patient_by_token(&self, token: &Uuid) -> AppResult<Option<Patient>> {
        sqlx::query_as::<_, PatientRow>("SELECT id, token, name FROM patients WHERE token = ?")
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Patient::try_from)
            .transpose()
    }

    /* ------------ entries ------------ */

    pub async fn allocate_pins(&self) -> AppResult<(String, String)> {
        let taken = taken_pins(&self.pool).await?;
        self.pins.allocate(&taken)
    }

    /// New `Waiting` entry with fresh pins. If a live entry for the same
    /// doctor/patient already exists it is returned instead.
    pub async fn create_entry(&self, doctor_id: i64, patient_id: i64, added_by_doctor: bool) -> AppResult<Entry> {
        let _guard = self.admit.lock().await;
        if let Some(e) = self.live_entry_for(doctor_id, patient_id).await? {
            return Ok(e);
        }

        for attempt in 1..=self.pins.attempts() {
            let mut tx = self.pool.begin().await?;
            let taken = taken_pins(&mut *tx).await?;
            let (host, guest) = self.pins.allocate(&taken)?;

            let id = sqlx::query(
                "INSERT INTO entries (doctor_id, patient_id, status, arrived_at, host_pin, guest_pin, added_by_doctor)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(doctor_id)
            .bind(patient_id)
            .bind(Status::Waiting.as_str())
            .bind(Utc::now())
            .bind(&host)
            .bind(&guest)
            .bind(added_by_doctor)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            let pinned = sqlx::query("INSERT INTO live_pins (pin, entry_id) VALUES (?, ?), (?, ?)")
                .bind(&host)
                .bind(id)
                .bind(&guest)
                .bind(id)
                .execute(&mut *tx)
                .await;
            match pinned {
                Ok(_) => {
                    tx.commit().await?;
                    tracing::debug!(entry_id = id, doctor_id, attempt, "entry created");
                    return self.get_entry(id).await;
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(doctor_id, attempt, "pin collision, retrying");
                    tx.rollback().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppErr::PinExhausted(self.pins.attempts()))
    }

    /// Any entry by id, terminal ones included.
    pub async fn get_entry(&self, id: i64) -> AppResult<Entry> {
        let sql = format!("{ENTRY_SELECT} WHERE e.id = ?");
        let row = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppErr::UnknownEntry(id))?;
        row.try_into()
    }

    pub async fn live_entry_for(&self, doctor_id: i64, patient_id: i64) -> AppResult<Option<Entry>> {
        let sql = format!("{ENTRY_SELECT} WHERE e.doctor_id = ? AND e.patient_id = ? AND {LIVE}");
        sqlx::query_as::<_, EntryRow>(&sql)
            .bind(doctor_id)
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Entry::try_from)
            .transpose()
    }

    /// Most recent live entry of the patient holding `token`, for any doctor.
    pub async fn live_entry_by_token(&self, token: &Uuid) -> AppResult<Option<Entry>> {
        let sql = format!("{ENTRY_SELECT} WHERE p.token = ? AND {LIVE} ORDER BY e.arrived_at DESC, e.id DESC LIMIT 1");
        sqlx::query_as::<_, EntryRow>(&sql)
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Entry::try_from)
            .transpose()
    }

    /// Non-terminal entries of one doctor, oldest arrival first.
    pub async fn list_active(&self, doctor_id: i64) -> AppResult<Vec<Entry>> {
        let sql = format!("{ENTRY_SELECT} WHERE e.doctor_id = ? AND {LIVE} ORDER BY e.arrived_at, e.id");
        entries(sqlx::query_as(&sql).bind(doctor_id).fetch_all(&self.pool).await?)
    }

    /// Terminal entries, most recent first; `only` narrows to one terminal status.
    pub async fn list_history(&self, doctor_id: i64, only: Option<Status>) -> AppResult<Vec<Entry>> {
        let statuses: Vec<&str> = match only {
            Some(s) if s.is_terminal() => vec![s.as_str()],
            Some(s) => return Err(AppErr::Bad(format!("{s} is not a history status"))),
            None => vec![Status::Done.as_str(), Status::Cancelled.as_str()],
        };
        let sql = format!(
            "{ENTRY_SELECT} WHERE e.doctor_id = ? AND e.status IN (?, ?) ORDER BY e.arrived_at DESC, e.id DESC"
        );
        let second = statuses.get(1).copied().unwrap_or(statuses[0]);
        entries(
            sqlx::query_as(&sql)
                .bind(doctor_id)
                .bind(statuses[0])
                .bind(second)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Compare-and-persist: only applies if the row is still in `from`.
    /// Leaving a whiteboard-capable status closes the whiteboard; reaching a
    /// terminal status frees both pins.
    pub async fn update_status(&self, id: i64, from: Status, to: Status) -> AppResult<Entry> {
        let mut tx = self.pool.begin().await?;
        let done = sqlx::query(
            "UPDATE entries
                SET status = ?,
                    whiteboard_active = CASE WHEN ? THEN whiteboard_active ELSE 0 END
              WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(to.allows_whiteboard())
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(AppErr::Conflict(id));
        }
        if to.is_terminal() {
            sqlx::query("DELETE FROM live_pins WHERE entry_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.get_entry(id).await
    }

    /* ------------ whiteboard ------------ */

    /// Appends only while the board is open on a live, in-consultation entry.
    pub async fn append_whiteboard(&self, id: i64, event: &WhiteboardEvent) -> AppResult<Entry> {
        let body = serde_json::to_string(event).map_err(bad)?;
        let done = sqlx::query(
            "INSERT INTO whiteboard_events (entry_id, body)
             SELECT id, ? FROM entries
              WHERE id = ? AND whiteboard_active = 1 AND status IN ('In Progress', 'In Call')",
        )
        .bind(body)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(AppErr::WhiteboardInactive(id));
        }
        self.get_entry(id).await
    }

    pub async fn whiteboard_log(&self, id: i64) -> AppResult<Vec<WhiteboardEvent>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM whiteboard_events WHERE entry_id = ? ORDER BY id")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(bad))
            .collect()
    }

    /// Turning the board on needs `In Progress`/`In Call`; turning it off always works.
    pub async fn set_whiteboard_active(&self, id: i64, active: bool) -> AppResult<()> {
        let done = sqlx::query(
            "UPDATE entries SET whiteboard_active = ?
              WHERE id = ? AND status NOT IN ('Done', 'Cancelled')
                AND (? = 0 OR status IN ('In Progress', 'In Call'))",
        )
        .bind(active)
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            let e = self.get_entry(id).await?;
            return Err(AppErr::WhiteboardUnavailable { id, status: e.status });
        }
        Ok(())
    }

    /* ------------ chat ------------ */

    pub async fn append_chat(&self, entry_id: i64, from: Role, text: &str) -> AppResult<ChatLine> {
        let sent_at = Utc::now();
        sqlx::query("INSERT INTO chat_messages (entry_id, sender, body, sent_at) VALUES (?, ?, ?, ?)")
            .bind(entry_id)
            .bind(from.as_str())
            .bind(text)
            .bind(sent_at)
            .execute(&self.pool)
            .await?;
        Ok(ChatLine { entry_id, from, text: text.to_string(), sent_at })
    }

    pub async fn chat_log(&self, entry_id: i64) -> AppResult<Vec<ChatLine>> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT sender, body, sent_at FROM chat_messages WHERE entry_id = ? ORDER BY id",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(sender, text, sent_at)| ChatLine {
                entry_id,
                from: if sender == Role::Doctor.as_str() { Role::Doctor } else { Role::Patient },
                text,
                sent_at,
            })
            .collect())
    }
}
