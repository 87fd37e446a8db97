//! Durable extraction history backed by SQLite.
//!
//! [`HistoryStore`] maps store-assigned integer ids to
//! [`ExtractionRecord`]s, with secondary indexes on `state` and
//! `upload_date`. Every public operation is an `async fn` that runs exactly
//! one SQLite transaction on Tokio's blocking pool, so each call is atomic on
//! its own. Nothing coordinates *separate* calls: two flows updating the same
//! id concurrently end with whichever transaction commits last.
//!
//! The connection is opened lazily on first use and then shared by every
//! clone of the store. Opening is idempotent and safe to race; only one
//! caller performs the setup.

use crate::error::ScanError;
use crate::record::{
    Attributes, ExtractionRecord, ExtractionState, FieldMap, NewRecord, RecordId, RecordPatch,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub mod migrations;

const SELECT_COLUMNS: &str =
    "SELECT id, state, upload_date, pdf_data, fields_data, attributes FROM extraction_history";

// ── Location ─────────────────────────────────────────────────────────────

/// Where the history database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// On-disk database file; parent directories are created on open.
    File(PathBuf),
    /// Private in-memory database, discarded with the store.
    InMemory,
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::File(path) => write!(f, "{}", path.display()),
            StoreLocation::InMemory => f.write_str(":memory:"),
        }
    }
}

/// Returns the default database path: `~/.fieldscan/history.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".fieldscan").join("history.db"))
}

// ── Connection handle ────────────────────────────────────────────────────

/// Single rusqlite connection shared behind a mutex.
///
/// Cloning is cheap (inner `Arc`).
#[derive(Clone)]
struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database and runs all pending migrations.
    fn open(location: &StoreLocation) -> Result<Self, ScanError> {
        let unavailable = |detail: String| ScanError::StoreUnavailable {
            location: location.to_string(),
            detail,
        };

        let mut conn = match location {
            StoreLocation::File(path) => {
                ensure_parent_dir(path).map_err(|e| unavailable(e.to_string()))?;
                let conn = Connection::open(path).map_err(|e| unavailable(e.to_string()))?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")
                    .map_err(|e| unavailable(e.to_string()))?;
                conn
            }
            StoreLocation::InMemory => {
                Connection::open_in_memory().map_err(|e| unavailable(e.to_string()))?
            }
        };

        migrations::run_all(&mut conn).map_err(|e| unavailable(format!("migration failed: {e}")))?;

        info!("History store opened at {}", location);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    fn with_conn<F, T>(&self, f: F) -> Result<T, ScanError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ScanError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| ScanError::Internal("history store lock poisoned".into()))?;
        f(&mut *conn)
    }
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

// ── Stored row ───────────────────────────────────────────────────────────

/// A raw row, before `fields_data` and `attributes` are decoded.
struct StoredRow {
    id: RecordId,
    state: String,
    upload_date: String,
    pdf_data: Option<String>,
    fields_data: Option<String>,
    attributes: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            state: row.get("state")?,
            upload_date: row.get("upload_date")?,
            pdf_data: row.get("pdf_data")?,
            fields_data: row.get("fields_data")?,
            attributes: row.get("attributes")?,
        })
    }

    /// Materialise the serialized columns back into live values.
    fn into_record(self) -> Result<ExtractionRecord, ScanError> {
        let id = self.id;
        let corrupt = |detail: String| ScanError::CorruptRecord { id, detail };

        let state = self
            .state
            .parse::<ExtractionState>()
            .map_err(|e| corrupt(e.to_string()))?;

        let fields_data = match self.fields_data.as_deref() {
            Some(json) => serde_json::from_str::<FieldMap>(json)
                .map_err(|e| corrupt(format!("fieldsData: {e}")))?,
            None => FieldMap::new(),
        };

        let attributes = serde_json::from_str::<Attributes>(&self.attributes)
            .map_err(|e| corrupt(format!("attributes: {e}")))?;

        Ok(ExtractionRecord {
            id,
            state,
            upload_date: self.upload_date,
            pdf_data: self.pdf_data,
            fields_data,
            attributes,
        })
    }
}

fn find_row(conn: &Connection, id: RecordId) -> Result<Option<StoredRow>, rusqlite::Error> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE id = ?1"),
        params![id],
        StoredRow::from_row,
    )
    .optional()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ScanError> {
    serde_json::to_string(value).map_err(|e| ScanError::Internal(format!("serialize: {e}")))
}

/// Current time as an ISO-8601 UTC timestamp with millisecond precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Store ────────────────────────────────────────────────────────────────

/// Async facade over the history database.
///
/// Clones share the same lazily opened connection.
#[derive(Clone)]
pub struct HistoryStore {
    location: Arc<StoreLocation>,
    db: Arc<OnceCell<Database>>,
}

impl fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryStore")
            .field("location", &self.location)
            .field("opened", &self.db.initialized())
            .finish()
    }
}

impl HistoryStore {
    /// Create a store for `location`. Nothing is opened until first use.
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location: Arc::new(location),
            db: Arc::new(OnceCell::new()),
        }
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Self {
        Self::new(StoreLocation::InMemory)
    }

    /// Store at [`default_database_path`].
    pub fn at_default_path() -> Result<Self, ScanError> {
        let path = default_database_path().ok_or_else(|| ScanError::StoreUnavailable {
            location: "~/.fieldscan/history.db".into(),
            detail: "home directory could not be determined".into(),
        })?;
        Ok(Self::new(StoreLocation::File(path)))
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Open the database now instead of on first use.
    pub async fn init(&self) -> Result<(), ScanError> {
        self.database().await.map(|_| ())
    }

    /// One-time setup accessor; later calls return the cached handle.
    async fn database(&self) -> Result<Database, ScanError> {
        let db = self
            .db
            .get_or_try_init(|| {
                let location = Arc::clone(&self.location);
                async move {
                    tokio::task::spawn_blocking(move || Database::open(&location))
                        .await
                        .map_err(|e| ScanError::Internal(format!("Store open task panicked: {e}")))?
                }
            })
            .await?;
        Ok(db.clone())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, op: &'static str, f: F) -> Result<T, ScanError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ScanError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.database().await?;
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ScanError::Internal(format!("Store {op} task panicked: {e}")))?
    }

    /// Insert a new record and return its id.
    ///
    /// `upload_date` defaults to now; the `pdfData` alias is normalised.
    pub async fn create(&self, record: NewRecord) -> Result<RecordId, ScanError> {
        let record = record.normalized();
        let upload_date = record.upload_date.unwrap_or_else(now_iso8601);
        let fields_json = record.fields_data.as_ref().map(to_json).transpose()?;
        let attributes_json = to_json(&record.attributes)?;
        let state = record.state;
        let pdf_data = record.pdf_data;

        let id = self
            .run("create", move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO extraction_history
                     (state, upload_date, pdf_data, fields_data, attributes)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        state.as_str(),
                        upload_date,
                        pdf_data,
                        fields_json,
                        attributes_json
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await?;

        debug!("Created record {} in state {}", id, state);
        Ok(id)
    }

    /// Set the lifecycle state of a record.
    pub async fn update_state(
        &self,
        id: RecordId,
        state: ExtractionState,
    ) -> Result<(), ScanError> {
        self.run("update_state", move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE extraction_history SET state = ?2 WHERE id = ?1",
                params![id, state.as_str()],
            )?;
            if changed == 0 {
                return Err(ScanError::NotFound { id });
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!("Record {} → {}", id, state);
        Ok(())
    }

    /// Shallow-merge `patch` onto the stored record and return its id.
    ///
    /// The stored `fieldsData` is re-serialized only when the patch carries a
    /// field map; otherwise the existing value is kept as is.
    pub async fn update_data(&self, id: RecordId, patch: RecordPatch) -> Result<RecordId, ScanError> {
        let patch = patch.normalized();

        self.run("update_data", move |conn| {
            let tx = conn.transaction()?;
            let row = find_row(&tx, id)?.ok_or(ScanError::NotFound { id })?;

            let fields_json = match patch.fields_data.as_ref() {
                Some(fields) => Some(to_json(fields)?),
                None => row.fields_data.clone(),
            };

            let mut record = row.into_record()?;
            record.apply(patch);

            tx.execute(
                "UPDATE extraction_history
                 SET state = ?2, pdf_data = ?3, fields_data = ?4, attributes = ?5
                 WHERE id = ?1",
                params![
                    id,
                    record.state.as_str(),
                    record.pdf_data,
                    fields_json,
                    to_json(&record.attributes)?
                ],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Snapshot of all records, newest `upload_date` first.
    ///
    /// Records sharing a timestamp are ordered by id, newest first.
    pub async fn list(&self) -> Result<Vec<ExtractionRecord>, ScanError> {
        self.run("list", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY upload_date DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map([], StoredRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(StoredRow::into_record).collect()
        })
        .await
    }

    /// Snapshot of the records in `state`, same ordering as [`Self::list`].
    pub async fn list_by_state(
        &self,
        state: ExtractionState,
    ) -> Result<Vec<ExtractionRecord>, ScanError> {
        self.run("list_by_state", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE state = ?1 ORDER BY upload_date DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map(params![state.as_str()], StoredRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(StoredRow::into_record).collect()
        })
        .await
    }

    /// Fetch one record; `Ok(None)` when the id does not exist.
    pub async fn get(&self, id: RecordId) -> Result<Option<ExtractionRecord>, ScanError> {
        self.run("get", move |conn| {
            find_row(conn, id)?.map(StoredRow::into_record).transpose()
        })
        .await
    }

    /// Remove a record. Deleting an absent id is a no-op.
    pub async fn delete(&self, id: RecordId) -> Result<(), ScanError> {
        let removed = self
            .run("delete", move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM extraction_history WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(removed)
            })
            .await?;

        if removed == 0 {
            debug!("Delete of record {} was a no-op (absent)", id);
        }
        Ok(())
    }

    /// Number of stored records.
    pub async fn count(&self) -> Result<usize, ScanError> {
        self.run("count", |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM extraction_history", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PDF_DATA_ALIAS;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn create_then_get_round_trips_fields() {
        let store = HistoryStore::in_memory();
        let original = fields(&[("name", "山田太郎"), ("date", "2024-01-01"), ("memo", "")]);

        let id = store
            .create(NewRecord::new(ExtractionState::Uploaded).fields(original.clone()))
            .await
            .unwrap();

        let rec = store.get(id).await.unwrap().expect("record exists");
        assert_eq!(rec.id, id);
        assert_eq!(rec.state, ExtractionState::Uploaded);
        assert_eq!(rec.fields_data, original);
        assert!(!rec.upload_date.is_empty());
    }

    #[tokio::test]
    async fn missing_fields_read_back_as_empty_map() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Uploaded))
            .await
            .unwrap();
        let rec = store.get(id).await.unwrap().unwrap();
        assert!(rec.fields_data.is_empty());
    }

    #[tokio::test]
    async fn alias_is_normalised_on_create_and_update() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Uploaded).attribute(PDF_DATA_ALIAS, "AAAA"))
            .await
            .unwrap();

        let rec = store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.pdf_data.as_deref(), Some("AAAA"));
        assert!(rec.attribute(PDF_DATA_ALIAS).is_none());

        store
            .update_data(id, RecordPatch::new().attribute(PDF_DATA_ALIAS, "BBBB"))
            .await
            .unwrap();
        let rec = store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.pdf_data.as_deref(), Some("BBBB"));
        assert!(rec.attribute(PDF_DATA_ALIAS).is_none());
    }

    #[tokio::test]
    async fn list_orders_by_upload_date_descending() {
        let store = HistoryStore::in_memory();
        for date in [
            "2024-03-01T00:00:00.000Z",
            "2024-01-01T00:00:00.000Z",
            "2024-05-01T00:00:00.000Z",
        ] {
            store
                .create(NewRecord::new(ExtractionState::Completed).upload_date(date))
                .await
                .unwrap();
        }
        // Earlier than everything else: must land last.
        let earliest = store
            .create(
                NewRecord::new(ExtractionState::Completed).upload_date("2023-12-31T23:59:59.999Z"),
            )
            .await
            .unwrap();

        let dates: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.upload_date)
            .collect();
        assert_eq!(
            dates,
            vec![
                "2024-05-01T00:00:00.000Z",
                "2024-03-01T00:00:00.000Z",
                "2024-01-01T00:00:00.000Z",
                "2023-12-31T23:59:59.999Z",
            ]
        );
        assert_eq!(store.list().await.unwrap().last().unwrap().id, earliest);
    }

    #[tokio::test]
    async fn equal_timestamps_list_newest_id_first() {
        let store = HistoryStore::in_memory();
        let date = "2024-01-01T00:00:00.000Z";
        let a = store
            .create(NewRecord::new(ExtractionState::Uploaded).upload_date(date))
            .await
            .unwrap();
        let b = store
            .create(NewRecord::new(ExtractionState::Uploaded).upload_date(date))
            .await
            .unwrap();

        let ids: Vec<RecordId> = store.list().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn list_is_a_snapshot() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Uploaded))
            .await
            .unwrap();
        let snapshot = store.list().await.unwrap();
        store.delete(id).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Failed))
            .await
            .unwrap();

        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        store.delete(id).await.unwrap();
        store.delete(9_999).await.unwrap();
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let store = HistoryStore::in_memory();
        let first = store
            .create(NewRecord::new(ExtractionState::Uploaded))
            .await
            .unwrap();
        store.delete(first).await.unwrap();
        let second = store
            .create(NewRecord::new(ExtractionState::Uploaded))
            .await
            .unwrap();
        assert!(second > first, "{second} should be greater than {first}");
    }

    #[tokio::test]
    async fn updates_on_missing_id_are_not_found() {
        let store = HistoryStore::in_memory();
        let err = store
            .update_state(41, ExtractionState::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NotFound { id: 41 }));

        let err = store
            .update_data(41, RecordPatch::new().fields(FieldMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NotFound { id: 41 }));
    }

    #[tokio::test]
    async fn update_data_keeps_fields_when_patch_has_none() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(
                NewRecord::new(ExtractionState::Completed)
                    .fields(fields(&[("name", "Taro Yamada")])),
            )
            .await
            .unwrap();

        let returned = store
            .update_data(id, RecordPatch::new().attribute("reviewed", true))
            .await
            .unwrap();
        assert_eq!(returned, id);

        let rec = store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.fields_data, fields(&[("name", "Taro Yamada")]));
        assert_eq!(rec.attribute("reviewed"), Some(&json!(true)));
        assert_eq!(rec.state, ExtractionState::Completed);
    }

    #[tokio::test]
    async fn update_data_twice_with_same_patch_is_idempotent() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Completed).attribute("note", "a"))
            .await
            .unwrap();
        let patch = RecordPatch::new()
            .fields(fields(&[("date", "2024-01-01")]))
            .attribute("note", "b");

        store.update_data(id, patch.clone()).await.unwrap();
        let once = store.get(id).await.unwrap().unwrap();
        store.update_data(id, patch).await.unwrap();
        let twice = store.get(id).await.unwrap().unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn upload_date_cannot_be_patched() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Uploaded).upload_date("2024-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        store
            .update_data(id, RecordPatch::new().attribute("upload_date", "1999-01-01"))
            .await
            .unwrap();
        let rec = store.get(id).await.unwrap().unwrap();
        assert_eq!(rec.upload_date, "2024-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn list_by_state_filters() {
        let store = HistoryStore::in_memory();
        let done = store
            .create(NewRecord::new(ExtractionState::Completed))
            .await
            .unwrap();
        store
            .create(NewRecord::new(ExtractionState::Failed))
            .await
            .unwrap();

        let completed = store
            .list_by_state(ExtractionState::Completed)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");

        let id = {
            let store = HistoryStore::new(StoreLocation::File(path.clone()));
            store
                .create(NewRecord::new(ExtractionState::Completed).fields(fields(&[("k", "v")])))
                .await
                .unwrap()
        };

        let reopened = HistoryStore::new(StoreLocation::File(path.clone()));
        let rec = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(rec.fields_data, fields(&[("k", "v")]));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn unopenable_location_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let store = HistoryStore::new(StoreLocation::File(blocker.join("history.db")));
        let err = store.list().await.unwrap_err();
        assert!(matches!(err, ScanError::StoreUnavailable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn corrupt_fields_surface_as_corrupt_record() {
        let store = HistoryStore::in_memory();
        let id = store
            .create(NewRecord::new(ExtractionState::Completed))
            .await
            .unwrap();
        store
            .run("corrupt", move |conn| {
                conn.execute(
                    "UPDATE extraction_history SET fields_data = 'not json' WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let err = store.get(id).await.unwrap_err();
        assert!(matches!(err, ScanError::CorruptRecord { .. }), "got {err:?}");
    }

    #[test]
    fn default_path_lives_under_home() {
        if let Some(path) = default_database_path() {
            assert!(path.ends_with("history.db"));
            assert!(path.to_string_lossy().contains(".fieldscan"));
        }
    }

    #[test]
    fn timestamps_are_iso8601_utc() {
        let ts = now_iso8601();
        assert!(ts.ends_with('Z'), "got {ts}");
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
    }
}
