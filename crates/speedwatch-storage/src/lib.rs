use rusqlite::{params, Connection, OptionalExtension, Row};
use speedwatch_core::{IdentityResolution, MeasurementResult, OfficeRecord};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

pub const SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("seed file error: {0}")]
    Seed(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}

/// Office lookups consumed by the hub before a stream opens.
pub trait OfficeDirectory: Send + Sync {
    fn office(&self, office_id: &str) -> Result<Option<OfficeRecord>, StorageError>;
}

/// The one write the measurement engine performs.
pub trait ResultSink: Send + Sync {
    /// Returns `false` when a record for the same request already exists.
    fn create_result(&self, result: &MeasurementResult) -> Result<bool, StorageError>;
}

pub struct SpeedwatchStore {
    conn: Mutex<Connection>,
}

impl SpeedwatchStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::Seed(format!("{}: {err}", parent.display())))?;
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        let conn = self.conn()?;
        if current < 1 {
            conn.execute_batch(include_str!("../migrations/0001_speedwatch_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            conn.execute_batch(include_str!("../migrations/0002_result_details.sql"))?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn upsert_office(&self, office: &OfficeRecord) -> Result<(), StorageError> {
        let isp_names_json = serde_json::to_string(&office.isp_names)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let sections_json = serde_json::to_string(&office.sections)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn()?.execute(
            "
            INSERT INTO offices (id, name, isp_names_json, sections_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                isp_names_json=excluded.isp_names_json,
                sections_json=excluded.sections_json
            ",
            params![office.id, office.name, isp_names_json, sections_json],
        )?;
        Ok(())
    }

    /// Loads `[{"id","name","ispNames","sections"}]` and upserts each office.
    pub fn seed_offices_from_file(&self, path: impl AsRef<Path>) -> Result<usize, StorageError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| StorageError::Seed(format!("{}: {err}", path.display())))?;
        let offices: Vec<OfficeRecord> = serde_json::from_str(&text)
            .map_err(|err| StorageError::Seed(format!("{}: {err}", path.display())))?;
        for office in &offices {
            self.upsert_office(office)?;
        }
        info!(
            event = "offices_seeded",
            path = %path.display(),
            count = offices.len()
        );
        Ok(offices.len())
    }

    pub fn offices(&self) -> Result<Vec<OfficeRecord>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, name, isp_names_json, sections_json
            FROM offices
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([], office_from_row)?;
        let mut offices = Vec::new();
        for row in rows {
            offices.push(row?);
        }
        Ok(offices)
    }

    pub fn results_for_office(
        &self,
        office_id: &str,
    ) -> Result<Vec<MeasurementResult>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "
            SELECT request_id, office_id, section, download_mbps, upload_mbps, ping_ms,
                   jitter_ms, packet_loss, server_id, server_name, isp_name, raw_data,
                   measured_at, isp_validation_json, client_ip, server_location, result_url
            FROM measurement_results
            WHERE office_id = ?1
            ORDER BY measured_at ASC, request_id ASC
            ",
        )?;
        let rows = stmt.query_map([office_id], result_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn result_count(&self, office_id: &str) -> Result<i64, StorageError> {
        Ok(self.conn()?.query_row(
            "SELECT COUNT(*) FROM measurement_results WHERE office_id = ?1",
            [office_id],
            |row| row.get(0),
        )?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn()?
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl OfficeDirectory for SpeedwatchStore {
    fn office(&self, office_id: &str) -> Result<Option<OfficeRecord>, StorageError> {
        let office = self
            .conn()?
            .query_row(
                "
                SELECT id, name, isp_names_json, sections_json
                FROM offices
                WHERE id = ?1
                ",
                [office_id],
                office_from_row,
            )
            .optional()?;
        Ok(office)
    }
}

impl ResultSink for SpeedwatchStore {
    fn create_result(&self, result: &MeasurementResult) -> Result<bool, StorageError> {
        let validation_json = result
            .isp_validation
            .as_ref()
            .map(|validation| {
                serde_json::to_string(validation)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;

        let changes = self.conn()?.execute(
            "
            INSERT OR IGNORE INTO measurement_results (
                request_id,
                office_id,
                section,
                download_mbps,
                upload_mbps,
                ping_ms,
                jitter_ms,
                packet_loss,
                server_id,
                server_name,
                isp_name,
                raw_data,
                measured_at,
                isp_validation_json,
                client_ip,
                server_location,
                result_url
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ",
            params![
                result.request_id,
                result.office_id,
                result.section,
                result.download_mbps,
                result.upload_mbps,
                result.ping_ms,
                result.jitter_ms,
                result.packet_loss,
                result.server_id,
                result.server_name,
                result.isp_name,
                result.raw_data,
                result.measured_at,
                validation_json,
                result.client_ip,
                result.server_location,
                result.result_url,
            ],
        )?;

        Ok(changes > 0)
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    text: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(text).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn office_from_row(row: &Row<'_>) -> Result<OfficeRecord, rusqlite::Error> {
    let isp_names_json: String = row.get(2)?;
    let sections_json: String = row.get(3)?;
    Ok(OfficeRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        isp_names: json_column(2, &isp_names_json)?,
        sections: json_column(3, &sections_json)?,
    })
}

fn result_from_row(row: &Row<'_>) -> Result<MeasurementResult, rusqlite::Error> {
    let validation_json: Option<String> = row.get(13)?;
    let isp_validation = validation_json
        .as_deref()
        .map(|text| json_column::<IdentityResolution>(13, text))
        .transpose()?;
    Ok(MeasurementResult {
        request_id: row.get(0)?,
        office_id: row.get(1)?,
        section: row.get(2)?,
        download_mbps: row.get(3)?,
        upload_mbps: row.get(4)?,
        ping_ms: row.get(5)?,
        jitter_ms: row.get(6)?,
        packet_loss: row.get(7)?,
        server_id: row.get(8)?,
        server_name: row.get(9)?,
        isp_name: row.get(10)?,
        raw_data: row.get(11)?,
        measured_at: row.get(12)?,
        isp_validation,
        client_ip: row.get(14)?,
        server_location: row.get(15)?,
        result_url: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn office() -> OfficeRecord {
        OfficeRecord {
            id: "office-1".to_string(),
            name: "Makati".to_string(),
            isp_names: vec!["PLDT".to_string(), "Globe".to_string()],
            sections: vec!["Finance".to_string()],
        }
    }

    fn result(request_id: &str) -> MeasurementResult {
        MeasurementResult {
            request_id: request_id.to_string(),
            office_id: "office-1".to_string(),
            section: Some("Finance".to_string()),
            download_mbps: 91.2,
            upload_mbps: 38.7,
            ping_ms: 13.9,
            jitter_ms: 1.2,
            packet_loss: 0.0,
            server_id: Some("10493".to_string()),
            server_name: Some("Example Telco".to_string()),
            isp_name: "PLDT".to_string(),
            isp_validation: Some(IdentityResolution {
                is_match: true,
                confidence: 100,
                proceed: true,
                claimed: "PLDT".to_string(),
                detected: "PLDT Inc.".to_string(),
                canonical_claimed: "PLDT".to_string(),
                canonical_detected: "PLDT".to_string(),
                suggestion: None,
            }),
            client_ip: Some("203.0.113.9".to_string()),
            server_location: Some("Manila, Philippines".to_string()),
            result_url: None,
            raw_data: "{\"tool\":{}}".to_string(),
            measured_at: "2026-03-02T04:30:00Z".to_string(),
        }
    }

    #[test]
    fn migration_creates_tables() {
        let store = SpeedwatchStore::open_in_memory().expect("open db");
        assert!(store.table_exists("offices").expect("table check"));
        assert!(store.table_exists("measurement_results").expect("table check"));
        assert_eq!(store.schema_version().expect("version"), SCHEMA_VERSION);
        store.migrate().expect("migrate twice");
    }

    #[test]
    fn office_roundtrip() {
        let store = SpeedwatchStore::open_in_memory().expect("open db");
        store.upsert_office(&office()).expect("upsert");
        let loaded = store.office("office-1").expect("query").expect("office");
        assert_eq!(loaded, office());
        assert!(store.office("missing").expect("query").is_none());
    }

    #[test]
    fn create_result_is_idempotent_per_request() {
        let store = SpeedwatchStore::open_in_memory().expect("open db");
        store.upsert_office(&office()).expect("upsert");
        assert!(store.create_result(&result("req-1")).expect("first"));
        assert!(!store.create_result(&result("req-1")).expect("second"));
        assert!(store.create_result(&result("req-2")).expect("other request"));
        assert_eq!(store.result_count("office-1").expect("count"), 2);

        let stored = store.results_for_office("office-1").expect("results");
        assert_eq!(stored[0], result("req-1"));
    }

    #[test]
    fn concurrent_writers_share_one_connection() {
        let store = Arc::new(SpeedwatchStore::open_in_memory().expect("open db"));
        store.upsert_office(&office()).expect("upsert");
        let handles = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.create_result(&result("req-race")).expect("write"))
            })
            .collect::<Vec<_>>();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|saved| *saved)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(store.result_count("office-1").expect("count"), 1);
    }

    #[test]
    fn seed_file_populates_offices() {
        let mut seed = NamedTempFile::new().expect("temp file");
        write!(
            seed,
            r#"[{{"id":"office-1","name":"Makati","ispNames":["PLDT","Globe"],"sections":["Finance"]}},
               {{"id":"office-2","name":"Cebu"}}]"#
        )
        .expect("write seed");

        let dir = tempfile::tempdir().expect("temp dir");
        let store = SpeedwatchStore::open(dir.path().join("nested").join("speedwatch.db"))
            .expect("open file db");
        assert_eq!(store.seed_offices_from_file(seed.path()).expect("seed"), 2);
        let offices = store.offices().expect("offices");
        assert_eq!(offices.len(), 2);
        assert_eq!(offices[0], office());
        assert!(offices[1].isp_names.is_empty());
    }

    #[test]
    fn malformed_seed_is_reported() {
        let mut seed = NamedTempFile::new().expect("temp file");
        write!(seed, "not json").expect("write seed");
        let store = SpeedwatchStore::open_in_memory().expect("open db");
        let err = store.seed_offices_from_file(seed.path()).expect_err("bad seed");
        assert!(matches!(err, StorageError::Seed(_)));
    }
}
