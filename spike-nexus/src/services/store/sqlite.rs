//! SQLite implementation of [`SecretStore`].
//!
//! One serialized connection, WAL journal, configurable busy timeout.
//! Multi-row writes run inside `BEGIN IMMEDIATE` transactions; rusqlite
//! rolls an uncommitted transaction back on drop, so every error path
//! leaves the database untouched.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};
use spike_types::error::SpikeError;
use spike_types::{AeadAlg, KekId, KekMetadata, KekStatus, RmkVersion};

use super::{RewrapUpdate, SecretMetadataRecord, SecretStore, SecretVersionRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS secrets (
    path           TEXT    NOT NULL,
    version        INTEGER NOT NULL,
    nonce          BLOB    NOT NULL,
    encrypted_data BLOB    NOT NULL,
    created_time   INTEGER NOT NULL,
    deleted_time   INTEGER,
    kek_id         TEXT,
    wrapped_dek    BLOB,
    dek_nonce      BLOB,
    aead_alg       TEXT,
    rewrapped_at   INTEGER,
    PRIMARY KEY (path, version)
);
CREATE TABLE IF NOT EXISTS secret_metadata (
    path                TEXT PRIMARY KEY,
    nonce               BLOB NOT NULL,
    enc_current_version BLOB NOT NULL,
    enc_oldest_version  BLOB NOT NULL,
    enc_created_time    BLOB NOT NULL,
    enc_updated_time    BLOB NOT NULL,
    enc_max_versions    BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS kek_metadata (
    id          TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    salt        BLOB    NOT NULL,
    rmk_version INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    wraps_count INTEGER NOT NULL,
    status      TEXT    NOT NULL,
    retired_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_secrets_path ON secrets(path);
CREATE INDEX IF NOT EXISTS idx_secrets_created_time ON secrets(created_time);
CREATE INDEX IF NOT EXISTS idx_kek_metadata_status ON kek_metadata(status);
CREATE INDEX IF NOT EXISTS idx_kek_metadata_created_at ON kek_metadata(created_at);
"#;

/// The SQLite secret store wrapping one serialized connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn q(err: rusqlite::Error) -> SpikeError {
    SpikeError::EntityQueryFailed(err.to_string())
}

fn ts_to_db(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn ts_from_db(millis: i64) -> Result<DateTime<Utc>, SpikeError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        SpikeError::DataUnmarshalFailure(format!("timestamp out of range: {millis}"))
    })
}

fn opt_ts_from_db(millis: Option<i64>) -> Result<Option<DateTime<Utc>>, SpikeError> {
    millis.map(ts_from_db).transpose()
}

fn aead_alg_from_db(value: Option<String>) -> Result<Option<AeadAlg>, SpikeError> {
    value
        .map(|v| {
            AeadAlg::parse(&v)
                .ok_or_else(|| SpikeError::DataUnmarshalFailure(format!("unknown aead alg: {v}")))
        })
        .transpose()
}

fn kek_status_from_db(value: String) -> Result<KekStatus, SpikeError> {
    KekStatus::parse(&value)
        .ok_or_else(|| SpikeError::DataUnmarshalFailure(format!("unknown kek status: {value}")))
}

type VersionRow = (
    String,
    u32,
    Vec<u8>,
    Vec<u8>,
    i64,
    Option<i64>,
    Option<String>,
    Option<Vec<u8>>,
    Option<Vec<u8>>,
    Option<String>,
    Option<i64>,
);

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn version_record(row: VersionRow) -> Result<SecretVersionRecord, SpikeError> {
    let (
        path,
        version,
        nonce,
        ciphertext,
        created,
        deleted,
        kek_id,
        wrapped_dek,
        dek_nonce,
        aead_alg,
        rewrapped,
    ) = row;
    Ok(SecretVersionRecord {
        path,
        version,
        nonce,
        ciphertext,
        created_time: ts_from_db(created)?,
        deleted_time: opt_ts_from_db(deleted)?,
        kek_id: kek_id.map(KekId::new),
        wrapped_dek,
        dek_nonce,
        aead_alg: aead_alg_from_db(aead_alg)?,
        rewrapped_at: opt_ts_from_db(rewrapped)?,
    })
}

const SELECT_VERSION_COLUMNS: &str = "path, version, nonce, encrypted_data, created_time, \
     deleted_time, kek_id, wrapped_dek, dek_nonce, aead_alg, rewrapped_at";

impl SqliteStore {
    /// Opens (and migrates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SpikeError::FsDirectoryCreationFailed`] if the parent
    /// directory cannot be created and [`SpikeError::FsFileOpenFailed`] if
    /// the database cannot be opened.
    pub fn open(
        path: &Path,
        journal_mode: &str,
        busy_timeout_ms: u32,
    ) -> Result<Self, SpikeError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| SpikeError::FsDirectoryCreationFailed(err.to_string()))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| SpikeError::FsFileOpenFailed(err.to_string()))?;
        Self::init(conn, journal_mode, busy_timeout_ms)
    }

    /// Opens an in-memory SQLite database. Used by tests.
    pub fn open_in_memory() -> Result<Self, SpikeError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| SpikeError::FsFileOpenFailed(err.to_string()))?;
        Self::init(conn, "MEMORY", 5000)
    }

    fn init(conn: Connection, journal_mode: &str, busy_timeout_ms: u32) -> Result<Self, SpikeError> {
        conn.pragma_update(None, "journal_mode", journal_mode)
            .map_err(q)?;
        conn.pragma_update(None, "busy_timeout", busy_timeout_ms)
            .map_err(q)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(q)?;
        conn.execute_batch(SCHEMA).map_err(q)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert_kek_row(tx: &rusqlite::Connection, metadata: &KekMetadata) -> Result<(), SpikeError> {
        tx.execute(
            r#"
            INSERT INTO kek_metadata (id, version, salt, rmk_version, created_at, wraps_count, status, retired_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (id) DO UPDATE SET
                version = excluded.version,
                salt = excluded.salt,
                rmk_version = excluded.rmk_version,
                created_at = excluded.created_at,
                wraps_count = excluded.wraps_count,
                status = excluded.status,
                retired_at = excluded.retired_at
            "#,
            params![
                metadata.id.as_str(),
                metadata.version,
                metadata.salt,
                metadata.rmk_version.into_inner(),
                ts_to_db(metadata.created_at),
                metadata.wraps_count,
                metadata.status.as_str(),
                metadata.retired_at.map(ts_to_db),
            ],
        )
        .map_err(q)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for SqliteStore {
    async fn store_secret(
        &self,
        metadata: SecretMetadataRecord,
        versions: Vec<SecretVersionRecord>,
    ) -> Result<(), SpikeError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| SpikeError::TransactionBeginFailed(err.to_string()))?;
        tx.execute(
            r#"
            INSERT INTO secret_metadata
                (path, nonce, enc_current_version, enc_oldest_version,
                 enc_created_time, enc_updated_time, enc_max_versions)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (path) DO UPDATE SET
                nonce = excluded.nonce,
                enc_current_version = excluded.enc_current_version,
                enc_oldest_version = excluded.enc_oldest_version,
                enc_created_time = excluded.enc_created_time,
                enc_updated_time = excluded.enc_updated_time,
                enc_max_versions = excluded.enc_max_versions
            "#,
            params![
                metadata.path,
                metadata.base_nonce,
                metadata.enc_current_version,
                metadata.enc_oldest_version,
                metadata.enc_created_time,
                metadata.enc_updated_time,
                metadata.enc_max_versions,
            ],
        )
        .map_err(q)?;
        for version in &versions {
            tx.execute(
                r#"
                INSERT INTO secrets
                    (path, version, nonce, encrypted_data, created_time, deleted_time,
                     kek_id, wrapped_dek, dek_nonce, aead_alg, rewrapped_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT (path, version) DO UPDATE SET
                    nonce = excluded.nonce,
                    encrypted_data = excluded.encrypted_data,
                    created_time = excluded.created_time,
                    deleted_time = excluded.deleted_time,
                    kek_id = excluded.kek_id,
                    wrapped_dek = excluded.wrapped_dek,
                    dek_nonce = excluded.dek_nonce,
                    aead_alg = excluded.aead_alg,
                    rewrapped_at = excluded.rewrapped_at
                "#,
                params![
                    version.path,
                    version.version,
                    version.nonce,
                    version.ciphertext,
                    ts_to_db(version.created_time),
                    version.deleted_time.map(ts_to_db),
                    version.kek_id.as_ref().map(|id| id.as_str().to_owned()),
                    version.wrapped_dek,
                    version.dek_nonce,
                    version.aead_alg.map(|alg| alg.as_str().to_owned()),
                    version.rewrapped_at.map(ts_to_db),
                ],
            )
            .map_err(q)?;
        }
        tx.commit()
            .map_err(|err| SpikeError::TransactionCommitFailed(err.to_string()))
    }

    async fn load_metadata(
        &self,
        path: &str,
    ) -> Result<Option<SecretMetadataRecord>, SpikeError> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT path, nonce, enc_current_version, enc_oldest_version,
                   enc_created_time, enc_updated_time, enc_max_versions
            FROM secret_metadata WHERE path = ?1
            "#,
            params![path],
            |row| {
                Ok(SecretMetadataRecord {
                    path: row.get(0)?,
                    base_nonce: row.get(1)?,
                    enc_current_version: row.get(2)?,
                    enc_oldest_version: row.get(3)?,
                    enc_created_time: row.get(4)?,
                    enc_updated_time: row.get(5)?,
                    enc_max_versions: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(q)
    }

    async fn load_versions(&self, path: &str) -> Result<Vec<SecretVersionRecord>, SpikeError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_VERSION_COLUMNS} FROM secrets WHERE path = ?1 ORDER BY version"
            ))
            .map_err(q)?;
        let rows = stmt
            .query_map(params![path], version_row)
            .map_err(q)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(q)?;
        rows.into_iter().map(version_record).collect()
    }

    async fn load_version(
        &self,
        path: &str,
        version: u32,
    ) -> Result<Option<SecretVersionRecord>, SpikeError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_VERSION_COLUMNS} FROM secrets WHERE path = ?1 AND version = ?2"
                ),
                params![path, version],
                version_row,
            )
            .optional()
            .map_err(q)?;
        row.map(version_record).transpose()
    }

    async fn load_paths(&self) -> Result<Vec<String>, SpikeError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT path FROM secret_metadata ORDER BY path")
            .map_err(q)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(q)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(q)?;
        Ok(rows)
    }

    async fn update_deleted_time(
        &self,
        path: &str,
        version: u32,
        deleted_time: Option<DateTime<Utc>>,
    ) -> Result<(), SpikeError> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE secrets SET deleted_time = ?3 WHERE path = ?1 AND version = ?2",
                params![path, version, deleted_time.map(ts_to_db)],
            )
            .map_err(q)?;
        if updated == 0 {
            return Err(SpikeError::EntityNotFound);
        }
        Ok(())
    }

    async fn delete_versions_below(&self, path: &str, oldest: u32) -> Result<(), SpikeError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM secrets WHERE path = ?1 AND version < ?2",
            params![path, oldest],
        )
        .map_err(q)?;
        Ok(())
    }

    async fn update_wrapping(&self, update: RewrapUpdate) -> Result<bool, SpikeError> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                r#"
                UPDATE secrets
                SET kek_id = ?4, wrapped_dek = ?5, dek_nonce = ?6, aead_alg = ?7, rewrapped_at = ?8
                WHERE path = ?1 AND version = ?2 AND kek_id = ?3
                "#,
                params![
                    update.path,
                    update.version,
                    update.expected_kek_id.as_str(),
                    update.kek_id.as_str(),
                    update.wrapped_dek,
                    update.dek_nonce,
                    update.aead_alg.as_str(),
                    ts_to_db(update.rewrapped_at),
                ],
            )
            .map_err(q)?;
        Ok(updated == 1)
    }

    async fn list_refs_by_kek(&self, kek_id: &KekId) -> Result<Vec<(String, u32)>, SpikeError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, version FROM secrets \
                 WHERE kek_id = ?1 AND deleted_time IS NULL ORDER BY path, version",
            )
            .map_err(q)?;
        let rows = stmt
            .query_map(params![kek_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })
            .map_err(q)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(q)?;
        Ok(rows)
    }

    async fn count_refs_by_kek(&self, kek_id: &KekId) -> Result<u64, SpikeError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM secrets WHERE kek_id = ?1 AND deleted_time IS NULL",
            params![kek_id.as_str()],
            |row| row.get::<_, u64>(0),
        )
        .map_err(q)
    }

    async fn load_kek_metadata(&self) -> Result<Vec<KekMetadata>, SpikeError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, version, salt, rmk_version, created_at, wraps_count, status, retired_at \
                 FROM kek_metadata ORDER BY version",
            )
            .map_err(q)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            })
            .map_err(q)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(q)?;
        rows.into_iter()
            .map(
                |(id, version, salt, rmk_version, created, wraps, status, retired)| {
                    Ok(KekMetadata {
                        id: KekId::new(id),
                        version,
                        salt,
                        rmk_version: RmkVersion::new(rmk_version),
                        created_at: ts_from_db(created)?,
                        retired_at: opt_ts_from_db(retired)?,
                        wraps_count: wraps,
                        status: kek_status_from_db(status)?,
                    })
                },
            )
            .collect()
    }

    async fn upsert_kek_metadata(&self, metadata: &KekMetadata) -> Result<(), SpikeError> {
        let conn = self.conn.lock();
        Self::upsert_kek_row(&conn, metadata)
    }

    async fn replace_kek_metadata(&self, metadata: &[KekMetadata]) -> Result<(), SpikeError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| SpikeError::TransactionBeginFailed(err.to_string()))?;
        tx.execute("DELETE FROM kek_metadata", []).map_err(q)?;
        for meta in metadata {
            Self::upsert_kek_row(&tx, meta)?;
        }
        tx.commit()
            .map_err(|err| SpikeError::TransactionCommitFailed(err.to_string()))
    }

    async fn close(&self) -> Result<(), SpikeError> {
        // rusqlite closes on drop; flush WAL eagerly so shutdown is durable
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|err| SpikeError::StoreCloseFailed(err.to_string()))?;
        Ok(())
    }
}
