//! Referential store trait and the SQLite implementation.

use crate::error::{ReferentialError, ReferentialResult};
use crate::repos::{
    AccessRequestRepo, ArchiveReferentialRepo, ObjectReferentialRepo, OfferLogRepo,
    TapeCatalogRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined referential store trait: the system of record for objects,
/// archives, tapes, the offer log and access requests.
#[async_trait]
pub trait ReferentialStore:
    ObjectReferentialRepo
    + ArchiveReferentialRepo
    + TapeCatalogRepo
    + OfferLogRepo
    + AccessRequestRepo
    + Send
    + Sync
{
    /// Create the schema if missing.
    async fn migrate(&self) -> ReferentialResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> ReferentialResult<()>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS object_referential (
    container        TEXT NOT NULL,
    object_id        TEXT NOT NULL,
    storage_id       TEXT NOT NULL,
    size             INTEGER NOT NULL,
    digest_algorithm TEXT NOT NULL,
    digest           TEXT NOT NULL,
    location         TEXT NOT NULL,
    version          INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (container, object_id)
);

CREATE TABLE IF NOT EXISTS archive_referential (
    tar_id      TEXT PRIMARY KEY,
    file_bucket TEXT NOT NULL,
    size        INTEGER,
    location    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archive_referential_location
    ON archive_referential (json_extract(location, '$.type'));

CREATE TABLE IF NOT EXISTS tape_catalog (
    tape_code     TEXT PRIMARY KEY,
    bucket        TEXT NOT NULL,
    state         TEXT NOT NULL,
    location      TEXT NOT NULL,
    home_slot     INTEGER NOT NULL DEFAULT 0,
    label_written INTEGER NOT NULL DEFAULT 0,
    capacity      INTEGER NOT NULL,
    written_bytes INTEGER NOT NULL DEFAULT 0,
    file_position INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offer_log (
    log_offset INTEGER PRIMARY KEY AUTOINCREMENT,
    container  TEXT NOT NULL,
    object_id  TEXT NOT NULL,
    action     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offer_log_container ON offer_log (container, log_offset);

CREATE TABLE IF NOT EXISTS access_requests (
    request_id          TEXT PRIMARY KEY,
    container           TEXT NOT NULL,
    object_ids          TEXT NOT NULL,
    unavailable_tar_ids TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    ready_at            TEXT,
    expires_at          TEXT,
    purge_at            TEXT,
    version             INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite-backed referential store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a referential database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> ReferentialResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serializes writers (drive workers, builder, cleanup task)
            // without "database is locked" failures.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl ReferentialStore for SqliteStore {
    async fn migrate(&self) -> ReferentialResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> ReferentialResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use bobine_core::{
        ArchiveLocation, LogOrder, OfferLogAction, OfferLogEntry, TapeLocation, TapeState,
        TarEntryDescription,
    };
    use std::collections::HashSet;
    use time::OffsetDateTime;

    // SQLite has a limit of ~999 bind parameters.
    const IN_BATCH_SIZE: usize = 900;

    #[async_trait]
    impl ObjectReferentialRepo for SqliteStore {
        async fn upsert_object(&self, row: &ObjectRow) -> ReferentialResult<()> {
            sqlx::query(
                r#"
                INSERT INTO object_referential (
                    container, object_id, storage_id, size, digest_algorithm,
                    digest, location, version, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                ON CONFLICT(container, object_id) DO UPDATE SET
                    storage_id = excluded.storage_id,
                    size = excluded.size,
                    digest_algorithm = excluded.digest_algorithm,
                    digest = excluded.digest,
                    location = excluded.location,
                    version = object_referential.version + 1,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&row.container)
            .bind(&row.object_id)
            .bind(&row.storage_id)
            .bind(row.size)
            .bind(&row.digest_algorithm)
            .bind(&row.digest)
            .bind(&row.location)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_object(
            &self,
            container: &str,
            object_id: &str,
        ) -> ReferentialResult<Option<ObjectRow>> {
            let row = sqlx::query_as::<_, ObjectRow>(
                "SELECT * FROM object_referential WHERE container = ? AND object_id = ?",
            )
            .bind(container)
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn bulk_get_objects(
            &self,
            container: &str,
            object_ids: &[String],
        ) -> ReferentialResult<Vec<ObjectRow>> {
            if object_ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut result = Vec::with_capacity(object_ids.len());
            for batch in object_ids.chunks(IN_BATCH_SIZE) {
                let placeholders: Vec<&str> = batch.iter().map(|_| "?").collect();
                let query = format!(
                    "SELECT * FROM object_referential WHERE container = ? AND object_id IN ({})",
                    placeholders.join(", ")
                );

                let mut query_builder = sqlx::query_as::<_, ObjectRow>(&query).bind(container);
                for id in batch {
                    query_builder = query_builder.bind(id);
                }
                result.extend(query_builder.fetch_all(&self.pool).await?);
            }
            Ok(result)
        }

        async fn set_packed_location(
            &self,
            container: &str,
            object_id: &str,
            storage_id: &str,
            entries: &[TarEntryDescription],
        ) -> ReferentialResult<bool> {
            let location = serde_json::to_string(&bobine_core::ObjectLocation::InTar {
                entries: entries.to_vec(),
            })?;
            let result = sqlx::query(
                r#"
                UPDATE object_referential
                SET location = ?, updated_at = ?
                WHERE container = ? AND object_id = ? AND storage_id = ?
                "#,
            )
            .bind(location)
            .bind(OffsetDateTime::now_utc())
            .bind(container)
            .bind(object_id)
            .bind(storage_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_object(&self, container: &str, object_id: &str) -> ReferentialResult<bool> {
            let result = sqlx::query(
                "DELETE FROM object_referential WHERE container = ? AND object_id = ?",
            )
            .bind(container)
            .bind(object_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_objects(
            &self,
            container: &str,
            after: Option<&str>,
            limit: u32,
        ) -> ReferentialResult<Vec<ObjectListingEntry>> {
            let rows = match after {
                Some(after) => {
                    sqlx::query_as::<_, ObjectListingEntry>(
                        "SELECT object_id, size FROM object_referential
                         WHERE container = ? AND object_id > ?
                         ORDER BY object_id LIMIT ?",
                    )
                    .bind(container)
                    .bind(after)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, ObjectListingEntry>(
                        "SELECT object_id, size FROM object_referential
                         WHERE container = ?
                         ORDER BY object_id LIMIT ?",
                    )
                    .bind(container)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }
    }

    #[async_trait]
    impl ArchiveReferentialRepo for SqliteStore {
        async fn insert_archive(&self, tar_id: &str, file_bucket: &str) -> ReferentialResult<()> {
            let now = OffsetDateTime::now_utc();
            let location = serde_json::to_string(&ArchiveLocation::BuildingOnDisk)?;
            sqlx::query(
                r#"
                INSERT INTO archive_referential (tar_id, file_bucket, size, location, created_at, updated_at)
                VALUES (?, ?, NULL, ?, ?, ?)
                "#,
            )
            .bind(tar_id)
            .bind(file_bucket)
            .bind(location)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                    ReferentialError::AlreadyExists(format!("archive {tar_id}"))
                }
                other => other.into(),
            })?;
            Ok(())
        }

        async fn get_archive(&self, tar_id: &str) -> ReferentialResult<Option<ArchiveRow>> {
            let row =
                sqlx::query_as::<_, ArchiveRow>("SELECT * FROM archive_referential WHERE tar_id = ?")
                    .bind(tar_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn bulk_get_archives(&self, tar_ids: &[String]) -> ReferentialResult<Vec<ArchiveRow>> {
            if tar_ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut result = Vec::with_capacity(tar_ids.len());
            for batch in tar_ids.chunks(IN_BATCH_SIZE) {
                let placeholders: Vec<&str> = batch.iter().map(|_| "?").collect();
                let query = format!(
                    "SELECT * FROM archive_referential WHERE tar_id IN ({})",
                    placeholders.join(", ")
                );

                let mut query_builder = sqlx::query_as::<_, ArchiveRow>(&query);
                for id in batch {
                    query_builder = query_builder.bind(id);
                }
                result.extend(query_builder.fetch_all(&self.pool).await?);
            }
            Ok(result)
        }

        async fn seal_archive(&self, tar_id: &str, size: u64) -> ReferentialResult<()> {
            self.transition_archive(tar_id, ArchiveLocation::ReadyOnDisk, Some(size))
                .await
        }

        async fn set_on_tape(
            &self,
            tar_id: &str,
            tape_code: &str,
            file_position: u64,
        ) -> ReferentialResult<()> {
            let target = ArchiveLocation::OnTape {
                tape_code: tape_code.to_string(),
                file_position,
            };
            self.transition_archive(tar_id, target, None).await
        }

        async fn list_ready_archives(&self) -> ReferentialResult<Vec<ArchiveRow>> {
            let rows = sqlx::query_as::<_, ArchiveRow>(
                r#"
                SELECT * FROM archive_referential
                WHERE json_extract(location, '$.type') = 'ready_on_disk'
                ORDER BY created_at
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    impl SqliteStore {
        async fn transition_archive(
            &self,
            tar_id: &str,
            target: ArchiveLocation,
            size: Option<u64>,
        ) -> ReferentialResult<()> {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query_as::<_, ArchiveRow>(
                "SELECT * FROM archive_referential WHERE tar_id = ?",
            )
            .bind(tar_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ReferentialError::NotFound(format!("archive {tar_id}")))?;

            let current = row.location()?;
            current
                .check_transition(&target)
                .map_err(|e| ReferentialError::Corrupt(e.to_string()))?;

            let location = serde_json::to_string(&target)?;
            match size {
                Some(size) => {
                    sqlx::query(
                        "UPDATE archive_referential SET location = ?, size = ?, updated_at = ? WHERE tar_id = ?",
                    )
                    .bind(location)
                    .bind(size as i64)
                    .bind(OffsetDateTime::now_utc())
                    .bind(tar_id)
                    .execute(&mut *tx)
                    .await?
                }
                None => {
                    sqlx::query(
                        "UPDATE archive_referential SET location = ?, updated_at = ? WHERE tar_id = ?",
                    )
                    .bind(location)
                    .bind(OffsetDateTime::now_utc())
                    .bind(tar_id)
                    .execute(&mut *tx)
                    .await?
                }
            };

            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl TapeCatalogRepo for SqliteStore {
        async fn insert_tape(&self, row: &TapeRow) -> ReferentialResult<()> {
            sqlx::query(
                r#"
                INSERT INTO tape_catalog (
                    tape_code, bucket, state, location, home_slot, label_written,
                    capacity, written_bytes, file_position, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.tape_code)
            .bind(&row.bucket)
            .bind(&row.state)
            .bind(&row.location)
            .bind(row.home_slot)
            .bind(row.label_written)
            .bind(row.capacity)
            .bind(row.written_bytes)
            .bind(row.file_position)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                    ReferentialError::AlreadyExists(format!("tape {}", row.tape_code))
                }
                other => other.into(),
            })?;
            Ok(())
        }

        async fn get_tape(&self, tape_code: &str) -> ReferentialResult<Option<TapeRow>> {
            let row = sqlx::query_as::<_, TapeRow>("SELECT * FROM tape_catalog WHERE tape_code = ?")
                .bind(tape_code)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn claim_writable_tape(
            &self,
            bucket: &str,
            drive_index: u32,
        ) -> ReferentialResult<Option<TapeRow>> {
            let mut tx = self.pool.begin().await?;

            // Prefer open tapes (append to partially-written media) over
            // labeling a fresh one.
            let candidate = sqlx::query_as::<_, TapeRow>(
                r#"
                SELECT * FROM tape_catalog
                WHERE bucket = ?
                  AND state IN ('open', 'empty')
                  AND json_extract(location, '$.type') = 'slot'
                ORDER BY CASE state WHEN 'open' THEN 0 ELSE 1 END, tape_code
                LIMIT 1
                "#,
            )
            .bind(bucket)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(mut tape) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };

            let location = serde_json::to_string(&TapeLocation::Drive { drive_index })?;
            sqlx::query("UPDATE tape_catalog SET location = ?, updated_at = ? WHERE tape_code = ?")
                .bind(&location)
                .bind(OffsetDateTime::now_utc())
                .bind(&tape.tape_code)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            tape.location = location;
            Ok(Some(tape))
        }

        async fn claim_tape(
            &self,
            tape_code: &str,
            drive_index: u32,
        ) -> ReferentialResult<Option<TapeRow>> {
            let location = serde_json::to_string(&TapeLocation::Drive { drive_index })?;
            let result = sqlx::query(
                r#"
                UPDATE tape_catalog SET location = ?, updated_at = ?
                WHERE tape_code = ? AND json_extract(location, '$.type') = 'slot'
                "#,
            )
            .bind(&location)
            .bind(OffsetDateTime::now_utc())
            .bind(tape_code)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(None);
            }
            self.get_tape(tape_code).await
        }

        async fn release_tape(&self, tape_code: &str, slot: u32) -> ReferentialResult<()> {
            let location = serde_json::to_string(&TapeLocation::Slot { slot })?;
            let result = sqlx::query(
                "UPDATE tape_catalog SET location = ?, updated_at = ? WHERE tape_code = ?",
            )
            .bind(location)
            .bind(OffsetDateTime::now_utc())
            .bind(tape_code)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(ReferentialError::NotFound(format!("tape {tape_code}")));
            }
            Ok(())
        }

        async fn set_tape_state(&self, tape_code: &str, state: TapeState) -> ReferentialResult<()> {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query_as::<_, TapeRow>("SELECT * FROM tape_catalog WHERE tape_code = ?")
                .bind(tape_code)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| ReferentialError::NotFound(format!("tape {tape_code}")))?;

            let current = row.state()?;
            current
                .check_transition(state)
                .map_err(|e| ReferentialError::Corrupt(e.to_string()))?;

            sqlx::query("UPDATE tape_catalog SET state = ?, updated_at = ? WHERE tape_code = ?")
                .bind(state.as_str())
                .bind(OffsetDateTime::now_utc())
                .bind(tape_code)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn record_tape_write(
            &self,
            tape_code: &str,
            written_bytes: u64,
        ) -> ReferentialResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE tape_catalog
                SET written_bytes = written_bytes + ?,
                    file_position = file_position + 1,
                    updated_at = ?
                WHERE tape_code = ?
                "#,
            )
            .bind(written_bytes as i64)
            .bind(OffsetDateTime::now_utc())
            .bind(tape_code)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(ReferentialError::NotFound(format!("tape {tape_code}")));
            }
            Ok(())
        }

        async fn set_label_written(&self, tape_code: &str) -> ReferentialResult<()> {
            let result = sqlx::query(
                "UPDATE tape_catalog SET label_written = 1, updated_at = ? WHERE tape_code = ?",
            )
            .bind(OffsetDateTime::now_utc())
            .bind(tape_code)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(ReferentialError::NotFound(format!("tape {tape_code}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OfferLogRepo for SqliteStore {
        async fn append_log(
            &self,
            container: &str,
            object_id: &str,
            action: OfferLogAction,
        ) -> ReferentialResult<i64> {
            let result = sqlx::query(
                "INSERT INTO offer_log (container, object_id, action, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(container)
            .bind(object_id)
            .bind(action.as_str())
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        }

        async fn list_log(
            &self,
            container: &str,
            offset: Option<i64>,
            limit: u32,
            order: LogOrder,
        ) -> ReferentialResult<Vec<OfferLogEntry>> {
            let query = match order {
                LogOrder::Ascending => {
                    r#"
                    SELECT log_offset AS "offset", container, object_id, action, created_at
                    FROM offer_log
                    WHERE container = ? AND log_offset >= ?
                    ORDER BY log_offset ASC LIMIT ?
                    "#
                }
                LogOrder::Descending => {
                    r#"
                    SELECT log_offset AS "offset", container, object_id, action, created_at
                    FROM offer_log
                    WHERE container = ? AND log_offset <= ?
                    ORDER BY log_offset DESC LIMIT ?
                    "#
                }
            };

            let bound = offset.unwrap_or(match order {
                LogOrder::Ascending => 0,
                LogOrder::Descending => i64::MAX,
            });

            let rows = sqlx::query_as::<_, OfferLogRow>(query)
                .bind(container)
                .bind(bound)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;

            rows.into_iter().map(OfferLogRow::into_entry).collect()
        }

        async fn tail_offset(&self, container: &str) -> ReferentialResult<i64> {
            let tail: Option<i64> =
                sqlx::query_scalar("SELECT MAX(log_offset) FROM offer_log WHERE container = ?")
                    .bind(container)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(tail.unwrap_or(0))
        }
    }

    #[async_trait]
    impl AccessRequestRepo for SqliteStore {
        async fn insert_request(&self, row: &AccessRequestRow) -> ReferentialResult<()> {
            sqlx::query(
                r#"
                INSERT INTO access_requests (
                    request_id, container, object_ids, unavailable_tar_ids,
                    created_at, ready_at, expires_at, purge_at, version
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.request_id)
            .bind(&row.container)
            .bind(&row.object_ids)
            .bind(&row.unavailable_tar_ids)
            .bind(row.created_at)
            .bind(row.ready_at)
            .bind(row.expires_at)
            .bind(row.purge_at)
            .bind(row.version)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_request(
            &self,
            request_id: &str,
        ) -> ReferentialResult<Option<AccessRequestRow>> {
            let row = sqlx::query_as::<_, AccessRequestRow>(
                "SELECT * FROM access_requests WHERE request_id = ?",
            )
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn bulk_get_requests(
            &self,
            request_ids: &[String],
        ) -> ReferentialResult<Vec<AccessRequestRow>> {
            if request_ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut result = Vec::with_capacity(request_ids.len());
            for batch in request_ids.chunks(IN_BATCH_SIZE) {
                let placeholders: Vec<&str> = batch.iter().map(|_| "?").collect();
                let query = format!(
                    "SELECT * FROM access_requests WHERE request_id IN ({})",
                    placeholders.join(", ")
                );

                let mut query_builder = sqlx::query_as::<_, AccessRequestRow>(&query);
                for id in batch {
                    query_builder = query_builder.bind(id);
                }
                result.extend(query_builder.fetch_all(&self.pool).await?);
            }
            Ok(result)
        }

        async fn find_by_unavailable_tar(
            &self,
            tar_id: &str,
        ) -> ReferentialResult<Vec<AccessRequestRow>> {
            // Tar ids appear JSON-quoted inside the unavailable list column.
            let needle = format!("\"{tar_id}\"");
            let rows = sqlx::query_as::<_, AccessRequestRow>(
                "SELECT * FROM access_requests WHERE instr(unavailable_tar_ids, ?) > 0",
            )
            .bind(needle)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn find_non_ready_requests(&self) -> ReferentialResult<Vec<AccessRequestRow>> {
            let rows = sqlx::query_as::<_, AccessRequestRow>(
                "SELECT * FROM access_requests WHERE unavailable_tar_ids != '[]'",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_request(
            &self,
            row: &AccessRequestRow,
            expected_version: i64,
        ) -> ReferentialResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE access_requests
                SET object_ids = ?, unavailable_tar_ids = ?, ready_at = ?,
                    expires_at = ?, purge_at = ?, version = ?
                WHERE request_id = ? AND version = ?
                "#,
            )
            .bind(&row.object_ids)
            .bind(&row.unavailable_tar_ids)
            .bind(row.ready_at)
            .bind(row.expires_at)
            .bind(row.purge_at)
            .bind(row.version)
            .bind(&row.request_id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_request(&self, request_id: &str) -> ReferentialResult<bool> {
            let result = sqlx::query("DELETE FROM access_requests WHERE request_id = ?")
                .bind(request_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn find_expired_requests(
            &self,
            now: OffsetDateTime,
        ) -> ReferentialResult<Vec<AccessRequestRow>> {
            let rows = sqlx::query_as::<_, AccessRequestRow>(
                "SELECT * FROM access_requests WHERE expires_at IS NOT NULL AND expires_at < ?",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn purge_expired_requests(
            &self,
            now: OffsetDateTime,
        ) -> ReferentialResult<Vec<AccessRequestRow>> {
            let rows = sqlx::query_as::<_, AccessRequestRow>(
                "DELETE FROM access_requests WHERE purge_at IS NOT NULL AND purge_at < ? RETURNING *",
            )
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn filter_unreferenced_tars(
            &self,
            tar_ids: &HashSet<String>,
        ) -> ReferentialResult<HashSet<String>> {
            let mut unreferenced = HashSet::new();
            for tar_id in tar_ids {
                let needle = format!("\"{tar_id}\"");
                let referenced: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM access_requests WHERE instr(unavailable_tar_ids, ?) > 0)",
                )
                .bind(needle)
                .fetch_one(&self.pool)
                .await?;
                if !referenced {
                    unreferenced.insert(tar_id.clone());
                }
            }
            Ok(unreferenced)
        }

        async fn refresh_ready_requests(
            &self,
            container: &str,
            object_id: &str,
            expires_at: OffsetDateTime,
            purge_at: OffsetDateTime,
        ) -> ReferentialResult<u64> {
            let needle = format!("\"{object_id}\"");
            let result = sqlx::query(
                r#"
                UPDATE access_requests
                SET expires_at = ?, purge_at = ?, version = version + 1
                WHERE container = ?
                  AND unavailable_tar_ids = '[]'
                  AND expires_at IS NOT NULL
                  AND expires_at >= ?
                  AND instr(object_ids, ?) > 0
                "#,
            )
            .bind(expires_at)
            .bind(purge_at)
            .bind(container)
            .bind(OffsetDateTime::now_utc())
            .bind(needle)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}
