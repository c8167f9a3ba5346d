//! Build-History Store: an append-only log of build outcomes plus a
//! mutable per-pkgbase current-status table, backed by SQLite.
use std::collections::HashMap;
use std::str::FromStr;

use camino::Utf8Path;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::{CurrentBuildStatus, CurrentStatus, HistoryEntry, Pkgbase, RUsage, Rusages, WorkerName};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Recorded(Pkgbase),
    StatusChanged(Pkgbase, CurrentBuildStatus),
}

pub struct HistoryStore {
    pool: SqlitePool,
    listeners: broadcast::Sender<HistoryEvent>,
}

impl HistoryStore {
    pub async fn connect(path: &Utf8Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Io(e))?;
        }
        let opts = SqliteConnectOptions::from_str(path.as_str())?
            .foreign_keys(true)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        let mut conn = pool.acquire().await?;
        MIGRATOR
            .run(&mut conn)
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

        let (listeners, _) = broadcast::channel(256);
        Ok(HistoryStore { pool, listeners })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.listeners.subscribe()
    }

    fn notify_listeners(&self, event: HistoryEvent) {
        // Best-effort; no subscriber is not an error.
        let _ = self.listeners.send(event);
    }

    pub async fn record(&self, entry: &HistoryEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO pkglog
                (ts, pkgbase, nv_version, pkg_version, elapsed_seconds, result_tag,
                 cpu_seconds, peak_memory_bytes, message, build_reasons_json,
                 maintainers_json, worker_name)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.ts)
        .bind(&entry.pkgbase)
        .bind(&entry.nv_version)
        .bind(&entry.pkg_version)
        .bind(entry.elapsed_seconds)
        .bind(&entry.result_tag)
        .bind(entry.cpu_seconds)
        .bind(entry.peak_memory_bytes as i64)
        .bind(&entry.message)
        .bind(&entry.build_reasons_json)
        .bind(&entry.maintainers_json)
        .bind(&entry.worker_name)
        .execute(&self.pool)
        .await?;

        self.notify_listeners(HistoryEvent::Recorded(entry.pkgbase.clone()));
        Ok(())
    }

    pub async fn is_last_failed(&self, pkgbase: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT result_tag FROM pkglog WHERE pkgbase = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(pkgbase)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|r| r.get::<String, _>("result_tag") == "failed"))
    }

    /// Returns the two most recent `successful`/`staged` versions for
    /// `pkgbase`, most recent first.
    pub async fn last_two_versions(
        &self,
        pkgbase: &str,
    ) -> Result<(Option<String>, Option<String>), sqlx::Error> {
        let rows = sqlx::query(
            "SELECT pkg_version FROM pkglog
             WHERE pkgbase = ? AND result_tag IN ('successful', 'staged')
             ORDER BY ts DESC LIMIT 2",
        )
        .bind(pkgbase)
        .fetch_all(&self.pool)
        .await?;
        let mut versions = rows
            .into_iter()
            .map(|r| r.get::<Option<String>, _>("pkg_version"));
        let current = versions.next().flatten();
        let previous = versions.next().flatten();
        Ok((previous, current))
    }

    pub async fn last_success_times(
        &self,
        pkgbases: &[Pkgbase],
    ) -> Result<HashMap<Pkgbase, OffsetDateTime>, sqlx::Error> {
        let mut out = HashMap::new();
        for pkgbase in pkgbases {
            let row = sqlx::query(
                "SELECT ts FROM pkglog
                 WHERE pkgbase = ? AND result_tag IN ('successful', 'staged')
                 ORDER BY ts DESC LIMIT 1",
            )
            .bind(pkgbase)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                out.insert(pkgbase.clone(), row.get::<OffsetDateTime, _>("ts"));
            }
        }
        Ok(out)
    }

    /// Picks the most recent successful row per pkgbase per worker, used by
    /// the Worker Manager's cost-prediction.
    pub async fn last_rusages(&self, pkgbases: &[Pkgbase]) -> Result<Rusages, sqlx::Error> {
        let mut out: Rusages = HashMap::new();
        for pkgbase in pkgbases {
            let rows = sqlx::query(
                "SELECT worker_name, cpu_seconds, peak_memory_bytes, elapsed_seconds, ts
                 FROM pkglog
                 WHERE pkgbase = ? AND result_tag IN ('successful', 'staged')
                   AND worker_name IS NOT NULL
                 ORDER BY ts DESC",
            )
            .bind(pkgbase)
            .fetch_all(&self.pool)
            .await?;
            let mut per_worker: HashMap<WorkerName, RUsage> = HashMap::new();
            for row in rows {
                let worker: String = row.get("worker_name");
                per_worker.entry(worker).or_insert(RUsage {
                    cpu_seconds: row.get("cpu_seconds"),
                    peak_memory_bytes: row.get::<i64, _>("peak_memory_bytes") as u64,
                });
            }
            if !per_worker.is_empty() {
                out.insert(pkgbase.clone(), per_worker);
            }
        }
        Ok(out)
    }

    pub async fn mark(
        &self,
        pkgbase: &str,
        batch_index: i64,
        status: CurrentBuildStatus,
        build_reasons_json: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO pkgcurrent (pkgbase, updated_at, batch_index, status, build_reasons_json)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(pkgbase) DO UPDATE SET
                updated_at = excluded.updated_at,
                batch_index = excluded.batch_index,
                status = excluded.status,
                build_reasons_json = excluded.build_reasons_json",
        )
        .bind(pkgbase)
        .bind(OffsetDateTime::now_utc())
        .bind(batch_index)
        .bind(status.to_string())
        .bind(build_reasons_json)
        .execute(&self.pool)
        .await?;

        self.notify_listeners(HistoryEvent::StatusChanged(pkgbase.to_string(), status));
        Ok(())
    }

    pub async fn current_status(&self, pkgbase: &str) -> Result<Option<CurrentStatus>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT pkgbase, updated_at, batch_index, status, build_reasons_json
             FROM pkgcurrent WHERE pkgbase = ?",
        )
        .bind(pkgbase)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CurrentStatus {
            pkgbase: r.get("pkgbase"),
            updated_at: r.get("updated_at"),
            batch_index: r.get("batch_index"),
            status: CurrentBuildStatus::from_str(r.get::<String, _>("status").as_str())
                .unwrap_or(CurrentBuildStatus::Pending),
            build_reasons_json: r.get("build_reasons_json"),
        }))
    }

    pub async fn start_batch(&self) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO batch (started_at, status) VALUES (?, 'running')")
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn finish_batch(&self, batch_id: i64, status: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE batch SET finished_at = ?, status = ? WHERE id = ?")
            .bind(OffsetDateTime::now_utc())
            .bind(status)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BuildReason;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;

    async fn store() -> (HistoryStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("history.sqlite3")).unwrap();
        let store = HistoryStore::connect(&path).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn records_and_reads_last_failed() {
        let (store, _dir) = store().await;
        let entry = HistoryEntry {
            id: 0,
            ts: OffsetDateTime::now_utc(),
            pkgbase: "foo".into(),
            nv_version: Some("1.1".into()),
            pkg_version: Some("1.1-1".into()),
            elapsed_seconds: 12.0,
            result_tag: "failed".into(),
            cpu_seconds: 3.0,
            peak_memory_bytes: 1024,
            message: Some("boom".into()),
            build_reasons_json: serde_json::to_string(&BuildReason::UpdatedFailed).unwrap(),
            maintainers_json: "[]".into(),
            worker_name: Some("local".into()),
        };
        store.record(&entry).await.unwrap();
        assert!(store.is_last_failed("foo").await.unwrap());
        assert!(!store.is_last_failed("bar").await.unwrap());
    }

    #[tokio::test]
    async fn tracks_last_two_versions() {
        let (store, _dir) = store().await;
        for version in ["1.0-1", "1.1-1"] {
            let entry = HistoryEntry {
                id: 0,
                ts: OffsetDateTime::now_utc(),
                pkgbase: "foo".into(),
                nv_version: None,
                pkg_version: Some(version.into()),
                elapsed_seconds: 1.0,
                result_tag: "successful".into(),
                cpu_seconds: 1.0,
                peak_memory_bytes: 0,
                message: None,
                build_reasons_json: "null".into(),
                maintainers_json: "[]".into(),
                worker_name: Some("local".into()),
            };
            store.record(&entry).await.unwrap();
        }
        let (prev, cur) = store.last_two_versions("foo").await.unwrap();
        assert_eq!(cur.as_deref(), Some("1.1-1"));
        assert_eq!(prev.as_deref(), Some("1.0-1"));
    }

    #[tokio::test]
    async fn mark_upserts_current_status() {
        let (store, _dir) = store().await;
        store
            .mark("foo", 1, CurrentBuildStatus::Building, "null")
            .await
            .unwrap();
        store
            .mark("foo", 1, CurrentBuildStatus::Done, "null")
            .await
            .unwrap();
        let status = store.current_status("foo").await.unwrap().unwrap();
        assert_eq!(status.status, CurrentBuildStatus::Done);
    }
}
