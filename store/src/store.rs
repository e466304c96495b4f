//! The SQLite-backed session store.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::SubsecRound;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteRow;
use sqlx::sqlite::SqliteSynchronous;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::error::StoreErr;
use crate::session::MaintenanceOptions;
use crate::session::MaintenanceReport;
use crate::session::NewSession;
use crate::session::Session;
use crate::session::SessionFilters;
use crate::session::SessionSort;
use crate::session::SessionStats;
use crate::session::SessionStatus;
use crate::session::SessionUpdate;
use crate::session::WorktreeInfo;
use crate::session::validate_name;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECTIONS: u32 = 5;
const MAX_LIST_LIMIT: u32 = 500;

const SESSION_COLUMNS: &str = "id, name, created_at, updated_at, status, linear_task, \
     description, tags, metadata, worktrees, projects";

/// Ordered, idempotent migrations; each entry is one schema version. The
/// store records the applied version in `schema_version` and only runs what
/// is newer on open.
const MIGRATIONS: &[&[&str]] = &[
    // v1: base schema.
    &[
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            linear_task TEXT,
            description TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            worktrees TEXT NOT NULL DEFAULT '{}',
            projects TEXT NOT NULL DEFAULT '[]'
        )",
        "CREATE TABLE IF NOT EXISTS session_worktrees (
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            project TEXT NOT NULL,
            path TEXT NOT NULL,
            branch TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (session_id, project)
        )",
        "CREATE TABLE IF NOT EXISTS session_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            path TEXT NOT NULL,
            checksum TEXT,
            created_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_linear_task ON sessions(linear_task)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_status_updated ON sessions(status, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_status_created ON sessions(status, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_session_files_session ON session_files(session_id)",
    ],
];

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if missing) the database at `path` and bring the
    /// schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| StoreErr::Connection {
                reason: format!("{}: {err}", path.display()),
            })?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open the default catalog at `~/.sxn/sessions.db`.
    pub async fn open_default() -> Result<Self> {
        let path = Self::default_database_path().ok_or_else(|| StoreErr::Connection {
            reason: "could not resolve home directory".to_string(),
        })?;
        Self::open(path).await
    }

    pub fn default_database_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".sxn").join("sessions.db"))
    }

    /// Close the underlying pool. Dropping the store does the same
    /// implicitly; this variant waits for it.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let (current,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await?;
        let current = current.unwrap_or(0);

        for (index, statements) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version <= current {
                continue;
            }
            let mut tx = self.pool.begin().await?;
            for statement in *statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| StoreErr::Migration {
                        version,
                        reason: err.to_string(),
                    })?;
            }
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(format_ts(now_micros()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied session store migration");
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    pub async fn create(&self, new: NewSession) -> Result<Session> {
        validate_name(&new.name)?;

        let now = now_micros();
        let session = Session {
            id: Uuid::new_v4().simple().to_string(),
            name: new.name,
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            linear_task: new.linear_task,
            description: new.description,
            tags: new.tags,
            metadata: new.metadata.unwrap_or_else(|| serde_json::json!({})),
            worktrees: BTreeMap::new(),
            projects: new.projects,
        };

        let outcome = sqlx::query(
            "INSERT INTO sessions (id, name, created_at, updated_at, status, linear_task, \
             description, tags, metadata, worktrees, projects) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(format_ts(session.created_at))
        .bind(format_ts(session.updated_at))
        .bind(session.status.as_str())
        .bind(&session.linear_task)
        .bind(&session.description)
        .bind(serde_json::to_string(&session.tags)?)
        .bind(session.metadata.to_string())
        .bind(serde_json::to_string(&session.worktrees)?)
        .bind(serde_json::to_string(&session.projects)?)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => {
                debug!(session = %session.name, id = %session.id, "created session");
                Ok(session)
            }
            Err(sqlx::Error::Database(db)) if db.kind() == sqlx::error::ErrorKind::UniqueViolation => {
                Err(StoreErr::DuplicateSession { name: session.name })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply a partial update. When `expected_version` is set the write only
    /// succeeds if `updated_at` still equals it; `updated_at` is refreshed
    /// past its previous value either way.
    pub async fn update(&self, id: &str, update: SessionUpdate) -> Result<Session> {
        let mut session = self.get_by_id(id).await?;
        let observed = session.updated_at;

        if let Some(expected) = update.expected_version
            && expected != observed
        {
            return Err(StoreErr::Conflict {
                ident: id.to_string(),
            });
        }

        if let Some(status) = update.status {
            session.status = status;
        }
        if let Some(linear_task) = update.linear_task {
            session.linear_task = Some(linear_task);
        }
        if let Some(description) = update.description {
            session.description = Some(description);
        }
        if let Some(tags) = update.tags {
            session.tags = tags;
        }
        if let Some(metadata) = update.metadata {
            session.metadata = metadata;
        }
        session.updated_at = next_version(observed);

        let affected = sqlx::query(
            "UPDATE sessions SET status = ?, linear_task = ?, description = ?, tags = ?, \
             metadata = ?, updated_at = ? WHERE id = ? AND updated_at = ?",
        )
        .bind(session.status.as_str())
        .bind(&session.linear_task)
        .bind(&session.description)
        .bind(serde_json::to_string(&session.tags)?)
        .bind(session.metadata.to_string())
        .bind(format_ts(session.updated_at))
        .bind(id)
        .bind(format_ts(observed))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            // Raced with another writer between our read and write.
            return Err(StoreErr::Conflict {
                ident: id.to_string(),
            });
        }
        Ok(session)
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        self.update(
            id,
            SessionUpdate {
                status: Some(status),
                ..SessionUpdate::default()
            },
        )
        .await
    }

    /// Refresh `updated_at` without changing anything else.
    pub async fn touch(&self, id: &str) -> Result<Session> {
        self.update(id, SessionUpdate::default()).await
    }

    pub async fn add_worktree(
        &self,
        id: &str,
        project: &str,
        worktree: WorktreeInfo,
    ) -> Result<Session> {
        let mut session = self.get_by_id(id).await?;
        session
            .worktrees
            .insert(project.to_string(), worktree.clone());
        session.projects.insert(project.to_string());
        let updated_at = next_version(session.updated_at);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE sessions SET worktrees = ?, projects = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&session.worktrees)?)
        .bind(serde_json::to_string(&session.projects)?)
        .bind(format_ts(updated_at))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT OR REPLACE INTO session_worktrees \
             (session_id, project, path, branch, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(project)
        .bind(&worktree.path)
        .bind(&worktree.branch)
        .bind(format_ts(worktree.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        session.updated_at = updated_at;
        Ok(session)
    }

    pub async fn remove_worktree(&self, id: &str, project: &str) -> Result<Session> {
        let mut session = self.get_by_id(id).await?;
        session.worktrees.remove(project);
        session.projects.remove(project);
        let updated_at = next_version(session.updated_at);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE sessions SET worktrees = ?, projects = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&session.worktrees)?)
        .bind(serde_json::to_string(&session.projects)?)
        .bind(format_ts(updated_at))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM session_worktrees WHERE session_id = ? AND project = ?")
            .bind(id)
            .bind(project)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        session.updated_at = updated_at;
        Ok(session)
    }

    /// Record a file placed into the session (audit trail for setup runs).
    pub async fn record_file(&self, id: &str, path: &str, checksum: Option<&str>) -> Result<()> {
        // Foreign key gives a clear error for unknown sessions, but check
        // first to produce the store's own kind.
        self.get_by_id(id).await?;
        sqlx::query(
            "INSERT INTO session_files (session_id, path, checksum, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(path)
        .bind(checksum)
        .bind(format_ts(now_micros()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn files(&self, id: &str) -> Result<Vec<(String, Option<String>)>> {
        self.get_by_id(id).await?;
        let rows = sqlx::query(
            "SELECT path, checksum FROM session_files WHERE session_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("path")?,
                    row.try_get::<Option<String>, _>("checksum")?,
                ))
            })
            .collect()
    }

    /// Delete a session; dependent worktree and file rows cascade.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreErr::SessionNotFound {
                ident: id.to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => row_to_session(&row),
            None => Err(StoreErr::SessionNotFound {
                ident: id.to_string(),
            }),
        }
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Session> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE name = ?");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_session(&row),
            None => Err(StoreErr::SessionNotFound {
                ident: name.to_string(),
            }),
        }
    }

    pub async fn list(
        &self,
        filters: &SessionFilters,
        sort: SessionSort,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Session>> {
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions");
        let mut conditions: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = filters.status {
            conditions.push("status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(tag) = &filters.tag {
            // Tags are a JSON array of strings; match the quoted element.
            conditions.push("tags LIKE ?");
            binds.push(format!("%\"{tag}\"%"));
        }
        if let Some(linear_task) = &filters.linear_task {
            conditions.push("linear_task = ?");
            binds.push(linear_task.clone());
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(match sort {
            SessionSort::UpdatedDesc => " ORDER BY updated_at DESC",
            SessionSort::CreatedDesc => " ORDER BY created_at DESC",
            SessionSort::NameAsc => " ORDER BY name ASC",
        });
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query
            .bind(limit.clamp(1, MAX_LIST_LIMIT))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    /// Weighted substring search over name, description, and tags, ranked
    /// `100·name + 50·description + 25·tags`, newest activity first.
    pub async fn search(
        &self,
        query_text: &str,
        filters: &SessionFilters,
        limit: u32,
    ) -> Result<Vec<Session>> {
        let pattern = format!("%{}%", query_text.trim());

        let mut sql = format!(
            "SELECT * FROM ( \
                 SELECT {SESSION_COLUMNS}, \
                     (CASE WHEN name LIKE ?1 THEN 100 ELSE 0 END) + \
                     (CASE WHEN COALESCE(description, '') LIKE ?1 THEN 50 ELSE 0 END) + \
                     (CASE WHEN tags LIKE ?1 THEN 25 ELSE 0 END) AS score \
                 FROM sessions \
             ) WHERE score > 0"
        );
        let mut binds: Vec<String> = Vec::new();
        let mut next_param = 2;
        if let Some(status) = filters.status {
            sql.push_str(&format!(" AND status = ?{next_param}"));
            binds.push(status.as_str().to_string());
            next_param += 1;
        }
        if let Some(linear_task) = &filters.linear_task {
            sql.push_str(&format!(" AND linear_task = ?{next_param}"));
            binds.push(linear_task.clone());
            next_param += 1;
        }
        sql.push_str(&format!(
            " ORDER BY score DESC, updated_at DESC LIMIT ?{next_param}"
        ));

        let mut query = sqlx::query(&sql).bind(&pattern);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query
            .bind(limit.clamp(1, MAX_LIST_LIMIT))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    pub async fn statistics(&self) -> Result<SessionStats> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;

        let mut by_status = BTreeMap::new();
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sessions GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            by_status.insert(status, count);
        }

        let cutoff = now_micros() - chrono::Duration::days(7);
        let (recent,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE updated_at >= ?")
                .bind(format_ts(cutoff))
                .fetch_one(&self.pool)
                .await?;

        let (size_bytes,): (i64,) = sqlx::query_as(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SessionStats {
            total,
            by_status,
            recent_activity_7d: recent,
            db_size_mb: size_bytes as f64 / (1024.0 * 1024.0),
        })
    }

    pub async fn maintenance(&self, options: MaintenanceOptions) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        if options.integrity_check {
            let (outcome,): (String,) = sqlx::query_as("PRAGMA integrity_check")
                .fetch_one(&self.pool)
                .await?;
            if outcome != "ok" {
                return Err(StoreErr::Integrity { report: outcome });
            }
            report.integrity_ok = Some(true);
        }
        if options.vacuum {
            sqlx::query("VACUUM").execute(&self.pool).await?;
            report.vacuumed = true;
        }
        if options.analyze {
            sqlx::query("ANALYZE").execute(&self.pool).await?;
            report.analyzed = true;
        }
        Ok(report)
    }
}

fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Next `updated_at`: the current clock, but never at or below the previous
/// version even if the clock stalls.
fn next_version(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = now_micros();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreErr::InvalidSession {
            field: "timestamp".to_string(),
            reason: format!("'{text}': {err}"),
        })
}

fn row_to_session(row: &SqliteRow) -> Result<Session> {
    let tags: String = row.try_get("tags")?;
    let metadata: String = row.try_get("metadata")?;
    let worktrees: String = row.try_get("worktrees")?;
    let projects: String = row.try_get("projects")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Session {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        status: SessionStatus::parse(&status)?,
        linear_task: row.try_get("linear_task")?,
        description: row.try_get("description")?,
        tags: serde_json::from_str(&tags)?,
        metadata: serde_json::from_str(&metadata)?,
        worktrees: serde_json::from_str(&worktrees)?,
        projects: serde_json::from_str(&projects)?,
    })
}
