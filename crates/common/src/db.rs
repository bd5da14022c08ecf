use anyhow::Result;
use rusqlite::Connection;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Table names for the hub store. Handed to [`AsyncDb::open`] and to every closure
/// that runs on the connection, so deployments can rename tables without touching SQL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub users: String,
    pub hubs: String,
    pub posts: String,
    pub post_votes: String,
    pub post_links: String,
    pub user_points: String,
    pub points_ledger: String,
    pub investments: String,
    pub job_status: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            users: "users".to_string(),
            hubs: "hubs".to_string(),
            posts: "posts".to_string(),
            post_votes: "post_votes".to_string(),
            post_links: "post_links".to_string(),
            user_points: "user_points".to_string(),
            points_ledger: "user_points_ledger".to_string(),
            investments: "comment_investments".to_string(),
            job_status: "job_status".to_string(),
        }
    }
}

impl Tables {
    fn names(&self) -> [&str; 9] {
        [
            self.users.as_str(),
            self.hubs.as_str(),
            self.posts.as_str(),
            self.post_votes.as_str(),
            self.post_links.as_str(),
            self.user_points.as_str(),
            self.points_ledger.as_str(),
            self.investments.as_str(),
            self.job_status.as_str(),
        ]
    }

    /// Names are spliced into SQL text, so only plain identifiers are accepted.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for name in self.names() {
            let mut chars = name.chars();
            let ok = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            anyhow::ensure!(ok, "invalid table name: {name:?}");
            anyhow::ensure!(seen.insert(name), "duplicate table name: {name:?}");
        }
        Ok(())
    }

    fn create_tables_sql(&self) -> String {
        let Tables {
            users,
            hubs,
            posts,
            post_votes,
            post_links,
            user_points,
            points_ledger,
            investments,
            job_status,
        } = self;
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {users} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS {hubs} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS {posts} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hub_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    parent_id INTEGER,                 -- NULL = thread root, otherwise a comment
    title TEXT,
    content TEXT NOT NULL,
    post_type TEXT NOT NULL,           -- thread, question, note, reply
    moderation_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(moderation_status IN ('pending', 'approved', 'flagged', 'removed')),
    views INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (hub_id) REFERENCES {hubs}(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES {users}(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_id) REFERENCES {posts}(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS {post_votes} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    vote_type TEXT NOT NULL CHECK(vote_type IN ('up', 'down')),
    created_at TEXT NOT NULL,
    UNIQUE(post_id, user_id),
    FOREIGN KEY (post_id) REFERENCES {posts}(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES {users}(id) ON DELETE CASCADE
);

-- Links a post to another item in the system, such as a task or course.
CREATE TABLE IF NOT EXISTS {post_links} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL,
    item_type TEXT NOT NULL,
    item_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (post_id) REFERENCES {posts}(id) ON DELETE CASCADE
);

-- Current balance; must always equal SUM(delta) of the user's ledger rows.
CREATE TABLE IF NOT EXISTS {user_points} (
    user_id INTEGER PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES {users}(id) ON DELETE CASCADE
);

-- Append-only. Rows are never updated or deleted by the application.
CREATE TABLE IF NOT EXISTS {points_ledger} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    delta INTEGER NOT NULL CHECK(delta != 0),
    reason TEXT NOT NULL,              -- invest_stake, invest_payout, comment_streak, adjustment
    ref_comment_id INTEGER,
    ref_post_id INTEGER,
    investment_id INTEGER,
    day_key TEXT,                      -- YYYY-MM-DD (UTC), set for daily awards
    created_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES {users}(id) ON DELETE CASCADE,
    FOREIGN KEY (ref_comment_id) REFERENCES {posts}(id) ON DELETE SET NULL,
    FOREIGN KEY (ref_post_id) REFERENCES {posts}(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS {investments} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    investor_user_id INTEGER NOT NULL,
    comment_id INTEGER NOT NULL,
    post_id INTEGER NOT NULL,          -- parent post of the staked comment
    amount INTEGER NOT NULL CHECK(amount > 0),
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending', 'won', 'lost', 'cancelled')),
    settle_at TEXT NOT NULL,
    settled_at TEXT,
    payout_amount INTEGER,
    created_at TEXT NOT NULL,
    FOREIGN KEY (investor_user_id) REFERENCES {users}(id) ON DELETE CASCADE,
    FOREIGN KEY (comment_id) REFERENCES {posts}(id) ON DELETE CASCADE,
    FOREIGN KEY (post_id) REFERENCES {posts}(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS {job_status} (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,              -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                     -- JSON with progress info
    updated_at TEXT NOT NULL
);
"#
        )
    }

    fn create_indexes_sql(&self) -> String {
        let Tables {
            posts,
            post_votes,
            post_links,
            user_points,
            points_ledger,
            investments,
            ..
        } = self;
        format!(
            r#"
CREATE INDEX IF NOT EXISTS idx_{posts}_hub_id ON {posts}(hub_id);
CREATE INDEX IF NOT EXISTS idx_{posts}_parent_id ON {posts}(parent_id);
CREATE INDEX IF NOT EXISTS idx_{posts}_parent_id_views ON {posts}(parent_id, views);
CREATE INDEX IF NOT EXISTS idx_{posts}_moderation_status ON {posts}(moderation_status);
CREATE INDEX IF NOT EXISTS idx_{post_votes}_post_id ON {post_votes}(post_id);
CREATE INDEX IF NOT EXISTS idx_{post_links}_post_id ON {post_links}(post_id);
CREATE INDEX IF NOT EXISTS idx_{user_points}_balance ON {user_points}(balance);
CREATE INDEX IF NOT EXISTS idx_{points_ledger}_user ON {points_ledger}(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_{points_ledger}_day ON {points_ledger}(user_id, reason, day_key);
CREATE INDEX IF NOT EXISTS idx_{investments}_investor ON {investments}(investor_user_id);
CREATE INDEX IF NOT EXISTS idx_{investments}_settlement ON {investments}(status, settle_at);
"#
        )
    }
}

/// Create tables, backfill columns on older post tables, then create indexes.
pub fn run_migrations(
    conn: &Connection,
    tables: &Tables,
) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(&tables.create_tables_sql())?;
    migrate_posts_moderation_columns(conn, tables)?;
    conn.execute_batch(&tables.create_indexes_sql())?;
    Ok(())
}

/// Posts tables created before moderation and view tracking lack these columns.
fn migrate_posts_moderation_columns(
    conn: &Connection,
    tables: &Tables,
) -> std::result::Result<(), rusqlite::Error> {
    let required: [(&str, &str); 2] = [
        ("moderation_status", "TEXT NOT NULL DEFAULT 'approved'"),
        ("views", "INTEGER NOT NULL DEFAULT 0"),
    ];
    for (name, ty) in required {
        let has: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
            rusqlite::params![tables.posts, name],
            |row| row.get(0),
        )?;
        if has == 0 {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {name} {ty}", tables.posts),
                [],
            )?;
            tracing::info!(table = %tables.posts, column = name, "added missing column");
        }
    }
    Ok(())
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

fn record_db_call(op: &'static str, ok: bool, start: Instant) {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    let status = if ok { "ok" } else { "err" };
    metrics::histogram!("hub_db_query_latency_ms", "op" => op, "status" => status).record(ms);
    if !ok {
        metrics::counter!("hub_db_query_errors_total", "op" => op).increment(1);
    }
}

/// Async handle to the hub's SQLite database.
///
/// All statements run on one dedicated background thread owned by
/// `tokio_rusqlite`, so calls from this process are serialized. Clone is cheap.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
    tables: Arc<Tables>,
}

impl AsyncDb {
    /// Open the database at `path`, set PRAGMAs and run migrations on the background thread.
    ///
    /// Migrations need the write lock. If another process holds it we back off and retry
    /// instead of failing startup.
    pub async fn open(path: &str, tables: Tables) -> Result<Self> {
        tables.validate()?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let tables = Arc::new(tables);

        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(30);
        let max_total_wait = Duration::from_secs(5 * 60);
        let start = Instant::now();

        loop {
            let schema = Arc::clone(&tables);
            let res = conn
                .call(move |conn| -> std::result::Result<(), rusqlite::Error> {
                    // Short per-attempt timeout; backoff happens here in Rust.
                    conn.busy_timeout(Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    run_migrations(conn, &schema)?;
                    conn.busy_timeout(Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    if !is_locked(&err) {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }
                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }
                    tracing::warn!(wait_for = ?backoff, "database is locked; retrying migrations");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        tracing::info!(path, "hub database ready");
        Ok(Self { conn, tables })
    }

    /// Fresh in-memory database with the default schema.
    pub async fn open_memory() -> Result<Self> {
        Self::open(":memory:", Tables::default()).await
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Run a closure on the background SQLite thread and return its result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection, &Tables) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let tables = Arc::clone(&self.tables);
        self.conn
            .call(move |conn| function(conn, &tables))
            .await
            .map_err(|e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::Error(err) => err,
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                other => anyhow::anyhow!("database error: {other}"),
            })
    }

    /// Like [`Self::call`], but records latency and error metrics under `op`.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection, &Tables) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = Instant::now();
        let res = self.call(function).await;
        record_db_call(op, res.is_ok(), start);
        res
    }

    /// Unit of work: run `function` inside `BEGIN IMMEDIATE` and commit if it returns `Ok`.
    ///
    /// Any `Err` (including caller validation errors) drops the transaction, which rolls
    /// back every statement it issued. IMMEDIATE takes the write lock before the first
    /// read, so read-check-write sequences cannot interleave with other writers.
    pub async fn transaction<F, R, E>(
        &self,
        op: &'static str,
        function: F,
    ) -> std::result::Result<R, E>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &Tables) -> std::result::Result<R, E>
            + Send
            + 'static,
        R: Send + 'static,
        E: From<rusqlite::Error> + From<anyhow::Error> + Send + 'static,
    {
        let start = Instant::now();
        let tables = Arc::clone(&self.tables);
        let res = self
            .conn
            .call(move |conn| -> std::result::Result<R, E> {
                let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let out = function(&tx, &tables)?;
                tx.commit()?;
                Ok(out)
            })
            .await
            .map_err(|e: tokio_rusqlite::Error<E>| match e {
                tokio_rusqlite::Error::Error(err) => err,
                tokio_rusqlite::Error::ConnectionClosed => {
                    E::from(anyhow::anyhow!("database connection closed"))
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    E::from(anyhow::anyhow!("database close error: {err}"))
                }
                _ => E::from(anyhow::anyhow!("database call failed")),
            });
        record_db_call(op, res.is_ok(), start);
        res
    }
}
