//! Migration lists for each store.
//!
//! Names are the idempotency keys recorded in `_migrations`; never rename
//! or reorder an entry once released.

use futures_util::future::LocalBoxFuture;
use sqlx::SqliteConnection;

use super::migrations::{Migration, MigrationKind};

/// Store holding agents and the spawn ledger.
pub const LEDGER_STORE: &str = "ledger";

/// Store holding the transcript session index.
pub const SESSIONS_STORE: &str = "sessions";

/// Migrations for the [`LEDGER_STORE`].
pub const LEDGER_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_create_agent",
        kind: MigrationKind::Statement(
            r"
CREATE TABLE IF NOT EXISTS agent (
    id              TEXT PRIMARY KEY NOT NULL,
    identity        TEXT NOT NULL UNIQUE,
    config_ref      TEXT,
    created_at      TEXT NOT NULL,
    last_active_at  TEXT NOT NULL,
    archived        INTEGER NOT NULL DEFAULT 0
);
",
        ),
    },
    Migration {
        name: "0002_create_spawn",
        kind: MigrationKind::Statement(
            r"
CREATE TABLE IF NOT EXISTS spawn (
    id              TEXT PRIMARY KEY NOT NULL,
    agent_id        TEXT NOT NULL,
    parent_spawn_id TEXT,
    channel_id      TEXT,
    session_id      TEXT,
    status          TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed','timeout','killed')),
    pid             INTEGER,
    created_at      TEXT NOT NULL,
    ended_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_spawn_agent ON spawn(agent_id);
CREATE INDEX IF NOT EXISTS idx_spawn_parent ON spawn(parent_spawn_id);
CREATE INDEX IF NOT EXISTS idx_spawn_status ON spawn(status);
CREATE INDEX IF NOT EXISTS idx_spawn_channel ON spawn(channel_id);
",
        ),
    },
    Migration {
        name: "0003_agent_spawn_count",
        kind: MigrationKind::Procedure(add_agent_spawn_count),
    },
];

/// Migrations for the [`SESSIONS_STORE`].
pub const SESSION_MIGRATIONS: &[Migration] = &[Migration {
    name: "0001_create_session_index",
    kind: MigrationKind::Statement(
        r"
CREATE TABLE IF NOT EXISTS session_index (
    session_id      TEXT PRIMARY KEY NOT NULL,
    spawn_id        TEXT NOT NULL,
    provider        TEXT NOT NULL,
    path            TEXT NOT NULL,
    linked_at       TEXT NOT NULL,
    size_bytes      INTEGER,
    modified_at     TEXT,
    finalized_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_session_index_spawn ON session_index(spawn_id);
",
    ),
}];

/// Add `agent.spawn_count` and backfill it from existing spawns.
///
/// Checks the column first so a retried run does not fail on `ALTER TABLE`.
fn add_agent_spawn_count(
    conn: &mut SqliteConnection,
) -> LocalBoxFuture<'_, std::result::Result<(), sqlx::Error>> {
    Box::pin(async move {
        let has_column: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('agent') WHERE name = 'spawn_count'",
        )
        .fetch_one(&mut *conn)
        .await?;
        if has_column == 0 {
            sqlx::raw_sql("ALTER TABLE agent ADD COLUMN spawn_count INTEGER NOT NULL DEFAULT 0")
                .execute(&mut *conn)
                .await?;
        }
        sqlx::raw_sql(
            "UPDATE agent SET spawn_count =
                (SELECT COUNT(*) FROM spawn WHERE spawn.agent_id = agent.id)",
        )
        .execute(&mut *conn)
        .await?;
        Ok(())
    })
}
