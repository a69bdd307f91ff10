//! Postgres-backed task repository.
//!
//! All queue instances of a deployment share one `tasks` table. The only
//! coordination between them is the conditional update in
//! [`update_from_state`](TaskRepository::update_from_state):
//!
//! ```sql
//! UPDATE tasks SET ... WHERE id = $1 AND state = $expected RETURNING ...
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `DuplicateName` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use cadence_core::{
    CreateTask, Pagination, PendingCursor, RepositoryError, RepositoryResult, Task, TaskFilter,
    TaskId, TaskPage, TaskRepository, TaskState, UpdateTask,
};

/// Schema statements, applied one at a time by [`PostgresTaskRepository::migrate`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        seq             BIGSERIAL,
        id              UUID PRIMARY KEY,
        name            TEXT,
        task_type       TEXT NOT NULL,
        priority        INTEGER NOT NULL DEFAULT 0,
        state           TEXT NOT NULL,
        data            JSONB NOT NULL DEFAULT '{}'::jsonb,
        available_time  TIMESTAMPTZ,
        expiration_time TIMESTAMPTZ,
        deadline_time   TIMESTAMPTZ,
        run_time        TIMESTAMPTZ,
        duration        DOUBLE PRECISION,
        error           TEXT,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS tasks_name_key
        ON tasks (name) WHERE name IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS tasks_pending_idx
        ON tasks (task_type, priority DESC, seq) WHERE state = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS tasks_running_deadline_idx
        ON tasks (deadline_time) WHERE state = 'running'
    "#,
];

const TASK_COLUMNS: &str = "seq, id, name, task_type, priority, state, data, available_time, \
     expiration_time, deadline_time, run_time, duration, error, created_at, updated_at";

/// Rows fetched per round trip by the pending cursor.
const DEFAULT_CURSOR_BATCH: i64 = 64;

/// Postgres-backed task repository.
///
/// Cheap to clone; clones and type-filtered views share the pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskRepository {
    pool: Arc<PgPool>,
    type_filter: Option<String>,
    cursor_batch: i64,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            type_filter: None,
            cursor_batch: DEFAULT_CURSOR_BATCH,
        }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Rows fetched per cursor round trip (minimum 1).
    pub fn with_cursor_batch(mut self, batch: i64) -> Self {
        self.cursor_batch = batch.max(1);
        self
    }

    /// Create the `tasks` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> RepositoryResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[instrument(
        skip(self),
        fields(type_filter = ?self.type_filter, task_count = tracing::field::Empty),
        err
    )]
    async fn list_tasks(&self, filter: TaskFilter, pagination: Pagination) -> RepositoryResult<TaskPage> {
        let predicate = r#"
            ($1::text IS NULL OR task_type = $1)
            AND ($2::text IS NULL OR task_type = $2)
            AND ($3::text IS NULL OR state = $3)
            AND ($4::text IS NULL OR name = $4)
        "#;
        let state = filter.state.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tasks WHERE {predicate}"))
            .bind(self.type_filter.as_deref())
            .bind(filter.task_type.as_deref())
            .bind(state)
            .bind(filter.name.as_deref())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_tasks", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE {predicate} ORDER BY seq ASC LIMIT $5 OFFSET $6"
        ))
        .bind(self.type_filter.as_deref())
        .bind(filter.task_type.as_deref())
        .bind(state)
        .bind(filter.name.as_deref())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;

        let tasks = rows
            .iter()
            .map(decode_task)
            .collect::<RepositoryResult<Vec<_>>>()?;

        Span::current().record("task_count", tasks.len());
        Ok(TaskPage::new(tasks, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self, create), fields(task_type = %create.task_type), err)]
    async fn create_task(&self, create: CreateTask) -> RepositoryResult<Task> {
        if create.task_type.trim().is_empty() {
            return Err(RepositoryError::validation("task_type must not be empty"));
        }

        let task = Task::from_create(create);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (
                id, name, task_type, priority, state, data,
                available_time, expiration_time, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.id.as_uuid())
        .bind(task.name.as_deref())
        .bind(&task.task_type)
        .bind(task.priority)
        .bind(task.state.as_str())
        .bind(JsonValue::Object(task.data.clone()))
        .bind(task.available_time)
        .bind(task.expiration_time)
        .bind(task.created_at)
        .bind(task.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_task", e))?;

        decode_task(&row)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get_task(&self, id: TaskId) -> RepositoryResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;

        row.as_ref().map(decode_task).transpose()
    }

    #[instrument(skip(self, update), fields(task_id = %id), err)]
    async fn update_task(&self, id: TaskId, update: UpdateTask) -> RepositoryResult<Option<Task>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_task", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let mut task = decode_task(&row)?;
        update.apply(&mut task);

        let row = write_task(&task)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_task", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        decode_task(&row).map(Some)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn delete_task(&self, id: TaskId) -> RepositoryResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_task", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }

    async fn iterate_pending(&self) -> RepositoryResult<Box<dyn PendingCursor>> {
        Ok(Box::new(PostgresPendingCursor {
            pool: Arc::clone(&self.pool),
            type_filter: self.type_filter.clone(),
            batch_size: self.cursor_batch,
            buffered: VecDeque::new(),
            position: None,
            exhausted: false,
        }))
    }

    #[instrument(
        skip(self, task, expected),
        fields(task_id = %task.id, expected = %expected, next = %task.state),
        err
    )]
    async fn update_from_state(&self, task: &Task, expected: TaskState) -> RepositoryResult<Task> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks SET
                name = $2,
                task_type = $3,
                priority = $4,
                state = $5,
                data = $6,
                available_time = $7,
                expiration_time = $8,
                deadline_time = $9,
                run_time = $10,
                duration = $11,
                error = $12,
                updated_at = now()
            WHERE id = $1 AND state = $13
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.id.as_uuid())
        .bind(task.name.as_deref())
        .bind(&task.task_type)
        .bind(task.priority)
        .bind(task.state.as_str())
        .bind(JsonValue::Object(task.data.clone()))
        .bind(task.available_time)
        .bind(task.expiration_time)
        .bind(task.deadline_time)
        .bind(task.run_time)
        .bind(task.duration)
        .bind(task.error.as_deref())
        .bind(expected.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_from_state", e))?;

        if let Some(row) = row {
            return decode_task(&row);
        }

        // Lost the swap: tell a missing task apart from a concurrent claim.
        let actual: Option<String> = sqlx::query_scalar("SELECT state FROM tasks WHERE id = $1")
            .bind(task.id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_from_state", e))?;

        match actual {
            None => Err(RepositoryError::NotFound(task.id)),
            Some(actual) => Err(RepositoryError::AlreadyClaimed {
                id: task.id,
                expected,
                actual: TaskState::from_stored(&actual),
            }),
        }
    }

    #[instrument(skip(self), fields(type_filter = ?self.type_filter), err)]
    async fn unstick_tasks(&self) -> RepositoryResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                state = 'pending',
                available_time = now(),
                deadline_time = NULL,
                updated_at = now()
            WHERE state = 'running'
              AND deadline_time < now()
              AND ($1::text IS NULL OR task_type = $1)
            "#,
        )
        .bind(self.type_filter.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unstick_tasks", e))?;

        Ok(result.rows_affected())
    }

    fn with_type_filter(&self, task_type: &str) -> Arc<dyn TaskRepository> {
        Arc::new(Self {
            pool: Arc::clone(&self.pool),
            type_filter: Some(task_type.to_string()),
            cursor_batch: self.cursor_batch,
        })
    }
}

/// Full-row write used by operator updates (no state precondition).
fn write_task(task: &Task) -> sqlx::query::Query<'static, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            name = $2,
            priority = $3,
            state = $4,
            data = $5,
            available_time = $6,
            expiration_time = $7,
            updated_at = $8
        WHERE id = $1
        RETURNING seq, id, name, task_type, priority, state, data, available_time,
                  expiration_time, deadline_time, run_time, duration, error, created_at, updated_at
        "#,
    )
    .bind(*task.id.as_uuid())
    .bind(task.name.clone())
    .bind(task.priority)
    .bind(task.state.as_str())
    .bind(JsonValue::Object(task.data.clone()))
    .bind(task.available_time)
    .bind(task.expiration_time)
    .bind(task.updated_at)
}

/// Keyset-paginated cursor over claimable tasks.
///
/// Fetches `batch_size` rows at a time ordered by `(priority DESC, seq ASC)`
/// and resumes strictly after the last row seen, so claims made by other
/// instances between batches never shift the window.
struct PostgresPendingCursor {
    pool: Arc<PgPool>,
    type_filter: Option<String>,
    batch_size: i64,
    buffered: VecDeque<Task>,
    /// `(priority, seq)` of the last row fetched.
    position: Option<(i32, i64)>,
    exhausted: bool,
}

impl PostgresPendingCursor {
    async fn fetch_batch(&mut self) -> RepositoryResult<()> {
        let (after_priority, after_seq) = match self.position {
            Some((priority, seq)) => (Some(priority), seq),
            None => (None, 0),
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE state = 'pending'
              AND (available_time IS NULL OR available_time <= now())
              AND (expiration_time IS NULL OR expiration_time > now())
              AND ($1::text IS NULL OR task_type = $1)
              AND ($2::int IS NULL OR priority < $2 OR (priority = $2 AND seq > $3))
            ORDER BY priority DESC, seq ASC
            LIMIT $4
            "#
        ))
        .bind(self.type_filter.as_deref())
        .bind(after_priority)
        .bind(after_seq)
        .bind(self.batch_size)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("iterate_pending", e))?;

        if (rows.len() as i64) < self.batch_size {
            self.exhausted = true;
        }

        for row in &rows {
            let decoded = TaskRow::from_row(row)
                .map_err(|e| RepositoryError::storage(format!("failed to decode task row: {e}")))?;
            self.position = Some((decoded.priority, decoded.seq));
            self.buffered.push_back(decoded.try_into()?);
        }
        Ok(())
    }
}

#[async_trait]
impl PendingCursor for PostgresPendingCursor {
    async fn next(&mut self) -> RepositoryResult<Option<Task>> {
        if self.buffered.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        Ok(self.buffered.pop_front())
    }

    async fn close(self: Box<Self>) -> RepositoryResult<()> {
        // Nothing is held between batches.
        Ok(())
    }
}

/// Map SQLx errors to repository errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                return RepositoryError::DuplicateName(
                    db_err
                        .constraint()
                        .map(|c| format!("{} ({c})", db_err.message()))
                        .unwrap_or_else(|| db_err.message().to_string()),
                );
            }
            RepositoryError::storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::storage(format!("connection pool closed in {operation}"))
        }
        other => RepositoryError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode_task(row: &PgRow) -> RepositoryResult<Task> {
    TaskRow::from_row(row)
        .map_err(|e| RepositoryError::storage(format!("failed to decode task row: {e}")))?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    seq: i64,
    id: uuid::Uuid,
    name: Option<String>,
    task_type: String,
    priority: i32,
    state: String,
    data: JsonValue,
    available_time: Option<DateTime<Utc>>,
    expiration_time: Option<DateTime<Utc>>,
    deadline_time: Option<DateTime<Utc>>,
    run_time: Option<DateTime<Utc>>,
    duration: Option<f64>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            task_type: row.try_get("task_type")?,
            priority: row.try_get("priority")?,
            state: row.try_get("state")?,
            data: row.try_get("data")?,
            available_time: row.try_get("available_time")?,
            expiration_time: row.try_get("expiration_time")?,
            deadline_time: row.try_get("deadline_time")?,
            run_time: row.try_get("run_time")?,
            duration: row.try_get("duration")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let data: Map<String, JsonValue> = match row.data {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(RepositoryError::storage(format!(
                    "task {} has non-object data: {other}",
                    row.id
                )));
            }
        };

        Ok(Task {
            id: TaskId::from_uuid(row.id),
            name: row.name,
            task_type: row.task_type,
            priority: row.priority,
            state: TaskState::from_stored(&row.state),
            data,
            available_time: row.available_time,
            expiration_time: row.expiration_time,
            deadline_time: row.deadline_time,
            run_time: row.run_time,
            duration: row.duration,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(state: &str, data: JsonValue) -> TaskRow {
        let now = Utc::now();
        TaskRow {
            seq: 1,
            id: uuid::Uuid::now_v7(),
            name: None,
            task_type: "echo".into(),
            priority: 0,
            state: state.into(),
            data,
            available_time: None,
            expiration_time: None,
            deadline_time: None,
            run_time: None,
            duration: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn decodes_known_and_unknown_states() {
        let task = Task::try_from(row("running", serde_json::json!({"n": 1}))).unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.data_value::<i32>("n").unwrap(), Some(1));

        let task = Task::try_from(row("archived", JsonValue::Null)).unwrap();
        assert_eq!(task.state, TaskState::Unknown);
        assert!(task.data.is_empty());
    }

    #[test]
    fn rejects_non_object_data() {
        let err = Task::try_from(row("pending", serde_json::json!([1, 2]))).unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
    }

    #[test]
    fn non_database_errors_map_to_storage() {
        let err = map_sqlx_error("get_task", sqlx::Error::PoolClosed);
        assert_eq!(
            err,
            RepositoryError::storage("connection pool closed in get_task")
        );
    }

    /// Runs against a live database when `CADENCE_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn live_claim_round_trip() {
        let Ok(url) = std::env::var("CADENCE_TEST_DATABASE_URL") else {
            return;
        };
        let repo = PostgresTaskRepository::connect(&url, 2).await.unwrap();
        repo.migrate().await.unwrap();

        let task_type = format!("live-{}", uuid::Uuid::now_v7());
        let view = repo.with_type_filter(&task_type);
        let low = view
            .create_task(CreateTask::new(&task_type).with_priority(1))
            .await
            .unwrap();
        let high = view
            .create_task(CreateTask::new(&task_type).with_priority(9))
            .await
            .unwrap();

        let mut cursor = view.iterate_pending().await.unwrap();
        let mut first = cursor.next().await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        cursor.close().await.unwrap();

        first.claim(Utc::now(), Utc::now() + chrono::Duration::minutes(1));
        let stored = view.update_from_state(&first, TaskState::Pending).await.unwrap();
        assert_eq!(stored.state, TaskState::Running);
        assert!(view
            .update_from_state(&first, TaskState::Pending)
            .await
            .unwrap_err()
            .is_already_claimed());

        view.delete_task(low.id).await.unwrap();
        view.delete_task(high.id).await.unwrap();
    }
}
