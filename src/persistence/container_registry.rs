//! Durable registry of sandbox containers backed by `SQLite`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::models::container::{
    ContainerFilter, ContainerPatch, ContainerRecord, ContainerStatus, NewContainer,
};
use crate::{AppError, Result};

use super::db::Database;

/// Repository of container records.
///
/// Every mutation for a given container id runs under that id's async
/// lock, so read-modify-write cycles never interleave. Unrelated ids
/// proceed independently.
#[derive(Clone)]
pub struct ContainerRegistry {
    db: Arc<Database>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ContainerRow {
    container_id: String,
    image: String,
    unit_id: Option<String>,
    status: String,
    exit_code: Option<i64>,
    created_at: String,
    last_activity_at: String,
}

impl ContainerRow {
    /// Convert a database row into the domain model.
    fn into_record(self) -> Result<ContainerRecord> {
        let status = parse_status(&self.status)?;
        let created_at = parse_timestamp("created_at", &self.created_at)?;
        let last_activity_at = parse_timestamp("last_activity_at", &self.last_activity_at)?;
        let exit_code = self
            .exit_code
            .map(i32::try_from)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid exit_code: {e}")))?;

        Ok(ContainerRecord {
            container_id: self.container_id,
            image: self.image,
            unit_id: self.unit_id,
            status,
            exit_code,
            created_at,
            last_activity_at,
        })
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn parse_status(s: &str) -> Result<ContainerStatus> {
    match s {
        "created" => Ok(ContainerStatus::Created),
        "running" => Ok(ContainerStatus::Running),
        "exited" => Ok(ContainerStatus::Exited),
        "removed" => Ok(ContainerStatus::Removed),
        other => Err(AppError::Db(format!("invalid container status: {other}"))),
    }
}

const SELECT_COLUMNS: &str =
    "SELECT container_id, image, unit_id, status, exit_code, created_at, last_activity_at \
     FROM container";

impl ContainerRegistry {
    /// Create a new registry over an already bootstrapped database.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn key_lock(&self, container_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(container_id.to_owned()).or_default())
    }

    /// Register a freshly created container in `created` status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an empty id, or `AppError::Db`
    /// if the insert fails (including a duplicate id).
    pub async fn create(&self, new: &NewContainer) -> Result<ContainerRecord> {
        if new.container_id.trim().is_empty() {
            return Err(AppError::Validation("container id must not be empty".into()));
        }

        let lock = self.key_lock(&new.container_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let now_str = now.to_rfc3339();
        sqlx::query(
            "INSERT INTO container (container_id, image, unit_id, status, exit_code,
             created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
        )
        .bind(&new.container_id)
        .bind(&new.image)
        .bind(&new.unit_id)
        .bind(ContainerStatus::Created.as_str())
        .bind(&now_str)
        .execute(self.db.as_ref())
        .await?;

        Ok(ContainerRecord {
            container_id: new.container_id.clone(),
            image: new.image.clone(),
            unit_id: new.unit_id.clone(),
            status: ContainerStatus::Created,
            exit_code: None,
            created_at: now,
            last_activity_at: now,
        })
    }

    /// Retrieve a container record by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists.
    pub async fn get(&self, container_id: &str) -> Result<ContainerRecord> {
        self.fetch(container_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("container {container_id} not found")))
    }

    async fn fetch(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        let query = format!("{SELECT_COLUMNS} WHERE container_id = ?1");
        let row = sqlx::query_as::<_, ContainerRow>(&query)
            .bind(container_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(ContainerRow::into_record).transpose()
    }

    /// Apply `patch` to a record, respecting the status state machine.
    ///
    /// Re-applying the current status is accepted and only refreshes
    /// `last_activity_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids, `AppError::Validation`
    /// for a disallowed transition, or `AppError::Db` on persistence failure.
    pub async fn update(&self, container_id: &str, patch: ContainerPatch) -> Result<ContainerRecord> {
        let lock = self.key_lock(container_id);
        let _guard = lock.lock().await;

        let mut current = self.get(container_id).await?;
        if let Some(next) = patch.status {
            if next != current.status && !current.status.can_transition_to(next) {
                return Err(AppError::Validation(format!(
                    "container {container_id} cannot move from {} to {next}",
                    current.status
                )));
            }
            current.status = next;
        }
        if patch.exit_code.is_some() {
            current.exit_code = patch.exit_code;
        }
        current.last_activity_at = Utc::now();

        self.write(&current).await?;
        Ok(current)
    }

    /// Refresh `last_activity_at` without changing status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids or `AppError::Db` on
    /// persistence failure.
    pub async fn touch(&self, container_id: &str) -> Result<()> {
        self.update(container_id, ContainerPatch::default())
            .await
            .map(|_| ())
    }

    /// List records matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerRecord>> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE (?1 IS NULL OR status = ?1) \
             AND (?2 IS NULL OR unit_id = ?2) ORDER BY created_at, container_id"
        );
        let rows = sqlx::query_as::<_, ContainerRow>(&query)
            .bind(filter.status.map(ContainerStatus::as_str))
            .bind(&filter.unit_id)
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(ContainerRow::into_record).collect()
    }

    /// Mark a record removed. Removing an already-removed id succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown ids or `AppError::Db` on
    /// persistence failure.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let lock = self.key_lock(container_id);
        let _guard = lock.lock().await;

        let mut current = self.get(container_id).await?;
        if current.status == ContainerStatus::Removed {
            return Ok(());
        }
        current.status = ContainerStatus::Removed;
        current.last_activity_at = Utc::now();
        self.write(&current).await
    }

    /// Delete removed records whose last activity predates `older_than`.
    ///
    /// Returns the number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let cutoff = older_than.to_rfc3339();
        let ids = sqlx::query_as::<_, (String,)>(
            "SELECT container_id FROM container WHERE status = 'removed' AND last_activity_at < ?1",
        )
        .bind(&cutoff)
        .fetch_all(self.db.as_ref())
        .await?;

        let mut deleted = 0;
        for (container_id,) in ids {
            let lock = self.key_lock(&container_id);
            let guard = lock.lock().await;
            let result = sqlx::query(
                "DELETE FROM container WHERE container_id = ?1 AND status = 'removed'",
            )
            .bind(&container_id)
            .execute(self.db.as_ref())
            .await?;
            deleted += result.rows_affected();
            drop(guard);
            self.locks.remove(&container_id);
        }
        Ok(deleted)
    }

    async fn write(&self, record: &ContainerRecord) -> Result<()> {
        sqlx::query(
            "UPDATE container SET status = ?1, exit_code = ?2, last_activity_at = ?3
             WHERE container_id = ?4",
        )
        .bind(record.status.as_str())
        .bind(record.exit_code)
        .bind(record.last_activity_at.to_rfc3339())
        .bind(&record.container_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}
