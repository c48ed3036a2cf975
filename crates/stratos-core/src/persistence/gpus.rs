// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GPU inventory and the embedded lease.
//!
//! Lease writes are compare-and-set: each `UPDATE` carries the lease state
//! it expects in its `WHERE` clause, and a zero row count means another
//! writer got there first.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::CoreError;
use crate::models::{Gpu, GpuData, GpuLease};

const COLUMNS: &str = "id, host, zone, data, lease_vm_id, lease_user_id, lease_end";

#[derive(Debug, sqlx::FromRow)]
struct GpuRow {
    id: String,
    host: String,
    zone: String,
    data: String,
    lease_vm_id: String,
    lease_user_id: String,
    lease_end: Option<DateTime<Utc>>,
}

impl TryFrom<GpuRow> for Gpu {
    type Error = CoreError;

    fn try_from(row: GpuRow) -> Result<Self, Self::Error> {
        let data: GpuData = serde_json::from_str(&row.data)
            .map_err(|e| CoreError::serialization(format!("gpu '{}' data", row.id), e))?;
        Ok(Gpu {
            id: row.id,
            host: row.host,
            zone: row.zone,
            data,
            lease: GpuLease {
                vm_id: row.lease_vm_id,
                user_id: row.lease_user_id,
                end: row.lease_end,
            },
        })
    }
}

/// GPU store.
#[derive(Clone)]
pub struct GpuRepository {
    pool: SqlitePool,
}

impl GpuRepository {
    /// Create a repository over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a GPU, or refresh its hardware fields if it already exists.
    /// An existing lease is never touched.
    pub async fn upsert(&self, gpu: &Gpu) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO gpus (id, host, zone, data, lease_vm_id, lease_user_id, lease_end)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                host = excluded.host,
                zone = excluded.zone,
                data = excluded.data
            "#,
        )
        .bind(&gpu.id)
        .bind(&gpu.host)
        .bind(&gpu.zone)
        .bind(serde_json::to_string(&gpu.data)?)
        .bind(&gpu.lease.vm_id)
        .bind(&gpu.lease.user_id)
        .bind(gpu.lease.end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one GPU.
    pub async fn get(&self, id: &str) -> Result<Option<Gpu>, CoreError> {
        let sql = format!("SELECT {} FROM gpus WHERE id = ?", COLUMNS);
        let row = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Gpu::try_from).transpose()
    }

    /// All GPUs, optionally restricted to one zone.
    pub async fn list(&self, zone: Option<&str>) -> Result<Vec<Gpu>, CoreError> {
        let sql = format!(
            "SELECT {} FROM gpus WHERE (? IS NULL OR zone = ?) ORDER BY id",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(zone)
            .bind(zone)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Gpu::try_from).collect()
    }

    /// GPUs on `host`.
    pub async fn list_on_host(&self, host: &str) -> Result<Vec<Gpu>, CoreError> {
        let sql = format!("SELECT {} FROM gpus WHERE host = ? ORDER BY id", COLUMNS);
        let rows = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(host)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Gpu::try_from).collect()
    }

    /// GPUs whose lease is held by some VM.
    pub async fn list_leased(&self) -> Result<Vec<Gpu>, CoreError> {
        let sql = format!(
            "SELECT {} FROM gpus WHERE lease_vm_id <> '' ORDER BY id",
            COLUMNS
        );
        let rows = sqlx::query_as::<_, GpuRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Gpu::try_from).collect()
    }

    /// The GPU leased to `vm_id`, if any.
    pub async fn get_by_vm(&self, vm_id: &str) -> Result<Option<Gpu>, CoreError> {
        if vm_id.is_empty() {
            return Ok(None);
        }
        let sql = format!("SELECT {} FROM gpus WHERE lease_vm_id = ? LIMIT 1", COLUMNS);
        let row = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Gpu::try_from).transpose()
    }

    /// Remove a GPU from the inventory.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM gpus WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lease `gpu_id` to `vm_id` until `until`.
    ///
    /// Returns `Ok(true)` when `vm_id` holds the lease afterwards and
    /// `Ok(false)` when a concurrent writer changed the lease between the
    /// read and the conditional write. A lease held by another VM is
    /// [`CoreError::GpuAlreadyAttached`]; an expired lease of the same VM
    /// is renewed.
    pub async fn attach(
        &self,
        gpu_id: &str,
        vm_id: &str,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let gpu = self.get(gpu_id).await?.ok_or_else(|| CoreError::GpuNotFound {
            gpu_id: gpu_id.to_string(),
        })?;

        if gpu.is_attached() && gpu.lease.vm_id != vm_id {
            return Err(CoreError::GpuAlreadyAttached {
                gpu_id: gpu_id.to_string(),
                vm_id: gpu.lease.vm_id,
            });
        }

        if gpu.lease.vm_id == vm_id {
            if !gpu.is_expired(Utc::now()) {
                return Ok(true);
            }
            let result =
                sqlx::query("UPDATE gpus SET lease_end = ? WHERE id = ? AND lease_vm_id = ?")
                    .bind(until)
                    .bind(gpu_id)
                    .bind(vm_id)
                    .execute(&self.pool)
                    .await?;
            let renewed = result.rows_affected() == 1;
            debug!(gpu_id = %gpu_id, vm_id = %vm_id, renewed, "Lease renewal");
            return Ok(renewed);
        }

        let result = sqlx::query(
            r#"
            UPDATE gpus SET lease_vm_id = ?, lease_user_id = ?, lease_end = ?
            WHERE id = ? AND lease_vm_id = ''
            "#,
        )
        .bind(vm_id)
        .bind(user_id)
        .bind(until)
        .bind(gpu_id)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() == 1;
        debug!(gpu_id = %gpu_id, vm_id = %vm_id, won, "Lease acquisition");
        Ok(won)
    }

    /// Release whatever GPU `vm_id` holds. Returns whether a lease was cleared.
    pub async fn detach(&self, vm_id: &str) -> Result<bool, CoreError> {
        if vm_id.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE gpus SET lease_vm_id = '', lease_user_id = '', lease_end = NULL
            WHERE lease_vm_id = ?
            "#,
        )
        .bind(vm_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::persistence::Database;

    fn gpu(host: &str, bus: &str) -> Gpu {
        Gpu::new(
            host,
            "se-1",
            GpuData {
                name: "A100".to_string(),
                vendor: "NVIDIA".to_string(),
                vendor_id: "10de".to_string(),
                device_id: "20b0".to_string(),
                bus: bus.to_string(),
            },
        )
    }

    async fn repo_with_gpu() -> (GpuRepository, String) {
        let repo = Database::in_memory().await.unwrap().gpus();
        let gpu = gpu("host-1", "01:00.0");
        repo.upsert(&gpu).await.unwrap();
        (repo, gpu.id)
    }

    #[tokio::test]
    async fn test_attach_free_gpu() {
        let (repo, id) = repo_with_gpu().await;
        let until = Utc::now() + Duration::hours(1);

        assert!(repo.attach(&id, "v1", "u1", until).await.unwrap());

        let gpu = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(gpu.lease.vm_id, "v1");
        assert_eq!(gpu.lease.user_id, "u1");
        assert!(gpu.lease.end.is_some());
        assert_eq!(repo.get_by_vm("v1").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_attach_missing_gpu() {
        let (repo, _) = repo_with_gpu().await;
        let err = repo
            .attach("nope", "v1", "u1", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "GPU_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_attach_taken_gpu_fails() {
        let (repo, id) = repo_with_gpu().await;
        let until = Utc::now() + Duration::hours(1);
        repo.attach(&id, "v1", "u1", until).await.unwrap();

        let err = repo.attach(&id, "v2", "u2", until).await.unwrap_err();
        assert!(matches!(err, CoreError::GpuAlreadyAttached { ref vm_id, .. } if vm_id == "v1"));
    }

    #[tokio::test]
    async fn test_reattach_same_vm_renews_expired_lease() {
        let (repo, id) = repo_with_gpu().await;
        repo.attach(&id, "v1", "u1", Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        assert!(repo.get(&id).await.unwrap().unwrap().is_expired(Utc::now()));

        let until = Utc::now() + Duration::hours(2);
        assert!(repo.attach(&id, "v1", "u1", until).await.unwrap());
        let gpu = repo.get(&id).await.unwrap().unwrap();
        assert!(!gpu.is_expired(Utc::now()));

        // A live lease is left as is.
        assert!(repo.attach(&id, "v1", "u1", Utc::now()).await.unwrap());
        assert!(!repo.get(&id).await.unwrap().unwrap().is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn test_concurrent_attach_has_one_winner() {
        let (repo, id) = repo_with_gpu().await;
        let until = Utc::now() + Duration::hours(1);

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                repo.attach(&id, &format!("v{}", i), "u1", until).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if let Ok(true) = handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (repo, id) = repo_with_gpu().await;
        repo.attach(&id, "v1", "u1", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        assert!(repo.detach("v1").await.unwrap());
        assert!(!repo.detach("v1").await.unwrap());
        assert!(!repo.detach("").await.unwrap());

        let gpu = repo.get(&id).await.unwrap().unwrap();
        assert!(!gpu.is_attached());
        assert!(gpu.lease.end.is_none());
        assert!(repo.list_leased().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_keeps_lease() {
        let (repo, id) = repo_with_gpu().await;
        repo.attach(&id, "v1", "u1", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        let mut refreshed = gpu("host-1", "01:00.0");
        refreshed.data.name = "A100 80GB".to_string();
        repo.upsert(&refreshed).await.unwrap();

        let gpu = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(gpu.data.name, "A100 80GB");
        assert_eq!(gpu.lease.vm_id, "v1");
        assert_eq!(repo.list(Some("se-1")).await.unwrap().len(), 1);
        assert!(repo.list(Some("other")).await.unwrap().is_empty());
        assert_eq!(repo.list_on_host("host-1").await.unwrap().len(), 1);
    }
}
