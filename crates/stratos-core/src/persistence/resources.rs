// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic repository over a resource family.
//!
//! Every query is implicitly ANDed with `deleted_at IS NULL` unless the
//! repository was built with [`including_deleted`](ResourceRepository::including_deleted),
//! and with the owner scope if one was set with
//! [`scoped_to_owner`](ResourceRepository::scoped_to_owner).

use std::collections::BTreeMap;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::CoreError;
use crate::models::{Activity, ActivityRecord, Resource, ResourceKind};

use super::json_path;

const COLUMNS: &str = "id, name, owner_id, zone, created_at, updated_at, repaired_at, deleted_at, activities, spec, subsystems";

#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    id: String,
    name: String,
    owner_id: String,
    zone: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    repaired_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    activities: String,
    spec: String,
    subsystems: String,
}

impl ResourceRow {
    fn into_resource<K: ResourceKind>(self) -> Result<Resource<K>, CoreError> {
        let context = |field: &str| format!("{} '{}' {}", K::KIND, self.id, field);
        let activities: BTreeMap<String, ActivityRecord> = serde_json::from_str(&self.activities)
            .map_err(|e| CoreError::serialization(context("activities"), e))?;
        let spec: K::Spec = serde_json::from_str(&self.spec)
            .map_err(|e| CoreError::serialization(context("spec"), e))?;
        let subsystems: K::Subsystems = serde_json::from_str(&self.subsystems)
            .map_err(|e| CoreError::serialization(context("subsystems"), e))?;

        Ok(Resource {
            id: self.id,
            name: self.name,
            owner_id: self.owner_id,
            zone: self.zone,
            created_at: self.created_at,
            updated_at: self.updated_at,
            repaired_at: self.repaired_at,
            deleted_at: self.deleted_at,
            activities,
            spec,
            subsystems,
        })
    }
}

/// Page selection for list queries. Pages are zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Zero-based page index.
    pub page: u32,
    /// Items per page.
    pub page_size: u32,
}

/// Per-call filter for list and count queries.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    /// Restrict to these ids.
    pub ids: Option<Vec<String>>,
    /// Restrict to one owner.
    pub owner_id: Option<String>,
    /// Restrict to one zone.
    pub zone: Option<String>,
    /// Exact name match.
    pub name: Option<String>,
    /// Only resources currently doing this activity.
    pub activity: Option<Activity>,
    /// Only resources with no activity at all.
    pub idle: bool,
    /// Only resources never repaired, or last repaired before this instant.
    pub repaired_before: Option<DateTime<Utc>>,
    /// Page selection.
    pub pagination: Option<Pagination>,
}

impl ResourceFilter {
    /// An empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids.
    pub fn with_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to one owner.
    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Restrict to one zone.
    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Exact name match.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only resources doing `activity`.
    pub fn doing(mut self, activity: Activity) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Only resources with no activities.
    pub fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    /// Only resources not repaired since `at`.
    pub fn repaired_before(mut self, at: DateTime<Utc>) -> Self {
        self.repaired_before = Some(at);
        self
    }

    /// Select one page.
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.pagination = Some(Pagination { page, page_size });
        self
    }
}

/// Partial update of a live resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceUpdate {
    /// New name.
    pub name: Option<String>,
    /// New owner.
    pub owner_id: Option<String>,
    /// JSON merge patch applied to `spec`.
    pub spec_patch: Option<serde_json::Value>,
}

impl ResourceUpdate {
    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.owner_id.is_none() && self.spec_patch.is_none()
    }
}

/// Typed CRUD over one resource family.
pub struct ResourceRepository<K: ResourceKind> {
    pool: SqlitePool,
    owner_id: Option<String>,
    include_deleted: bool,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> Clone for ResourceRepository<K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            owner_id: self.owner_id.clone(),
            include_deleted: self.include_deleted,
            _kind: PhantomData,
        }
    }
}

impl<K: ResourceKind> ResourceRepository<K> {
    /// Create an unscoped repository that hides soft-deleted documents.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner_id: None,
            include_deleted: false,
            _kind: PhantomData,
        }
    }

    /// A copy of this repository that only sees resources of `owner_id`.
    pub fn scoped_to_owner(&self, owner_id: impl Into<String>) -> Self {
        let mut repo = self.clone();
        repo.owner_id = Some(owner_id.into());
        repo
    }

    /// A copy of this repository that also sees soft-deleted resources.
    pub fn including_deleted(&self) -> Self {
        let mut repo = self.clone();
        repo.include_deleted = true;
        repo
    }

    fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>, filter: &ResourceFilter) {
        qb.push(" WHERE 1 = 1");
        if !self.include_deleted {
            qb.push(" AND deleted_at IS NULL");
        }
        if let Some(owner_id) = &self.owner_id {
            qb.push(" AND owner_id = ").push_bind(owner_id.clone());
        }
        if let Some(ids) = &filter.ids {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND id IN (");
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(id.clone());
                }
                separated.push_unseparated(")");
            }
        }
        if let Some(owner_id) = &filter.owner_id {
            qb.push(" AND owner_id = ").push_bind(owner_id.clone());
        }
        if let Some(zone) = &filter.zone {
            qb.push(" AND zone = ").push_bind(zone.clone());
        }
        if let Some(name) = &filter.name {
            qb.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(activity) = filter.activity {
            qb.push(" AND json_extract(activities, ")
                .push_bind(activity.json_path())
                .push(") IS NOT NULL");
        }
        if filter.idle {
            qb.push(" AND NOT EXISTS (SELECT 1 FROM json_each(activities))");
        }
        if let Some(before) = filter.repaired_before {
            qb.push(" AND (repaired_at IS NULL OR repaired_at < ")
                .push_bind(before)
                .push(")");
        }
    }

    /// Fetch one resource by id.
    pub async fn get(&self, id: &str) -> Result<Option<Resource<K>>, CoreError> {
        let mut found = self.list(&ResourceFilter::new().with_ids([id])).await?;
        Ok(found.pop())
    }

    /// Fetch one resource by id, failing with `NotFound` if absent.
    pub async fn require(&self, id: &str) -> Result<Resource<K>, CoreError> {
        self.get(id).await?.ok_or_else(|| CoreError::NotFound {
            kind: K::KIND,
            id: id.to_string(),
        })
    }

    /// Fetch one resource by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Resource<K>>, CoreError> {
        let mut found = self.list(&ResourceFilter::new().named(name)).await?;
        Ok(found.pop())
    }

    /// List resources matching `filter`, oldest first.
    pub async fn list(&self, filter: &ResourceFilter) -> Result<Vec<Resource<K>>, CoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT {} FROM {}", COLUMNS, K::TABLE));
        self.push_conditions(&mut qb, filter);
        qb.push(" ORDER BY created_at ASC, id ASC");
        if let Some(page) = filter.pagination {
            qb.push(" LIMIT ")
                .push_bind(i64::from(page.page_size))
                .push(" OFFSET ")
                .push_bind(i64::from(page.page) * i64::from(page.page_size));
        }

        let rows = qb
            .build_query_as::<ResourceRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ResourceRow::into_resource).collect()
    }

    /// Ids of resources matching `filter`.
    pub async fn list_ids(&self, filter: &ResourceFilter) -> Result<Vec<String>, CoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT id FROM {}", K::TABLE));
        self.push_conditions(&mut qb, filter);
        qb.push(" ORDER BY created_at ASC, id ASC");
        let ids = qb
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Count resources matching `filter` (pagination is ignored).
    pub async fn count(&self, filter: &ResourceFilter) -> Result<u64, CoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", K::TABLE));
        self.push_conditions(&mut qb, filter);
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Whether a resource with `id` is visible through this repository.
    pub async fn exists(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self.count(&ResourceFilter::new().with_ids([id])).await? > 0)
    }

    /// Resources currently doing `activity`.
    pub async fn list_by_activity(&self, activity: Activity) -> Result<Vec<Resource<K>>, CoreError> {
        self.list(&ResourceFilter::new().doing(activity)).await
    }

    /// Resources with no activities at all.
    pub async fn list_with_no_activities(&self) -> Result<Vec<Resource<K>>, CoreError> {
        self.list(&ResourceFilter::new().idle()).await
    }

    fn map_insert_error(err: sqlx::Error, resource: &Resource<K>) -> CoreError {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            let message = db_err.message();
            if message.ends_with(&format!("{}.id", K::TABLE)) {
                return CoreError::DuplicateId {
                    kind: K::KIND,
                    id: resource.id.clone(),
                };
            }
            let key = if message.ends_with(&format!("{}.owner_id", K::TABLE)) {
                format!("owner '{}'", resource.owner_id)
            } else {
                format!("name '{}'", resource.name)
            };
            return CoreError::UniqueConstraintViolation { kind: K::KIND, key };
        }
        err.into()
    }

    fn encode(resource: &Resource<K>) -> Result<(String, String, String), CoreError> {
        Ok((
            serde_json::to_string(&resource.activities)?,
            serde_json::to_string(&resource.spec)?,
            serde_json::to_string(&resource.subsystems)?,
        ))
    }

    /// Insert a new document. Fails with `DuplicateId` if the id exists.
    pub async fn create(&self, resource: &Resource<K>) -> Result<(), CoreError> {
        let (activities, spec, subsystems) = Self::encode(resource)?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            K::TABLE,
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(&resource.id)
            .bind(&resource.name)
            .bind(&resource.owner_id)
            .bind(&resource.zone)
            .bind(resource.created_at)
            .bind(resource.updated_at)
            .bind(resource.repaired_at)
            .bind(resource.deleted_at)
            .bind(activities)
            .bind(spec)
            .bind(subsystems)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_insert_error(e, resource))?;
        Ok(())
    }

    /// Insert only if no live resource of the family has the same name.
    ///
    /// Returns `UniqueConstraintViolation` when the name is taken. The partial
    /// unique index backs this up if two inserts race.
    pub async fn create_if_unique(&self, resource: &Resource<K>) -> Result<(), CoreError> {
        let (activities, spec, subsystems) = Self::encode(resource)?;
        let sql = format!(
            r#"
            INSERT INTO {table} ({columns})
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE name = ? AND deleted_at IS NULL)
            "#,
            table = K::TABLE,
            columns = COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&resource.id)
            .bind(&resource.name)
            .bind(&resource.owner_id)
            .bind(&resource.zone)
            .bind(resource.created_at)
            .bind(resource.updated_at)
            .bind(resource.repaired_at)
            .bind(resource.deleted_at)
            .bind(activities)
            .bind(spec)
            .bind(subsystems)
            .bind(&resource.name)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_insert_error(e, resource))?;

        if result.rows_affected() == 0 {
            return Err(CoreError::UniqueConstraintViolation {
                kind: K::KIND,
                key: format!("name '{}'", resource.name),
            });
        }
        Ok(())
    }

    /// Apply a partial update to a live resource. Returns whether it matched.
    pub async fn update(&self, id: &str, update: &ResourceUpdate) -> Result<bool, CoreError> {
        if update.is_empty() {
            return self.exists(id).await;
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", K::TABLE));
        {
            let mut set = qb.separated(", ");
            if let Some(name) = &update.name {
                set.push("name = ").push_bind_unseparated(name.clone());
            }
            if let Some(owner_id) = &update.owner_id {
                set.push("owner_id = ").push_bind_unseparated(owner_id.clone());
            }
            if let Some(patch) = &update.spec_patch {
                set.push("spec = json_patch(spec, json(")
                    .push_bind_unseparated(serde_json::to_string(patch)?)
                    .push_unseparated("))");
            }
        }
        qb.push(" WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND deleted_at IS NULL");

        let result = qb.build().execute(&self.pool).await.map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e
                && db_err.is_unique_violation()
            {
                return CoreError::UniqueConstraintViolation {
                    kind: K::KIND,
                    key: format!("name '{}'", update.name.as_deref().unwrap_or_default()),
                };
            }
            CoreError::from(e)
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_json(
        &self,
        column: &str,
        id: &str,
        path: &[&str],
        value: String,
        live_only: bool,
    ) -> Result<bool, CoreError> {
        let guard = if live_only { " AND deleted_at IS NULL" } else { "" };
        let sql = format!(
            "UPDATE {table} SET {column} = json_set({column}, ?, json(?)) WHERE id = ?{guard}",
            table = K::TABLE,
        );
        let result = sqlx::query(&sql)
            .bind(json_path(path))
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_json(&self, column: &str, id: &str, path: &[&str]) -> Result<bool, CoreError> {
        let sql = format!(
            "UPDATE {table} SET {column} = json_remove({column}, ?) WHERE id = ?",
            table = K::TABLE,
        );
        let result = sqlx::query(&sql)
            .bind(json_path(path))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set one field of a live resource's spec.
    pub async fn set_spec_field<T: Serialize + ?Sized>(
        &self,
        id: &str,
        path: &[&str],
        value: &T,
    ) -> Result<bool, CoreError> {
        self.set_json("spec", id, path, serde_json::to_string(value)?, true)
            .await
    }

    /// Remove one field from a live resource's spec.
    pub async fn unset_spec_field(&self, id: &str, path: &[&str]) -> Result<bool, CoreError> {
        if !self.exists(id).await? {
            return Ok(false);
        }
        self.remove_json("spec", id, path).await
    }

    /// Record an observed subsystem projection at `subsystems.<path>`.
    pub async fn set_subsystem<T: Serialize + ?Sized>(
        &self,
        id: &str,
        path: &[&str],
        value: &T,
    ) -> Result<bool, CoreError> {
        self.set_json("subsystems", id, path, serde_json::to_string(value)?, true)
            .await
    }

    /// Forget a subsystem projection. Allowed on soft-deleted resources so a
    /// teardown can finish its bookkeeping.
    pub async fn unset_subsystem(&self, id: &str, path: &[&str]) -> Result<bool, CoreError> {
        self.remove_json("subsystems", id, path).await
    }

    /// Mark a resource deleted without removing the document.
    pub async fn soft_delete(&self, id: &str) -> Result<bool, CoreError> {
        let sql = format!(
            "UPDATE {} SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
            K::TABLE
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Physically remove the document.
    pub async fn hard_delete(&self, id: &str) -> Result<bool, CoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", K::TABLE);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, column: &str, id: &str) -> Result<bool, CoreError> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE id = ? AND deleted_at IS NULL",
            K::TABLE,
            column
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp `updated_at`.
    pub async fn mark_updated(&self, id: &str) -> Result<bool, CoreError> {
        self.touch("updated_at", id).await
    }

    /// Stamp `repaired_at`.
    pub async fn mark_repaired(&self, id: &str) -> Result<bool, CoreError> {
        self.touch("repaired_at", id).await
    }

    fn check_activity(activity: Activity) -> Result<(), CoreError> {
        if K::supports(activity) {
            Ok(())
        } else {
            Err(CoreError::InvalidActivity {
                kind: K::KIND,
                activity: activity.as_str().to_string(),
            })
        }
    }

    /// Add `activity` to a resource. Returns whether a document was updated.
    ///
    /// A missing resource is not an error. `beingCreated` is refused while
    /// `beingDeleted` is set, and adding `beingDeleted` drops `beingCreated`,
    /// so the two never coexist. Only `beingDeleted` may be re-added to a
    /// soft-deleted resource.
    pub async fn add_activity(&self, id: &str, activity: Activity) -> Result<bool, CoreError> {
        Self::check_activity(activity)?;
        let record = serde_json::to_string(&ActivityRecord::now(activity))?;

        let sql = match activity {
            Activity::BeingDeleted => format!(
                "UPDATE {} SET activities = json_set(json_remove(activities, ?), ?, json(?)) WHERE id = ?",
                K::TABLE
            ),
            Activity::BeingCreated => format!(
                "UPDATE {} SET activities = json_set(json_remove(activities, ?), ?, json(?)) \
                 WHERE id = ? AND deleted_at IS NULL \
                 AND json_extract(activities, '$.\"beingDeleted\"') IS NULL",
                K::TABLE
            ),
            _ => format!(
                "UPDATE {} SET activities = json_set(json_remove(activities, ?), ?, json(?)) \
                 WHERE id = ? AND deleted_at IS NULL",
                K::TABLE
            ),
        };

        // Only beingDeleted displaces another activity; for the rest the
        // removed path is the activity itself, which json_set restores.
        let displaced = match activity {
            Activity::BeingDeleted => Activity::BeingCreated.json_path(),
            other => other.json_path(),
        };

        let result = sqlx::query(&sql)
            .bind(displaced)
            .bind(activity.json_path())
            .bind(record)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove `activity` from a resource. Idempotent.
    pub async fn remove_activity(&self, id: &str, activity: Activity) -> Result<(), CoreError> {
        Self::check_activity(activity)?;
        self.remove_json("activities", id, &[activity.as_str()])
            .await?;
        Ok(())
    }

    /// Remove every activity from a resource.
    pub async fn clear_activities(&self, id: &str) -> Result<(), CoreError> {
        let sql = format!("UPDATE {} SET activities = '{{}}' WHERE id = ?", K::TABLE);
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Whether the resource is currently doing `activity`.
    pub async fn doing_activity(&self, id: &str, activity: Activity) -> Result<bool, CoreError> {
        let filter = ResourceFilter::new().with_ids([id]).doing(activity);
        Ok(self.count(&filter).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vm::{VmSpec, VmSpecs};
    use crate::models::{Deployment, DeploymentKind, Vm, VmKind};
    use crate::persistence::Database;

    fn vm(id: &str, name: &str, owner: &str) -> Vm {
        Vm::new(
            id,
            name,
            owner,
            "se-1",
            VmSpec {
                specs: VmSpecs {
                    cpu_cores: 2,
                    ram: 4,
                    disk_size: 20,
                },
                ssh_public_key: "ssh-rsa X".to_string(),
                ..Default::default()
            },
        )
    }

    async fn repo() -> ResourceRepository<VmKind> {
        Database::in_memory().await.unwrap().resources::<VmKind>()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();

        let fetched = repo.get("v1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "vm-a");
        assert_eq!(fetched.spec.specs.ram, 4);
        assert!(fetched.is_idle());
        assert!(repo.get_by_name("vm-a").await.unwrap().is_some());
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();
        let err = repo.create(&vm("v1", "vm-b", "u1")).await.unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_ID");
    }

    #[tokio::test]
    async fn test_create_if_unique_rejects_live_name() {
        let repo = repo().await;
        repo.create_if_unique(&vm("v1", "vm-a", "u1")).await.unwrap();

        let err = repo
            .create_if_unique(&vm("v2", "vm-a", "u2"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNIQUE_CONSTRAINT_VIOLATION");
        assert!(repo.get("v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_name_is_reusable_after_soft_delete() {
        let repo = repo().await;
        repo.create_if_unique(&vm("v1", "vm-a", "u1")).await.unwrap();
        assert!(repo.soft_delete("v1").await.unwrap());

        repo.create_if_unique(&vm("v2", "vm-a", "u1")).await.unwrap();

        assert!(repo.get("v1").await.unwrap().is_none());
        let deleted = repo.including_deleted().get("v1").await.unwrap().unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(repo.count(&ResourceFilter::new().named("vm-a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_activities_are_idempotent() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();

        assert!(repo.add_activity("v1", Activity::Updating).await.unwrap());
        assert!(repo.add_activity("v1", Activity::Updating).await.unwrap());
        assert!(repo.doing_activity("v1", Activity::Updating).await.unwrap());

        let fetched = repo.require("v1").await.unwrap();
        assert_eq!(fetched.activities.len(), 1);

        repo.remove_activity("v1", Activity::Updating).await.unwrap();
        repo.remove_activity("v1", Activity::Updating).await.unwrap();
        assert!(!repo.doing_activity("v1", Activity::Updating).await.unwrap());
    }

    #[tokio::test]
    async fn test_being_created_and_being_deleted_never_coexist() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1").with_activity(Activity::BeingCreated))
            .await
            .unwrap();

        repo.add_activity("v1", Activity::BeingDeleted).await.unwrap();
        let fetched = repo.require("v1").await.unwrap();
        assert!(fetched.doing(Activity::BeingDeleted));
        assert!(!fetched.doing(Activity::BeingCreated));

        assert!(!repo.add_activity("v1", Activity::BeingCreated).await.unwrap());
        let fetched = repo.require("v1").await.unwrap();
        assert!(!fetched.doing(Activity::BeingCreated));
    }

    #[tokio::test]
    async fn test_add_activity_on_missing_resource_is_noop() {
        let repo = repo().await;
        assert!(!repo.add_activity("ghost", Activity::BeingCreated).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_deleted_resource_only_accepts_being_deleted() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();
        repo.soft_delete("v1").await.unwrap();

        assert!(!repo.add_activity("v1", Activity::Updating).await.unwrap());
        assert!(repo.add_activity("v1", Activity::BeingDeleted).await.unwrap());
        assert!(
            repo.including_deleted()
                .doing_activity("v1", Activity::BeingDeleted)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_activity_outside_family_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.resources::<DeploymentKind>();
        repo.create(&Deployment::new("d1", "web", "u1", "se-1", Default::default()))
            .await
            .unwrap();

        let err = repo
            .add_activity("d1", Activity::AttachingGpu)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ACTIVITY");
    }

    #[tokio::test]
    async fn test_list_by_activity_and_idle() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();
        repo.create(&vm("v2", "vm-b", "u1")).await.unwrap();
        repo.add_activity("v2", Activity::Repairing).await.unwrap();

        let repairing = repo.list_by_activity(Activity::Repairing).await.unwrap();
        assert_eq!(repairing.len(), 1);
        assert_eq!(repairing[0].id, "v2");

        repo.remove_activity("v2", Activity::Repairing).await.unwrap();
        let idle = repo.list_with_no_activities().await.unwrap();
        assert_eq!(idle.len(), 2);
    }

    #[tokio::test]
    async fn test_owner_scope_and_pagination() {
        let repo = repo().await;
        for i in 0..5 {
            let owner = if i % 2 == 0 { "u1" } else { "u2" };
            repo.create(&vm(&format!("v{}", i), &format!("vm-{}", i), owner))
                .await
                .unwrap();
        }

        let scoped = repo.scoped_to_owner("u1");
        assert_eq!(scoped.count(&ResourceFilter::new()).await.unwrap(), 3);
        assert!(scoped.get("v1").await.unwrap().is_none());

        let page = repo.list(&ResourceFilter::new().page(1, 2)).await.unwrap();
        assert_eq!(page.len(), 2);
        let ids = repo.list_ids(&ResourceFilter::new()).await.unwrap();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_update_merges_spec_and_guards_deleted() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();

        let update = ResourceUpdate {
            spec_patch: Some(serde_json::json!({ "specs": { "ram": 8 } })),
            owner_id: Some("u2".to_string()),
            ..Default::default()
        };
        assert!(repo.update("v1", &update).await.unwrap());

        let fetched = repo.require("v1").await.unwrap();
        assert_eq!(fetched.spec.specs.ram, 8);
        assert_eq!(fetched.spec.specs.cpu_cores, 2);
        assert_eq!(fetched.owner_id, "u2");

        repo.soft_delete("v1").await.unwrap();
        assert!(!repo.update("v1", &update).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_into_taken_name_fails() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();
        repo.create(&vm("v2", "vm-b", "u1")).await.unwrap();

        let err = repo
            .update(
                "v2",
                &ResourceUpdate {
                    name: Some("vm-a".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNIQUE_CONSTRAINT_VIOLATION");
    }

    #[tokio::test]
    async fn test_subsystem_set_and_unset() {
        use crate::models::subsystems::hypervisor::{CsVm, HypervisorObject};

        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();

        let cs_vm = HypervisorObject::Vm(CsVm {
            id: "cs-1".to_string(),
            name: "vm-a".to_string(),
            ..Default::default()
        });
        repo.set_subsystem("v1", &["cs", "vm"], &cs_vm).await.unwrap();
        let fetched = repo.require("v1").await.unwrap();
        assert_eq!(fetched.subsystems.cs_vm().map(|v| v.id.as_str()), Some("cs-1"));

        repo.soft_delete("v1").await.unwrap();
        repo.unset_subsystem("v1", &["cs", "vm"]).await.unwrap();
        let fetched = repo.including_deleted().require("v1").await.unwrap();
        assert!(fetched.subsystems.is_empty());
    }

    #[tokio::test]
    async fn test_hard_delete_and_timestamps() {
        let repo = repo().await;
        repo.create(&vm("v1", "vm-a", "u1")).await.unwrap();

        assert!(repo.mark_updated("v1").await.unwrap());
        assert!(repo.mark_repaired("v1").await.unwrap());
        let fetched = repo.require("v1").await.unwrap();
        assert!(fetched.updated_at.is_some());
        assert!(fetched.repaired_at.is_some());

        assert!(repo.hard_delete("v1").await.unwrap());
        assert!(!repo.including_deleted().exists("v1").await.unwrap());
    }
}
