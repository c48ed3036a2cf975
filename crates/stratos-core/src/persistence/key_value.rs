// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Small TTL key/value cache.
//!
//! Host telemetry and worker heartbeats are written here. Expired entries
//! are invisible to reads and removed lazily by [`KeyValueCache::purge_expired`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

use crate::error::CoreError;

/// TTL key/value store backed by the `kv_cache` table.
#[derive(Clone)]
pub struct KeyValueCache {
    pool: SqlitePool,
}

fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| Utc::now() + ttl)
}

impl KeyValueCache {
    /// Create a cache over `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store `value` under `key`. `None` never expires.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read an unexpired value.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_cache WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    /// Store a JSON-encoded value.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CoreError> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| CoreError::serialization(format!("cache key '{}'", key), e))?;
        self.set(key, &encoded, ttl).await
    }

    /// Read a JSON-encoded value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoreError> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::serialization(format!("cache key '{}'", key), e)),
            None => Ok(None),
        }
    }

    /// Remove `key`.
    pub async fn delete(&self, key: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM kv_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unexpired `(key, value)` pairs whose key starts with `prefix`.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT key, value FROM kv_cache
            WHERE instr(key, ?) = 1 AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, CoreError> {
        let result =
            sqlx::query("DELETE FROM kv_cache WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
