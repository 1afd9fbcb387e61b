//! SQLite identity backend

use super::Database;
use crate::identity::{IdentityBackend, IdentityConfiguration};
use crate::types::Identity;
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;

/// Identity tables over a shared [`Database`]
#[derive(Debug, Clone)]
pub struct SqlIdentityBackend {
    db: Database,
}

impl SqlIdentityBackend {
    /// Create a backend; the schema must already exist
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityBackend for SqlIdentityBackend {
    async fn add_configuration(&self, configuration: &IdentityConfiguration) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, type, url, conf, raw) VALUES (?, ?, ?, ?, ?)",
            self.db.tables().identity_configurations
        ))
        .bind(&configuration.id)
        .bind(&configuration.config_type)
        .bind(&configuration.url)
        .bind(&configuration.config)
        .bind(&configuration.raw)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn configurations(&self, config_type: &str) -> Result<Vec<IdentityConfiguration>> {
        let rows = sqlx::query(&format!(
            "SELECT id, url, conf, raw FROM {} WHERE type = ? ORDER BY rowid ASC",
            self.db.tables().identity_configurations
        ))
        .bind(config_type)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<IdentityConfiguration> {
                Ok(IdentityConfiguration {
                    id: row.try_get(0)?,
                    config_type: config_type.to_string(),
                    url: row.try_get(1)?,
                    config: row.try_get::<Option<Vec<u8>>, _>(2)?.unwrap_or_default(),
                    raw: row.try_get::<Option<Vec<u8>>, _>(3)?.unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn configuration_exists(&self, id: &str, config_type: &str, url: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 FROM {} WHERE id = ? AND type = ? AND url = ?",
            self.db.tables().identity_configurations
        ))
        .bind(id)
        .bind(config_type)
        .bind(url)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| {
            Error::Other(format!(
                "failed getting configuration for [{}:{}:{}]: {}",
                id, config_type, url, e
            ))
        })?;
        Ok(row.is_some())
    }

    async fn insert_identity_data(
        &self,
        identity: &Identity,
        audit_info: &[u8],
        token_metadata: &[u8],
        token_metadata_audit_info: &[u8],
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (identity_hash, identity, identity_audit_info, token_metadata, \
             token_metadata_audit_info) VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
            self.db.tables().identity_info
        ))
        .bind(identity.unique_id())
        .bind(identity.as_bytes())
        .bind(audit_info)
        .bind(token_metadata)
        .bind(token_metadata_audit_info)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn audit_info(&self, identity_hash: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(&format!(
            "SELECT identity_audit_info FROM {} WHERE identity_hash = ?",
            self.db.tables().identity_info
        ))
        .bind(identity_hash)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|r| r.try_get::<Vec<u8>, _>(0).map_err(Error::from))
            .transpose()
    }

    async fn token_info(&self, identity_hash: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let row = sqlx::query(&format!(
            "SELECT token_metadata, token_metadata_audit_info FROM {} WHERE identity_hash = ?",
            self.db.tables().identity_info
        ))
        .bind(identity_hash)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => {
                let metadata: Option<Vec<u8>> = row.try_get(0)?;
                let audit: Option<Vec<u8>> = row.try_get(1)?;
                Ok(Some((metadata.unwrap_or_default(), audit.unwrap_or_default())))
            }
            None => Ok(None),
        }
    }

    async fn insert_signer_info(&self, identity: &Identity, info: &[u8]) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (identity_hash, identity, info) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
            self.db.tables().signers
        ))
        .bind(identity.unique_id())
        .bind(identity.as_bytes())
        .bind(info)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn existing_signers(&self, identity_hashes: &[String]) -> Result<HashSet<String>> {
        if identity_hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT identity_hash FROM {} WHERE identity_hash IN (",
            self.db.tables().signers
        ));
        let mut list = qb.separated(", ");
        for h in identity_hashes {
            list.push_bind(h.clone());
        }
        list.push_unseparated(")");

        let rows = qb.build().fetch_all(self.db.pool()).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Error::from))
            .collect()
    }

    async fn signer_info(&self, identity_hash: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(&format!(
            "SELECT info FROM {} WHERE identity_hash = ?",
            self.db.tables().signers
        ))
        .bind(identity_hash)
        .fetch_optional(self.db.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Option<Vec<u8>>, _>(0)?.unwrap_or_default())),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }
}
