//! Identity persistence with cached signer and audit-info lookups
//!
//! [`IdentityBackend`] is the raw table access implemented by each storage
//! backend. [`IdentityStore`] fronts it with two caches keyed by
//! [`Identity::unique_id`]; the caches only save round trips, every miss goes
//! to the backend.

use crate::cache::{Cache, DedupCache};
use crate::config::CacheConfig;
use crate::types::Identity;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Stored wallet/identity configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfiguration {
    /// Configuration ID
    pub id: String,
    /// Kind of configuration (owner, issuer, auditor, ...)
    pub config_type: String,
    /// Location of the key material
    pub url: String,
    /// Serialized configuration
    pub config: Vec<u8>,
    /// Raw payload
    pub raw: Vec<u8>,
}

/// Raw identity table access
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Insert a configuration; `(id, config_type)` must be new
    async fn add_configuration(&self, configuration: &IdentityConfiguration) -> Result<()>;

    /// Configurations of one type, in insertion order
    async fn configurations(&self, config_type: &str) -> Result<Vec<IdentityConfiguration>>;

    /// Whether the exact `(id, type, url)` triple is stored
    async fn configuration_exists(&self, id: &str, config_type: &str, url: &str) -> Result<bool>;

    /// Insert identity data; `false` when a row for the identity already existed
    async fn insert_identity_data(
        &self,
        identity: &Identity,
        audit_info: &[u8],
        token_metadata: &[u8],
        token_metadata_audit_info: &[u8],
    ) -> Result<bool>;

    /// Audit info stored for an identity hash
    async fn audit_info(&self, identity_hash: &str) -> Result<Option<Vec<u8>>>;

    /// Token metadata and its audit info stored for an identity hash
    async fn token_info(&self, identity_hash: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>>;

    /// Insert signer info; `false` when the signer was already stored
    async fn insert_signer_info(&self, identity: &Identity, info: &[u8]) -> Result<bool>;

    /// The subset of `identity_hashes` that have signer info, in one round trip
    async fn existing_signers(&self, identity_hashes: &[String]) -> Result<HashSet<String>>;

    /// Signer info stored for an identity hash
    async fn signer_info(&self, identity_hash: &str) -> Result<Option<Vec<u8>>>;

    /// Release backend resources
    async fn close(&self) -> Result<()>;
}

/// Identity store with signer-existence and audit-info caches
pub struct IdentityStore {
    backend: Arc<dyn IdentityBackend>,
    signer_info_cache: Arc<dyn Cache<bool>>,
    audit_info_cache: Arc<dyn Cache<Option<Vec<u8>>>>,
}

impl IdentityStore {
    /// Store with bounded [`DedupCache`]s sized from `config`
    pub fn new(backend: Arc<dyn IdentityBackend>, config: &CacheConfig) -> Self {
        Self::with_caches(
            backend,
            Arc::new(DedupCache::new(config.signer_info_capacity)),
            Arc::new(DedupCache::new(config.audit_info_capacity)),
        )
    }

    /// Store with caller-provided caches
    pub fn with_caches(
        backend: Arc<dyn IdentityBackend>,
        signer_info_cache: Arc<dyn Cache<bool>>,
        audit_info_cache: Arc<dyn Cache<Option<Vec<u8>>>>,
    ) -> Self {
        Self {
            backend,
            signer_info_cache,
            audit_info_cache,
        }
    }

    /// Persist a configuration
    pub async fn add_configuration(&self, configuration: &IdentityConfiguration) -> Result<()> {
        self.backend.add_configuration(configuration).await
    }

    /// Configurations of `config_type`
    pub async fn configurations(&self, config_type: &str) -> Result<Vec<IdentityConfiguration>> {
        self.backend.configurations(config_type).await
    }

    /// Whether the `(id, type, url)` configuration is stored
    pub async fn configuration_exists(&self, id: &str, config_type: &str, url: &str) -> Result<bool> {
        let exists = self
            .backend
            .configuration_exists(id, config_type, url)
            .await?;
        tracing::debug!(id, config_type, url, exists, "configuration lookup");
        Ok(exists)
    }

    /// Persist audit data of `identity`
    ///
    /// Storing the same audit info twice is accepted; different audit info for
    /// an identity that already has some is an error.
    pub async fn store_identity_data(
        &self,
        identity: &Identity,
        audit_info: &[u8],
        token_metadata: &[u8],
        token_metadata_audit_info: &[u8],
    ) -> Result<()> {
        let h = identity.unique_id();
        tracing::debug!(identity = %h, "store identity data");

        let inserted = self
            .backend
            .insert_identity_data(identity, audit_info, token_metadata, token_metadata_audit_info)
            .await?;
        if !inserted {
            let stored = self.get_audit_info(identity).await?;
            if stored.as_deref() != Some(audit_info) {
                return Err(Error::Other(format!(
                    "different audit info stored for [{}]",
                    h
                )));
            }
            tracing::debug!(identity = %h, "audit info already stored");
            return Ok(());
        }

        self.audit_info_cache.add(&h, Some(audit_info.to_vec()));
        Ok(())
    }

    /// Audit info of `identity`; concurrent misses share one backend load
    pub async fn get_audit_info(&self, identity: &Identity) -> Result<Option<Vec<u8>>> {
        let h = identity.unique_id();
        let loader = async {
            tracing::debug!(identity = %h, "loading audit info from backend");
            self.backend.audit_info(&h).await
        }
        .boxed();
        let (value, _cached) = self.audit_info_cache.get_or_load(&h, loader).await?;
        Ok(value)
    }

    /// Token metadata and token-metadata audit info of `identity`
    pub async fn get_token_info(&self, identity: &Identity) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.backend.token_info(&identity.unique_id()).await
    }

    /// Persist signer info; storing an already known signer is not an error
    pub async fn store_signer_info(&self, identity: &Identity, info: &[u8]) -> Result<()> {
        let h = identity.unique_id();
        if !self.backend.insert_signer_info(identity, info).await? {
            tracing::debug!(identity = %h, "signer info already stored");
        }
        self.signer_info_cache.add(&h, true);
        Ok(())
    }

    /// Unique IDs of those `identities` that have signer info
    ///
    /// Cached answers are used first; the rest is resolved with a single
    /// backend query whose positive and negative answers are both cached.
    pub async fn get_existing_signer_info(&self, identities: &[Identity]) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for identity in identities {
            let h = identity.unique_id();
            match self.signer_info_cache.get(&h) {
                Some(true) => found.push(h),
                Some(false) => {}
                None => missing.push(h),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let existing = self.backend.existing_signers(&missing).await?;
        for h in missing {
            let exists = existing.contains(&h);
            self.signer_info_cache.add(&h, exists);
            if exists {
                found.push(h);
            }
        }
        Ok(found)
    }

    /// Whether `identity` has signer info
    pub async fn signer_info_exists(&self, identity: &Identity) -> Result<bool> {
        let existing = self
            .get_existing_signer_info(std::slice::from_ref(identity))
            .await?;
        Ok(!existing.is_empty())
    }

    /// Signer info of `identity`
    pub async fn get_signer_info(&self, identity: &Identity) -> Result<Option<Vec<u8>>> {
        self.backend.signer_info(&identity.unique_id()).await
    }

    /// Release backend resources
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore").finish_non_exhaustive()
    }
}
