//! In-process identity backend

use crate::identity::{IdentityBackend, IdentityConfiguration};
use crate::types::Identity;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct IdentityData {
    audit_info: Vec<u8>,
    token_metadata: Vec<u8>,
    token_metadata_audit_info: Vec<u8>,
}

#[derive(Debug, Default)]
struct IdentityTables {
    configurations: Vec<IdentityConfiguration>,
    identity_data: HashMap<String, IdentityData>,
    signers: HashMap<String, Vec<u8>>,
}

/// Identity tables kept in process memory
#[derive(Debug, Default)]
pub struct MemoryIdentityBackend {
    tables: RwLock<IdentityTables>,
}

impl MemoryIdentityBackend {
    /// Empty tables
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityBackend for MemoryIdentityBackend {
    async fn add_configuration(&self, configuration: &IdentityConfiguration) -> Result<()> {
        let mut tables = self.tables.write();
        let duplicate = tables
            .configurations
            .iter()
            .any(|c| c.id == configuration.id && c.config_type == configuration.config_type);
        if duplicate {
            return Err(Error::Other(format!(
                "configuration [{}:{}] already exists",
                configuration.id, configuration.config_type
            )));
        }
        tables.configurations.push(configuration.clone());
        Ok(())
    }

    async fn configurations(&self, config_type: &str) -> Result<Vec<IdentityConfiguration>> {
        Ok(self
            .tables
            .read()
            .configurations
            .iter()
            .filter(|c| c.config_type == config_type)
            .cloned()
            .collect())
    }

    async fn configuration_exists(&self, id: &str, config_type: &str, url: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .configurations
            .iter()
            .any(|c| c.id == id && c.config_type == config_type && c.url == url))
    }

    async fn insert_identity_data(
        &self,
        identity: &Identity,
        audit_info: &[u8],
        token_metadata: &[u8],
        token_metadata_audit_info: &[u8],
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let h = identity.unique_id();
        if tables.identity_data.contains_key(&h) {
            return Ok(false);
        }
        tables.identity_data.insert(
            h,
            IdentityData {
                audit_info: audit_info.to_vec(),
                token_metadata: token_metadata.to_vec(),
                token_metadata_audit_info: token_metadata_audit_info.to_vec(),
            },
        );
        Ok(true)
    }

    async fn audit_info(&self, identity_hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .identity_data
            .get(identity_hash)
            .map(|d| d.audit_info.clone()))
    }

    async fn token_info(&self, identity_hash: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .identity_data
            .get(identity_hash)
            .map(|d| (d.token_metadata.clone(), d.token_metadata_audit_info.clone())))
    }

    async fn insert_signer_info(&self, identity: &Identity, info: &[u8]) -> Result<bool> {
        let mut tables = self.tables.write();
        let h = identity.unique_id();
        if tables.signers.contains_key(&h) {
            return Ok(false);
        }
        tables.signers.insert(h, info.to_vec());
        Ok(true)
    }

    async fn existing_signers(&self, identity_hashes: &[String]) -> Result<HashSet<String>> {
        let tables = self.tables.read();
        Ok(identity_hashes
            .iter()
            .filter(|h| tables.signers.contains_key(h.as_str()))
            .cloned()
            .collect())
    }

    async fn signer_info(&self, identity_hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().signers.get(identity_hash).cloned())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
