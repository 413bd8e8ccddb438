//! Capability traits and their wire types.
//!
//! Each trait is object-safe (`async_trait`) so the orchestrator can hold
//! `Arc<dyn …>` handles and tests can swap in the simulated backend.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackgrid_core::{ImageRef, ResourceId, ResourceKind};

use crate::error::CloudResult;

// ── Cloud resources ────────────────────────────────────────────────

/// Request to create one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub kind: ResourceKind,
    pub name: String,
    /// Idempotency key. Repeating a create with the same token returns
    /// the resource the first attempt created.
    pub client_token: String,
    pub spec: serde_json::Value,
}

/// Remote lifecycle of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResourceState {
    Creating,
    Available,
    Deleting,
    Failed { reason: String },
}

/// What the provider reports about a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub name: String,
    pub state: ResourceState,
    /// Provider-computed outputs (DNS names, revisions, deployment status).
    pub attributes: serde_json::Value,
}

impl ResourceHandle {
    pub fn is_available(&self) -> bool {
        self.state == ResourceState::Available
    }

    /// String attribute lookup.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait CloudResourceApi: Send + Sync {
    async fn create(&self, request: &CreateRequest) -> CloudResult<ResourceHandle>;
    async fn read(&self, id: &ResourceId) -> CloudResult<Option<ResourceHandle>>;
    async fn update(&self, id: &ResourceId, spec: &serde_json::Value) -> CloudResult<ResourceHandle>;
    async fn delete(&self, id: &ResourceId) -> CloudResult<()>;
}

// ── DNS ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Cname,
    Txt,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordType::A => "A",
            RecordType::Cname => "CNAME",
            RecordType::Txt => "TXT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: RecordType,
    pub value: String,
    pub ttl: u32,
}

#[async_trait]
pub trait DnsZoneApi: Send + Sync {
    /// Create or replace the record with the same name and type.
    async fn publish(&self, zone_id: &str, record: &DnsRecord) -> CloudResult<()>;
    async fn query(
        &self,
        zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> CloudResult<Option<DnsRecord>>;
}

// ── Certificate authority ──────────────────────────────────────────

/// DNS record the authority expects to find before issuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationToken {
    pub record_name: String,
    pub record_value: String,
    pub record_type: RecordType,
}

impl ValidationToken {
    pub fn to_record(&self, ttl: u32) -> DnsRecord {
        DnsRecord {
            name: self.record_name.clone(),
            record_type: self.record_type,
            value: self.record_value.clone(),
            ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateTicket {
    pub certificate_id: String,
    pub token: ValidationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthorityStatus {
    Pending,
    Issued,
    Rejected { reason: String },
}

#[async_trait]
pub trait CertificateAuthorityApi: Send + Sync {
    async fn request(&self, domain: &str) -> CloudResult<CertificateTicket>;
    async fn poll(&self, certificate_id: &str) -> CloudResult<AuthorityStatus>;
}

// ── Registry ───────────────────────────────────────────────────────

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Build and push `context`, returning a digest-pinned reference.
    async fn publish(&self, context: &Path, repository: &str) -> CloudResult<ImageRef>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_becomes_dns_record() {
        let token = ValidationToken {
            record_name: "_abc.app.example.com.".to_string(),
            record_value: "_xyz.validations.example.".to_string(),
            record_type: RecordType::Cname,
        };
        let record = token.to_record(60);
        assert_eq!(record.name, "_abc.app.example.com.");
        assert_eq!(record.record_type, RecordType::Cname);
        assert_eq!(record.ttl, 60);
    }

    #[test]
    fn record_type_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&RecordType::Cname).unwrap(), "\"CNAME\"");
        assert_eq!(RecordType::Txt.to_string(), "TXT");
    }

    #[test]
    fn record_types_key_a_zone_map() {
        let mut zone = std::collections::BTreeMap::new();
        zone.insert(("app.example.com".to_string(), RecordType::Txt), 3);
        zone.insert(("app.example.com".to_string(), RecordType::A), 1);
        zone.insert(("app.example.com".to_string(), RecordType::Cname), 2);
        let order: Vec<_> = zone.keys().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![RecordType::A, RecordType::Cname, RecordType::Txt]);
    }
}
