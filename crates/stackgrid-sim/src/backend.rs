//! In-memory cloud backend.
//!
//! One [`SimulatedCloud`] implements every capability trait. Clones share
//! state, so a test can hand `Arc`s of the same backend to the
//! orchestrator and still inspect calls, events and resources afterwards.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use stackgrid_cloud::{
    AuthorityStatus, CertificateAuthorityApi, CertificateTicket, CloudError, CloudResourceApi,
    CloudResult, CreateRequest, DnsRecord, DnsZoneApi, ImageRegistry, RecordType, ResourceHandle,
    ResourceState, ValidationToken,
};
use stackgrid_core::image::context_digest;
use stackgrid_core::{ImageRef, ResourceId, ResourceKind};
use tracing::{debug, info, warn};

use crate::faults::{AuthorityBehavior, Faults};
use crate::fleet::{self, FleetMemory};
use crate::log::{ApiCall, CloudEvent, Mutation, Operation, TopologySnapshot, replay};

/// Registry host of images published through the simulator.
pub const SIM_REGISTRY: &str = "registry.sim.local";

#[derive(Debug, Clone)]
struct SimResource {
    handle: ResourceHandle,
    spec: Value,
    reads_until_ready: u32,
}

#[derive(Debug, Clone)]
struct SimCertificate {
    domain: String,
    token: ValidationToken,
    polls_with_record: u32,
}

#[derive(Default)]
struct SimState {
    faults: Faults,
    resources: BTreeMap<ResourceId, SimResource>,
    tokens: HashMap<String, ResourceId>,
    minted: BTreeMap<ResourceKind, u32>,
    revisions: BTreeMap<String, u32>,
    fleets: HashMap<ResourceId, FleetMemory>,
    zones: BTreeMap<(String, String, RecordType), DnsRecord>,
    certificates: BTreeMap<String, SimCertificate>,
    calls: Vec<ApiCall>,
    events: Vec<CloudEvent>,
}

impl SimState {
    fn log(&mut self, operation: Operation, target: impl Into<String>, ok: bool) {
        self.calls.push(ApiCall {
            operation,
            target: target.into(),
            ok,
        });
    }

    fn emit(&mut self, mutation: Mutation, handle: &ResourceHandle, spec: &Value) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(CloudEvent {
            seq,
            mutation,
            kind: handle.kind,
            id: handle.id.clone(),
            name: handle.name.clone(),
            spec: spec.clone(),
        });
    }

    fn mint(&mut self, kind: ResourceKind) -> ResourceId {
        let n = self.minted.entry(kind).or_insert(0);
        *n += 1;
        ResourceId::new(format!("{}-{:04}", kind.id_prefix(), n))
    }

    /// Image of the definition a service spec points at.
    fn service_image(&self, spec: &Value) -> Option<String> {
        let definition_id = spec.get("definition_id")?.as_str()?;
        let definition = self.resources.get(&ResourceId::new(definition_id))?;
        definition
            .spec
            .pointer("/containers/0/image")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Provider-computed attributes for a new or updated resource.
    fn attributes(
        &mut self,
        id: &ResourceId,
        kind: ResourceKind,
        name: &str,
        spec: &Value,
    ) -> CloudResult<Value> {
        match kind {
            ResourceKind::LoadBalancer => Ok(json!({
                "dns_name": format!("{name}-{}.edge.sim.local", id.as_str()),
            })),
            ResourceKind::WorkloadDefinition => {
                let family = spec
                    .get("family")
                    .and_then(Value::as_str)
                    .unwrap_or(name)
                    .to_string();
                let n = self.revisions.entry(family.clone()).or_insert(0);
                *n += 1;
                Ok(json!({ "revision": format!("{family}:{n}") }))
            }
            ResourceKind::ManagedService => {
                let unhealthy = self
                    .service_image(spec)
                    .map(|image| self.faults.image_is_unhealthy(&image))
                    .unwrap_or(false);
                let memory = self.fleets.get(id).cloned().unwrap_or_default();
                let (attributes, next) = fleet::deploy(name, spec, &memory, unhealthy)?;
                self.fleets.insert(id.clone(), next);
                Ok(attributes)
            }
            _ => Ok(json!({})),
        }
    }

    fn has_validation_record(&self, token: &ValidationToken) -> bool {
        self.zones.values().any(|record| {
            record.name == token.record_name
                && record.record_type == token.record_type
                && record.value == token.record_value
        })
    }
}

#[derive(Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: Faults) -> Self {
        let cloud = Self::default();
        cloud.set_faults(faults);
        cloud
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("simulated cloud lock")
    }

    /// Replace the fault knobs. Budgets already consumed are not restored.
    pub fn set_faults(&self, faults: Faults) {
        self.lock().faults = faults;
    }

    pub fn faults(&self) -> Faults {
        self.lock().faults.clone()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.clone()
    }

    /// Create, update and delete calls, including failed ones.
    pub fn mutating_calls(&self) -> Vec<ApiCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation.is_mutating())
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<CloudEvent> {
        self.lock().events.clone()
    }

    /// One snapshot of the resource set after every mutation.
    pub fn snapshots(&self) -> Vec<TopologySnapshot> {
        replay(&self.lock().events)
    }

    pub fn resources(&self) -> Vec<ResourceHandle> {
        self.lock()
            .resources
            .values()
            .map(|r| r.handle.clone())
            .collect()
    }

    pub fn resources_of(&self, kind: ResourceKind) -> Vec<ResourceHandle> {
        self.lock()
            .resources
            .values()
            .filter(|r| r.handle.kind == kind)
            .map(|r| r.handle.clone())
            .collect()
    }

    pub fn spec_of(&self, id: &ResourceId) -> Option<Value> {
        self.lock().resources.get(id).map(|r| r.spec.clone())
    }

    pub fn records(&self, zone_id: &str) -> Vec<DnsRecord> {
        self.lock()
            .zones
            .iter()
            .filter(|((zone, _, _), _)| zone == zone_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Delete a resource behind the orchestrator's back.
    pub fn remove_out_of_band(&self, id: &ResourceId) -> bool {
        let mut state = self.lock();
        match state.resources.remove(id) {
            Some(resource) => {
                state.emit(Mutation::Deleted, &resource.handle, &resource.spec);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CloudResourceApi for SimulatedCloud {
    async fn create(&self, request: &CreateRequest) -> CloudResult<ResourceHandle> {
        let mut state = self.lock();
        let target = format!("{}/{}", request.kind, request.name);

        if let Some(id) = state.tokens.get(&request.client_token).cloned() {
            if let Some(existing) = state.resources.get(&id) {
                let handle = existing.handle.clone();
                state.log(Operation::Create, target, true);
                debug!(token = %request.client_token, %id, "create replayed");
                return Ok(handle);
            }
        }

        if state.faults.rejected_kinds.contains(&request.kind) {
            state.log(Operation::Create, target, false);
            return Err(CloudError::Rejected(format!(
                "{} {} refused by provider",
                request.kind, request.name
            )));
        }
        if Faults::take(&mut state.faults.transient_creates, request.kind) {
            state.log(Operation::Create, target, false);
            warn!(kind = %request.kind, name = %request.name, "injected transient create failure");
            return Err(CloudError::Transient(format!(
                "create {} {} throttled",
                request.kind, request.name
            )));
        }

        let id = state.mint(request.kind);
        let attributes = state.attributes(&id, request.kind, &request.name, &request.spec)?;
        let reads_until_ready = state.faults.readiness_reads;
        let handle = ResourceHandle {
            id: id.clone(),
            kind: request.kind,
            name: request.name.clone(),
            state: if reads_until_ready > 0 {
                ResourceState::Creating
            } else {
                ResourceState::Available
            },
            attributes,
        };
        state.resources.insert(
            id.clone(),
            SimResource {
                handle: handle.clone(),
                spec: request.spec.clone(),
                reads_until_ready,
            },
        );
        state.tokens.insert(request.client_token.clone(), id);
        state.emit(Mutation::Created, &handle, &request.spec);

        if Faults::take(&mut state.faults.lost_responses, request.kind) {
            state.log(Operation::Create, target, false);
            warn!(kind = %request.kind, name = %request.name, "injected lost create response");
            return Err(CloudError::Transient(format!(
                "connection reset creating {} {}",
                request.kind, request.name
            )));
        }
        state.log(Operation::Create, target, true);
        Ok(handle)
    }

    async fn read(&self, id: &ResourceId) -> CloudResult<Option<ResourceHandle>> {
        let mut state = self.lock();
        let found = state.resources.get_mut(id).map(|resource| {
            if resource.reads_until_ready > 0 {
                resource.reads_until_ready -= 1;
                if resource.reads_until_ready == 0 {
                    resource.handle.state = ResourceState::Available;
                }
            }
            resource.handle.clone()
        });
        state.log(Operation::Read, id.to_string(), true);
        Ok(found)
    }

    async fn update(&self, id: &ResourceId, spec: &Value) -> CloudResult<ResourceHandle> {
        let mut state = self.lock();
        let Some((kind, name)) = state
            .resources
            .get(id)
            .map(|r| (r.handle.kind, r.handle.name.clone()))
        else {
            state.log(Operation::Update, id.to_string(), false);
            return Err(CloudError::NotFound(id.to_string()));
        };

        let attributes = match state.attributes(id, kind, &name, spec) {
            Ok(attributes) => attributes,
            Err(e) => {
                state.log(Operation::Update, id.to_string(), false);
                return Err(e);
            }
        };
        let reads_until_ready = state.faults.readiness_reads;
        let handle = match state.resources.get_mut(id) {
            Some(resource) => {
                resource.spec = spec.clone();
                resource.handle.attributes = attributes;
                resource.reads_until_ready = reads_until_ready;
                resource.handle.state = if reads_until_ready > 0 {
                    ResourceState::Creating
                } else {
                    ResourceState::Available
                };
                resource.handle.clone()
            }
            None => return Err(CloudError::NotFound(id.to_string())),
        };
        state.emit(Mutation::Updated, &handle, spec);
        state.log(Operation::Update, id.to_string(), true);
        Ok(handle)
    }

    async fn delete(&self, id: &ResourceId) -> CloudResult<()> {
        let mut state = self.lock();
        match state.resources.remove(id) {
            Some(resource) => {
                state.fleets.remove(id);
                state.emit(Mutation::Deleted, &resource.handle, &resource.spec);
                state.log(Operation::Delete, id.to_string(), true);
                Ok(())
            }
            None => {
                state.log(Operation::Delete, id.to_string(), false);
                Err(CloudError::NotFound(id.to_string()))
            }
        }
    }
}

#[async_trait]
impl DnsZoneApi for SimulatedCloud {
    async fn publish(&self, zone_id: &str, record: &DnsRecord) -> CloudResult<()> {
        let mut state = self.lock();
        if state.faults.transient_dns > 0 {
            state.faults.transient_dns -= 1;
            state.log(Operation::DnsPublish, record.name.clone(), false);
            return Err(CloudError::Transient(format!("zone {zone_id} busy")));
        }
        state.zones.insert(
            (zone_id.to_string(), record.name.clone(), record.record_type),
            record.clone(),
        );
        state.log(Operation::DnsPublish, record.name.clone(), true);
        debug!(zone = %zone_id, name = %record.name, record_type = %record.record_type, "record upserted");
        Ok(())
    }

    async fn query(
        &self,
        zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> CloudResult<Option<DnsRecord>> {
        let mut state = self.lock();
        if state.faults.transient_dns > 0 {
            state.faults.transient_dns -= 1;
            state.log(Operation::DnsQuery, name, false);
            return Err(CloudError::Transient(format!("zone {zone_id} busy")));
        }
        let found = state
            .zones
            .get(&(zone_id.to_string(), name.to_string(), record_type))
            .cloned();
        state.log(Operation::DnsQuery, name, true);
        Ok(found)
    }
}

#[async_trait]
impl CertificateAuthorityApi for SimulatedCloud {
    async fn request(&self, domain: &str) -> CloudResult<CertificateTicket> {
        let mut state = self.lock();
        let n = state.certificates.len() + 1;
        let certificate_id = format!("cert-{n:04}");
        let label = hex::encode(Sha256::digest(format!("{domain}/{certificate_id}").as_bytes()));
        let token = ValidationToken {
            record_name: format!("_{}.{domain}.", &label[..16]),
            record_value: format!("_{}.validations.sim.local.", &label[16..48]),
            record_type: RecordType::Cname,
        };
        state.certificates.insert(
            certificate_id.clone(),
            SimCertificate {
                domain: domain.to_string(),
                token: token.clone(),
                polls_with_record: 0,
            },
        );
        state.log(Operation::CertificateRequest, domain, true);
        Ok(CertificateTicket {
            certificate_id,
            token,
        })
    }

    async fn poll(&self, certificate_id: &str) -> CloudResult<AuthorityStatus> {
        let mut state = self.lock();
        if state.faults.transient_polls > 0 {
            state.faults.transient_polls -= 1;
            state.log(Operation::CertificatePoll, certificate_id, false);
            return Err(CloudError::Transient("authority unavailable".to_string()));
        }
        let Some(cert) = state.certificates.get(certificate_id).cloned() else {
            state.log(Operation::CertificatePoll, certificate_id, false);
            return Err(CloudError::NotFound(certificate_id.to_string()));
        };

        let status = if !state.has_validation_record(&cert.token) {
            AuthorityStatus::Pending
        } else {
            let polls = cert.polls_with_record + 1;
            if let Some(stored) = state.certificates.get_mut(certificate_id) {
                stored.polls_with_record = polls;
            }
            match &state.faults.authority {
                AuthorityBehavior::Issue { after_polls } if polls >= *after_polls => {
                    AuthorityStatus::Issued
                }
                AuthorityBehavior::Issue { .. } | AuthorityBehavior::Never => {
                    AuthorityStatus::Pending
                }
                AuthorityBehavior::Reject { reason } => AuthorityStatus::Rejected {
                    reason: reason.clone(),
                },
            }
        };
        if status == AuthorityStatus::Issued {
            info!(certificate = %certificate_id, domain = %cert.domain, "certificate issued");
        }
        state.log(Operation::CertificatePoll, certificate_id, true);
        Ok(status)
    }
}

#[async_trait]
impl ImageRegistry for SimulatedCloud {
    async fn publish(&self, context: &Path, repository: &str) -> CloudResult<ImageRef> {
        let digest = context_digest(context).map_err(|e| {
            self.lock()
                .log(Operation::ImagePublish, repository, false);
            CloudError::Rejected(format!("build failed: {e}"))
        })?;
        let image = ImageRef {
            registry: SIM_REGISTRY.to_string(),
            repository: repository.to_string(),
            tag: Some("latest".to_string()),
            digest: Some(digest),
        };
        self.lock().log(Operation::ImagePublish, repository, true);
        info!(%image, "image pushed");
        Ok(image)
    }
}
