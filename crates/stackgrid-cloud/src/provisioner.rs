//! Readiness-gated resource operations.
//!
//! A producer counts as done only once the provider reports it
//! `Available`, never when the create call merely returns. Every builder
//! goes through a [`Scope`], which derives stable client tokens so a
//! retried create can never produce a duplicate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stackgrid_core::{ResourceId, ResourceKind};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::api::{CloudResourceApi, CreateRequest, ResourceHandle, ResourceState};
use crate::error::{CloudError, CloudResult};
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct Provisioner {
    api: Arc<dyn CloudResourceApi>,
    retry: RetryPolicy,
    ready_poll: Duration,
    ready_timeout: Duration,
}

impl Provisioner {
    pub fn new(api: Arc<dyn CloudResourceApi>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            ready_poll: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(600),
        }
    }

    /// Override how readiness is polled.
    pub fn with_readiness(mut self, poll: Duration, timeout: Duration) -> Self {
        self.ready_poll = poll;
        self.ready_timeout = timeout;
        self
    }

    pub fn api(&self) -> &Arc<dyn CloudResourceApi> {
        &self.api
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Scope client tokens under `prefix` (typically stack, node, generation).
    pub fn scope(&self, prefix: impl Into<String>) -> Scope<'_> {
        Scope {
            provisioner: self,
            prefix: prefix.into(),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Issue the create call. The resource may not be usable yet.
    async fn submit(&self, request: &CreateRequest) -> CloudResult<ResourceHandle> {
        let operation = format!("create {} {}", request.kind, request.name);
        self.retry
            .run(&operation, || self.api.create(request))
            .await
    }

    /// Update in place and wait until `Available` again.
    pub async fn update_ready(
        &self,
        id: &ResourceId,
        spec: &serde_json::Value,
    ) -> CloudResult<ResourceHandle> {
        let operation = format!("update {id}");
        let handle = self
            .retry
            .run(&operation, || self.api.update(id, spec))
            .await?;
        let handle = self.await_available(handle).await?;
        info!(kind = %handle.kind, id = %handle.id, "resource updated");
        Ok(handle)
    }

    /// Read with retry.
    pub async fn read(&self, id: &ResourceId) -> CloudResult<Option<ResourceHandle>> {
        let operation = format!("read {id}");
        self.retry.run(&operation, || self.api.read(id)).await
    }

    /// Delete with retry. A resource that is already gone counts as deleted.
    pub async fn delete(&self, id: &ResourceId) -> CloudResult<()> {
        let operation = format!("delete {id}");
        match self.retry.run(&operation, || self.api.delete(id)).await {
            Ok(()) | Err(CloudError::NotFound(_)) => {
                debug!(%id, "resource deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn await_available(&self, mut handle: ResourceHandle) -> CloudResult<ResourceHandle> {
        let started = Instant::now();
        loop {
            match &handle.state {
                ResourceState::Available => return Ok(handle),
                ResourceState::Failed { reason } => {
                    return Err(CloudError::Rejected(format!(
                        "{} {}: {reason}",
                        handle.kind, handle.name
                    )));
                }
                ResourceState::Creating | ResourceState::Deleting => {}
            }

            if started.elapsed() >= self.ready_timeout {
                return Err(CloudError::NotReady {
                    kind: handle.kind,
                    name: handle.name.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            debug!(kind = %handle.kind, name = %handle.name, "waiting for resource");
            tokio::time::sleep(self.ready_poll).await;
            handle = self
                .read(&handle.id)
                .await?
                .ok_or_else(|| CloudError::NotFound(handle.id.to_string()))?;
        }
    }
}

/// Token-scoped view of a [`Provisioner`].
///
/// Remembers every resource it created, so a builder that fails halfway
/// still reports what exists remotely.
pub struct Scope<'a> {
    provisioner: &'a Provisioner,
    prefix: String,
    created: Mutex<Vec<ResourceId>>,
}

impl Scope<'_> {
    pub fn client_token(&self, kind: ResourceKind, name: &str) -> String {
        format!("{}:{}/{}", self.prefix, kind.as_str(), name)
    }

    pub async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        spec: serde_json::Value,
    ) -> CloudResult<ResourceHandle> {
        let request = CreateRequest {
            kind,
            name: name.to_string(),
            client_token: self.client_token(kind, name),
            spec,
        };
        let handle = self.provisioner.submit(&request).await?;
        {
            let mut created = self.created.lock().expect("created lock");
            if !created.contains(&handle.id) {
                created.push(handle.id.clone());
            }
        }
        let handle = self.provisioner.await_available(handle).await?;
        info!(kind = %handle.kind, name = %handle.name, id = %handle.id, "resource ready");
        Ok(handle)
    }

    /// Ids of everything created through this scope, oldest first,
    /// whether or not it became available.
    pub fn created(&self) -> Vec<ResourceId> {
        self.created.lock().expect("created lock").clone()
    }

    pub async fn update(
        &self,
        id: &ResourceId,
        spec: &serde_json::Value,
    ) -> CloudResult<ResourceHandle> {
        self.provisioner.update_ready(id, spec).await
    }

    pub fn provisioner(&self) -> &Provisioner {
        self.provisioner
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Reports `Creating` for a fixed number of reads before `Available`.
    struct SlowCloud {
        reads_until_ready: u32,
        reads: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl CloudResourceApi for SlowCloud {
        async fn create(&self, request: &CreateRequest) -> CloudResult<ResourceHandle> {
            Ok(ResourceHandle {
                id: ResourceId::new(format!("x-{}", request.name)),
                kind: request.kind,
                name: request.name.clone(),
                state: ResourceState::Creating,
                attributes: serde_json::Value::Null,
            })
        }

        async fn read(&self, id: &ResourceId) -> CloudResult<Option<ResourceHandle>> {
            let mut reads = self.reads.lock().expect("reads lock");
            let count = reads.entry(id.to_string()).or_insert(0);
            *count += 1;
            let state = if *count >= self.reads_until_ready {
                ResourceState::Available
            } else {
                ResourceState::Creating
            };
            Ok(Some(ResourceHandle {
                id: id.clone(),
                kind: ResourceKind::LoadBalancer,
                name: "edge".to_string(),
                state,
                attributes: serde_json::Value::Null,
            }))
        }

        async fn update(
            &self,
            _id: &ResourceId,
            _spec: &serde_json::Value,
        ) -> CloudResult<ResourceHandle> {
            Err(CloudError::Rejected("unsupported".to_string()))
        }

        async fn delete(&self, id: &ResourceId) -> CloudResult<()> {
            Err(CloudError::NotFound(id.to_string()))
        }
    }

    fn provisioner(reads_until_ready: u32) -> Provisioner {
        let api = Arc::new(SlowCloud {
            reads_until_ready,
            reads: Mutex::new(HashMap::new()),
        });
        Provisioner::new(api, RetryPolicy::none())
            .with_readiness(Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_for_available() {
        let p = provisioner(3);
        let handle = p
            .scope("demo/edge-router/1")
            .create(ResourceKind::LoadBalancer, "edge", serde_json::json!({}))
            .await
            .unwrap();
        assert!(handle.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn create_times_out_when_never_available() {
        let p = provisioner(u32::MAX);
        let err = p
            .scope("demo/edge-router/1")
            .create(ResourceKind::LoadBalancer, "edge", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::NotReady { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn scope_remembers_resources_that_never_became_available() {
        let p = provisioner(u32::MAX);
        let scope = p.scope("demo/managed-service/1");
        scope
            .create(ResourceKind::ManagedService, "web", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(scope.created(), vec![ResourceId::new("x-web")]);
    }

    #[tokio::test(start_paused = true)]
    async fn scope_lists_each_created_resource_once() {
        let p = provisioner(1);
        let scope = p.scope("demo/network/1");
        for name in ["vpc", "private-a", "vpc"] {
            scope
                .create(ResourceKind::Subnet, name, serde_json::json!({}))
                .await
                .unwrap();
        }
        assert_eq!(
            scope.created(),
            vec![ResourceId::new("x-vpc"), ResourceId::new("x-private-a")]
        );
    }

    #[tokio::test]
    async fn delete_of_missing_resource_is_ok() {
        let p = provisioner(1);
        assert!(p.delete(&ResourceId::new("gone")).await.is_ok());
    }

    #[test]
    fn client_tokens_are_stable() {
        let p = provisioner(1);
        let scope = p.scope("demo/network/2");
        assert_eq!(
            scope.client_token(ResourceKind::Subnet, "private-a"),
            "demo/network/2:subnet/private-a"
        );
    }
}
