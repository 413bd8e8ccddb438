//! The collaborators a walk talks to.

use std::sync::Arc;

use stackgrid_cloud::{CertificateAuthorityApi, CloudResourceApi, DnsZoneApi, ImageRegistry};

/// Handles to the four capability interfaces.
#[derive(Clone)]
pub struct Providers {
    pub cloud: Arc<dyn CloudResourceApi>,
    pub dns: Arc<dyn DnsZoneApi>,
    pub authority: Arc<dyn CertificateAuthorityApi>,
    pub registry: Arc<dyn ImageRegistry>,
}

impl Providers {
    /// Use one backend for every interface.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: CloudResourceApi
            + DnsZoneApi
            + CertificateAuthorityApi
            + ImageRegistry
            + Clone
            + 'static,
    {
        Self {
            cloud: Arc::new(backend.clone()),
            dns: Arc::new(backend.clone()),
            authority: Arc::new(backend.clone()),
            registry: Arc::new(backend),
        }
    }
}
