//! Edge resource builders.
//!
//! Every precondition (validated certificate, existing HTTPS listener,
//! public placement) is checked before the first cloud call, so a refused
//! bind leaves no trace in the provider.

use serde_json::json;
use stackgrid_cert::Certificate;
use stackgrid_cloud::{DnsRecord, DnsZoneApi, RecordType, ResourceHandle, RetryPolicy, Scope};
use stackgrid_core::{ResourceKind, SubnetRole};
use stackgrid_network::{BoundaryRole, IsolationBoundary, ProvisionedFabric};
use tracing::{info, warn};

use crate::error::{EdgeError, EdgeResult};
use crate::pool::{TargetPool, TargetPoolSpec};
use crate::router::{AliasRecord, EdgeRouter, Listener, ListenerAction, ListenerProtocol};

/// TTL of the alias record pointing the domain at the router.
pub const ALIAS_TTL: u32 = 60;

fn required_attribute(handle: &ResourceHandle, attribute: &str) -> EdgeResult<String> {
    handle
        .attribute(attribute)
        .map(str::to_string)
        .ok_or_else(|| EdgeError::MissingAttribute {
            id: handle.id.to_string(),
            attribute: attribute.to_string(),
        })
}

/// Create the router on the public subnets, guarded by the edge boundary.
pub async fn create_router(
    scope: &Scope<'_>,
    name: &str,
    fabric: &ProvisionedFabric,
    edge: &IsolationBoundary,
) -> EdgeResult<EdgeRouter> {
    if edge.role != BoundaryRole::Edge {
        return Err(EdgeError::WrongBoundary(edge.role));
    }
    let subnet_ids = fabric.subnet_ids(SubnetRole::Public);
    if subnet_ids.is_empty() {
        return Err(EdgeError::NoPublicSubnets(fabric.network_id.to_string()));
    }

    let handle = scope
        .create(
            ResourceKind::LoadBalancer,
            name,
            json!({
                "network_id": fabric.network_id,
                "subnet_ids": subnet_ids,
                "boundary_ids": [edge.id],
                "scheme": "internet-facing",
            }),
        )
        .await?;
    let dns_name = required_attribute(&handle, "dns_name")?;

    info!(router = %name, id = %handle.id, %dns_name, "edge router ready");
    Ok(EdgeRouter {
        id: handle.id,
        name: name.to_string(),
        dns_name,
        network_id: fabric.network_id.clone(),
        subnet_ids,
        boundary_id: edge.id.clone(),
    })
}

/// Create the target pool. Ordered after the router.
pub async fn create_target_pool(
    scope: &Scope<'_>,
    spec: &TargetPoolSpec,
    fabric: &ProvisionedFabric,
    router: &EdgeRouter,
) -> EdgeResult<TargetPool> {
    let handle = scope
        .create(
            ResourceKind::TargetPool,
            &spec.name,
            json!({
                "network_id": fabric.network_id,
                "router_id": router.id,
                "port": spec.port,
                "protocol": spec.protocol,
                "target_type": spec.target_type,
                "health_check": spec.health,
                "matcher": spec.matcher,
                "deregistration_delay_secs": spec.deregistration_delay.as_secs(),
            }),
        )
        .await?;

    info!(pool = %spec.name, id = %handle.id, "target pool ready");
    Ok(TargetPool {
        id: handle.id,
        router_id: router.id.clone(),
        network_id: fabric.network_id.clone(),
        spec: spec.clone(),
    })
}

fn https_spec(router: &EdgeRouter, pool: &TargetPool, cert: &Certificate) -> serde_json::Value {
    json!({
        "router_id": router.id,
        "port": 443,
        "protocol": ListenerProtocol::Https,
        "certificate_id": cert.id,
        "action": ListenerAction::Forward { target_pool_id: pool.id.clone() },
    })
}

fn check_https_inputs(
    router: &EdgeRouter,
    pool: &TargetPool,
    cert: &Certificate,
) -> EdgeResult<()> {
    if let Err(e) = cert.require_validated() {
        warn!(router = %router.name, certificate = %cert.id, state = %cert.state(), "refusing HTTPS bind");
        return Err(e.into());
    }
    if pool.router_id != router.id {
        return Err(EdgeError::ForeignPool {
            pool: pool.id.to_string(),
            expected: router.id.to_string(),
            actual: pool.router_id.to_string(),
        });
    }
    Ok(())
}

/// 443/HTTPS forwarding to `pool`. Fails with a certificate-not-ready
/// error before any cloud call unless `cert` is validated.
pub async fn bind_https(
    scope: &Scope<'_>,
    router: &EdgeRouter,
    pool: &TargetPool,
    cert: &Certificate,
) -> EdgeResult<Listener> {
    check_https_inputs(router, pool, cert)?;

    let handle = scope
        .create(
            ResourceKind::Listener,
            &format!("{}-https", router.name),
            https_spec(router, pool, cert),
        )
        .await?;

    info!(router = %router.name, id = %handle.id, certificate = %cert.id, "HTTPS listener ready");
    Ok(Listener {
        id: handle.id,
        router_id: router.id.clone(),
        port: 443,
        protocol: ListenerProtocol::Https,
        certificate_id: Some(cert.id.clone()),
        action: ListenerAction::Forward {
            target_pool_id: pool.id.clone(),
        },
    })
}

/// Point an existing HTTPS listener at a new certificate or pool in place.
pub async fn rebind_https(
    scope: &Scope<'_>,
    existing: &Listener,
    router: &EdgeRouter,
    pool: &TargetPool,
    cert: &Certificate,
) -> EdgeResult<Listener> {
    check_https_inputs(router, pool, cert)?;

    scope
        .update(&existing.id, &https_spec(router, pool, cert))
        .await?;

    info!(router = %router.name, id = %existing.id, certificate = %cert.id, "HTTPS listener updated");
    Ok(Listener {
        certificate_id: Some(cert.id.clone()),
        action: ListenerAction::Forward {
            target_pool_id: pool.id.clone(),
        },
        ..existing.clone()
    })
}

/// 80/HTTP redirecting to HTTPS with a 301. Refused unless the router's
/// HTTPS listener already exists.
pub async fn bind_http_redirect(
    scope: &Scope<'_>,
    router: &EdgeRouter,
    https: Option<&Listener>,
) -> EdgeResult<Listener> {
    match https {
        Some(listener) if listener.is_https_forward() && listener.router_id == router.id => {}
        _ => {
            return Err(EdgeError::MissingHttpsListener {
                router: router.id.to_string(),
            });
        }
    }

    let action = ListenerAction::https_redirect();
    let handle = scope
        .create(
            ResourceKind::Listener,
            &format!("{}-http", router.name),
            json!({
                "router_id": router.id,
                "port": 80,
                "protocol": ListenerProtocol::Http,
                "action": action,
            }),
        )
        .await?;

    info!(router = %router.name, id = %handle.id, "HTTP redirect listener ready");
    Ok(Listener {
        id: handle.id,
        router_id: router.id.clone(),
        port: 80,
        protocol: ListenerProtocol::Http,
        certificate_id: None,
        action,
    })
}

/// Upsert `domain CNAME router.dns_name` in the hosted zone.
pub async fn publish_alias(
    dns: &dyn DnsZoneApi,
    retry: &RetryPolicy,
    zone_id: &str,
    domain: &str,
    router: &EdgeRouter,
) -> EdgeResult<AliasRecord> {
    let record = DnsRecord {
        name: domain.to_string(),
        record_type: RecordType::Cname,
        value: router.dns_name.clone(),
        ttl: ALIAS_TTL,
    };
    let operation = format!("publish {domain}");
    retry
        .run(&operation, || dns.publish(zone_id, &record))
        .await?;

    info!(%domain, target = %router.dns_name, "alias record published");
    Ok(AliasRecord {
        zone_id: zone_id.to_string(),
        record,
    })
}

#[cfg(test)]
mod tests {
    use stackgrid_cloud::{CertificateTicket, ValidationToken};

    use super::*;

    fn router() -> EdgeRouter {
        EdgeRouter {
            id: "lb-1".into(),
            name: "demo-lb".to_string(),
            dns_name: "demo-lb.elb.example".to_string(),
            network_id: "net-1".into(),
            subnet_ids: vec!["subnet-1".into()],
            boundary_id: "bnd-1".into(),
        }
    }

    #[test]
    fn https_inputs_need_validated_cert() {
        let cert = Certificate::requested(
            "app.example.com",
            CertificateTicket {
                certificate_id: "cert-1".to_string(),
                token: ValidationToken {
                    record_name: "_v".to_string(),
                    record_value: "_t".to_string(),
                    record_type: RecordType::Cname,
                },
            },
        );
        let pool = TargetPool {
            id: "tp-1".into(),
            router_id: "lb-1".into(),
            network_id: "net-1".into(),
            spec: TargetPoolSpec {
                name: "demo-tg".to_string(),
                port: 3000,
                protocol: ListenerProtocol::Http,
                target_type: "ip".to_string(),
                health: stackgrid_health::ProbePolicy {
                    path: "/health".to_string(),
                    interval: std::time::Duration::from_secs(30),
                    timeout: std::time::Duration::from_secs(5),
                    healthy_threshold: 3,
                    unhealthy_threshold: 3,
                },
                matcher: "200".to_string(),
                deregistration_delay: std::time::Duration::from_secs(5),
            },
        };
        let err = check_https_inputs(&router(), &pool, &cert).unwrap_err();
        assert!(err.is_certificate_not_ready());
    }

    #[test]
    fn redirect_action_is_permanent() {
        assert_eq!(
            ListenerAction::https_redirect(),
            ListenerAction::Redirect {
                protocol: ListenerProtocol::Https,
                port: 443,
                status_code: 301,
            }
        );
    }
}
