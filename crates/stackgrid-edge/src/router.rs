//! Edge router and listener types.

use std::fmt;

use serde::{Deserialize, Serialize};
use stackgrid_cloud::DnsRecord;
use stackgrid_core::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerProtocol {
    Http,
    Https,
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListenerProtocol::Http => "HTTP",
            ListenerProtocol::Https => "HTTPS",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerAction {
    Forward {
        target_pool_id: ResourceId,
    },
    Redirect {
        protocol: ListenerProtocol,
        port: u16,
        status_code: u16,
    },
}

impl ListenerAction {
    /// Permanent redirect to HTTPS on 443.
    pub fn https_redirect() -> Self {
        ListenerAction::Redirect {
            protocol: ListenerProtocol::Https,
            port: 443,
            status_code: 301,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub id: ResourceId,
    pub router_id: ResourceId,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub certificate_id: Option<String>,
    pub action: ListenerAction,
}

impl Listener {
    pub fn is_https_forward(&self) -> bool {
        self.protocol == ListenerProtocol::Https
            && self.port == 443
            && matches!(self.action, ListenerAction::Forward { .. })
    }
}

/// A created edge router. Output of the `EdgeRouter` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRouter {
    pub id: ResourceId,
    pub name: String,
    pub dns_name: String,
    pub network_id: ResourceId,
    pub subnet_ids: Vec<ResourceId>,
    pub boundary_id: ResourceId,
}

/// `domain CNAME router.dns_name` in the hosted zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub zone_id: String,
    pub record: DnsRecord,
}
