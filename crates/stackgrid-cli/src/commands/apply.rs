//! `stackctl apply` — walk the graph against the simulated backend.

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Args;
use stackgrid_core::ResourceKind;
use stackgrid_orchestrator::{
    ApplyOptions, ApplyReport, NodeFate, Orchestrator, Plan, ProvisionError, Providers,
};
use stackgrid_sim::{AuthorityBehavior, Faults, SimulatedCloud};
use stackgrid_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};

use super::load_stack;

/// Fault knobs for the simulated backend.
#[derive(Debug, Clone, Default, Args)]
pub struct SimKnobs {
    /// Certificate authority behaviour: issue, never or reject
    #[arg(long = "sim-authority", default_value = "issue")]
    pub authority: String,
    /// Polls with the validation record visible before issuing
    #[arg(long = "sim-issue-after", default_value = "1")]
    pub issue_after: u32,
    /// Transient create failures per kind, e.g. subnet=2 (repeatable)
    #[arg(long = "sim-transient", value_name = "KIND=N")]
    pub transient: Vec<String>,
    /// Creates whose response is lost, e.g. listener=1 (repeatable)
    #[arg(long = "sim-lost-response", value_name = "KIND=N")]
    pub lost_responses: Vec<String>,
    /// Kinds whose create is always refused (repeatable)
    #[arg(long = "sim-reject", value_name = "KIND")]
    pub reject: Vec<String>,
    /// Reads that report Creating after each create or update
    #[arg(long = "sim-readiness-reads", default_value = "0")]
    pub readiness_reads: u32,
    /// Images whose replicas never pass health checks (substring match)
    #[arg(long = "sim-unhealthy-image", value_name = "PATTERN")]
    pub unhealthy_image: Option<String>,
}

impl SimKnobs {
    pub fn faults(&self) -> Result<Faults> {
        let authority = match self.authority.as_str() {
            "issue" | "" => AuthorityBehavior::Issue {
                after_polls: self.issue_after,
            },
            "never" => AuthorityBehavior::Never,
            "reject" => AuthorityBehavior::Reject {
                reason: "domain ownership could not be verified".to_string(),
            },
            other => bail!("unknown --sim-authority {other:?}; expected issue, never or reject"),
        };

        let mut faults = Faults::default().authority(authority);
        for entry in &self.transient {
            let (kind, count) = parse_budget(entry)?;
            faults = faults.transient(kind, count);
        }
        for entry in &self.lost_responses {
            let (kind, count) = parse_budget(entry)?;
            faults = faults.lose_responses(kind, count);
        }
        for kind in &self.reject {
            faults = faults.reject(parse_kind(kind)?);
        }
        if let Some(pattern) = &self.unhealthy_image {
            faults = faults.unhealthy_image(pattern.clone());
        }
        faults.readiness_reads = self.readiness_reads;
        Ok(faults)
    }
}

fn parse_kind(raw: &str) -> Result<ResourceKind> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("unknown resource kind {raw:?}"))
}

/// `KIND=N`.
fn parse_budget(raw: &str) -> Result<(ResourceKind, u32)> {
    let Some((kind, count)) = raw.split_once('=') else {
        bail!("expected KIND=N, got {raw:?}");
    };
    let count = count
        .parse()
        .with_context(|| format!("invalid count in {raw:?}"))?;
    Ok((parse_kind(kind)?, count))
}

pub async fn apply(
    config: &Path,
    data_dir: &Path,
    reissue_certificate: bool,
    repeat: u32,
    knobs: &SimKnobs,
) -> Result<()> {
    let stack = load_stack(config)?;
    let plan = Plan::build(&stack)?;
    let faults = knobs.faults()?;

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("stackgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = %db_path.display(), "state store opened");

    let cloud = SimulatedCloud::with_faults(faults);
    let orchestrator = Orchestrator::new(plan, Providers::from_backend(cloud.clone()), store);

    // Ctrl-C cancels the walk.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, cancelling apply");
            let _ = shutdown_tx.send(true);
        }
    });

    for round in 1..=repeat.max(1) {
        let options = ApplyOptions {
            reissue_certificate: reissue_certificate && round == 1,
        };
        match orchestrator.apply(options, shutdown_rx.clone()).await {
            Ok(report) => print!("{}", render_report(&report)),
            Err(err) => {
                print!("{}", render_failure(&err));
                return Err(err.into());
            }
        }
    }
    info!(
        resources = cloud.resources().len(),
        calls = cloud.calls().len(),
        "simulated backend totals"
    );
    Ok(())
}

fn fate_label(fate: &NodeFate) -> String {
    match fate {
        NodeFate::Created { generation: 1 } => "created".to_string(),
        NodeFate::Created { generation } => format!("replaced (generation {generation})"),
        NodeFate::Updated { generation } => format!("updated in place (generation {generation})"),
        NodeFate::Kept { .. } => "kept".to_string(),
        NodeFate::Failed { reason } => format!("FAILED: {reason}"),
        NodeFate::Skipped { reason } => format!("skipped: {reason}"),
    }
}

fn render_report(report: &ApplyReport) -> String {
    let mut out = format!(
        "Apply {} of stack {} finished in {:.1?}\n",
        report.run_id, report.stack, report.elapsed
    );
    if report.is_noop() {
        out.push_str("  no changes\n");
        return out;
    }
    for (node, fate) in &report.fates {
        out.push_str(&format!("  {:<28} {}\n", node.to_string(), fate_label(fate)));
    }
    for label in &report.retired {
        out.push_str(&format!("  retired {label}\n"));
    }
    out
}

fn render_failure(err: &ProvisionError) -> String {
    let ProvisionError::PartialApplyFailure {
        failed,
        skipped,
        ready_unused,
    } = err
    else {
        return format!("Apply failed: {err}\n");
    };

    let mut out = "Apply partially failed\n".to_string();
    for failure in failed {
        out.push_str(&format!("  failed       {}: {}\n", failure.node, failure.error));
    }
    for node in skipped {
        out.push_str(&format!("  skipped      {node}\n"));
    }
    for node in ready_unused {
        out.push_str(&format!("  ready/unused {node}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use stackgrid_orchestrator::{FailedNode, NodeId};

    use super::*;

    #[test]
    fn budgets_parse_kind_and_count() {
        assert_eq!(
            parse_budget("subnet=2").unwrap(),
            (ResourceKind::Subnet, 2)
        );
        assert_eq!(
            parse_budget("managed_service=1").unwrap(),
            (ResourceKind::ManagedService, 1)
        );
        assert!(parse_budget("subnet").is_err());
        assert!(parse_budget("hyper_drive=1").is_err());
        assert!(parse_budget("subnet=lots").is_err());
    }

    #[test]
    fn knobs_build_faults() {
        let knobs = SimKnobs {
            authority: "never".to_string(),
            transient: vec!["listener=3".to_string()],
            reject: vec!["cluster".to_string()],
            readiness_reads: 2,
            ..SimKnobs::default()
        };
        let faults = knobs.faults().unwrap();
        assert_eq!(faults.authority, AuthorityBehavior::Never);
        assert_eq!(faults.transient_creates.get(&ResourceKind::Listener), Some(&3));
        assert!(faults.rejected_kinds.contains(&ResourceKind::Cluster));
        assert_eq!(faults.readiness_reads, 2);

        let bad = SimKnobs {
            authority: "sometimes".to_string(),
            ..SimKnobs::default()
        };
        assert!(bad.faults().is_err());
    }

    #[test]
    fn failure_lists_every_class() {
        let err = ProvisionError::PartialApplyFailure {
            failed: vec![FailedNode {
                node: NodeId::CertificateValidation,
                error: Box::new(ProvisionError::ValidationTimeout {
                    domain: "app.example.com".to_string(),
                    waited_ms: 90_000,
                }),
            }],
            skipped: vec![NodeId::HttpsListener],
            ready_unused: vec![NodeId::Certificate],
        };
        let text = render_failure(&err);
        assert!(text.contains("failed       certificate-validation"));
        assert!(text.contains("skipped      https-listener"));
        assert!(text.contains("ready/unused certificate"));
    }

    #[tokio::test]
    async fn apply_persists_runs_under_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("stack.toml");
        std::fs::write(
            &config,
            format!(
                "[stack]\nname = \"demo\"\ndomain_record = \"app.example.com\"\n\
                 hosted_zone_id = \"Z0123456789ABC\"\n\n[service]\n\
                 image = \"registry.example.com/demo/app@sha256:{}\"\n",
                "d".repeat(64)
            ),
        )
        .unwrap();
        let data_dir = dir.path().join("state");

        apply(&config, &data_dir, false, 2, &SimKnobs::default())
            .await
            .unwrap();

        let store = StateStore::open(&data_dir.join("stackgrid.redb")).unwrap();
        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].created.is_empty());
        assert_eq!(runs[1].kept.len(), NodeId::ALL.len());
    }
}
