//! `stackctl validate` — plan-time checks and a topology summary.

use std::path::Path;

use anyhow::Result;
use stackgrid_network::BoundaryRole;
use stackgrid_orchestrator::{ImagePlan, Plan};

use super::load_stack;

pub fn validate(config: &Path) -> Result<()> {
    let stack = load_stack(config)?;
    let plan = Plan::build(&stack)?;
    print!("{}", summary(&plan));
    Ok(())
}

fn summary(plan: &Plan) -> String {
    let stack = &plan.stack;
    let mut out = String::new();
    out.push_str(&format!("Stack {} is valid\n", stack.name));
    out.push_str(&format!("  region:  {}\n", stack.region));
    out.push_str(&format!("  domain:  {} (zone {})\n", stack.domain, stack.hosted_zone_id));

    out.push_str(&format!("  network: {} in {} zones\n", plan.fabric.cidr, plan.fabric.zones.len()));
    for subnet in &plan.fabric.subnets {
        out.push_str(&format!(
            "    {:<24} {:<18} {:<8} {}\n",
            subnet.name,
            subnet.cidr.to_string(),
            subnet.role.to_string(),
            subnet.zone
        ));
    }

    out.push_str("  boundaries:\n");
    for role in BoundaryRole::ALL {
        let rules = plan.policy.boundary(role).map(|b| b.rules.len()).unwrap_or(0);
        out.push_str(&format!("    {:<24} {rules} rules\n", role.to_string()));
    }
    out.push_str(&format!("  private endpoints: {}\n", plan.endpoints.len()));

    match &plan.image {
        ImagePlan::Build {
            context, digest, ..
        } => out.push_str(&format!("  image:   build {} ({digest})\n", context.display())),
        ImagePlan::Prebuilt { image } => out.push_str(&format!("  image:   {image}\n")),
    }

    let desired = stack.service.desired_count;
    out.push_str(&format!(
        "  service: {} x {} cpu / {} MiB, rolling update keeps {}..{} running, >= {} healthy\n",
        desired,
        stack.service.cpu,
        stack.service.memory,
        desired,
        plan.deployment.running_cap(desired),
        plan.deployment.min_healthy(desired),
    ));
    out
}

#[cfg(test)]
mod tests {
    use stackgrid_core::StackConfig;

    use super::*;

    #[test]
    fn summary_lists_every_subnet_and_boundary() {
        let toml = format!(
            "[stack]\nname = \"demo\"\ndomain_record = \"app.example.com\"\n\
             hosted_zone_id = \"Z0123456789ABC\"\n\n[service]\n\
             image = \"registry.example.com/demo/app@sha256:{}\"\n",
            "b".repeat(64)
        );
        let stack = StackConfig::from_toml(&toml)
            .unwrap()
            .resolve(Path::new("."))
            .unwrap();
        let text = summary(&Plan::build(&stack).unwrap());

        assert!(text.contains("Stack demo is valid"));
        for subnet in ["public-subnet-eu-west-1a", "private-subnet-eu-west-1b"] {
            assert!(text.contains(subnet), "{subnet} missing from:\n{text}");
        }
        for role in BoundaryRole::ALL {
            assert!(text.contains(&role.to_string()), "{role} missing from:\n{text}");
        }
        assert!(text.contains("1..2 running"));
    }
}
