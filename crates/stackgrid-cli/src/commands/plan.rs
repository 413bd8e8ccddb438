//! `stackctl plan` — the dependency waves of the topology.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use stackgrid_orchestrator::Plan;

use super::{check_format, load_stack};

#[derive(Serialize)]
struct PlannedNode {
    node: String,
    key: String,
    depends_on: Vec<String>,
    desired: Value,
}

#[derive(Serialize)]
struct Wave {
    wave: usize,
    nodes: Vec<PlannedNode>,
}

pub fn plan(config: &Path, format: &str) -> Result<()> {
    check_format(format)?;
    let stack = load_stack(config)?;
    let plan = Plan::build(&stack)?;
    let waves = waves(&plan);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&waves)?);
        return Ok(());
    }

    println!("Stack {}: {} nodes in {} waves", stack.name, plan.graph.order().len(), waves.len());
    for wave in &waves {
        println!("\nWave {}", wave.wave);
        for node in &wave.nodes {
            if node.depends_on.is_empty() {
                println!("  {}", node.node);
            } else {
                println!("  {}  <- {}", node.node, node.depends_on.join(", "));
            }
        }
    }
    Ok(())
}

fn waves(plan: &Plan) -> Vec<Wave> {
    plan.graph
        .waves()
        .into_iter()
        .enumerate()
        .map(|(i, nodes)| Wave {
            wave: i + 1,
            nodes: nodes
                .into_iter()
                .map(|node| PlannedNode {
                    node: node.to_string(),
                    key: node.key(),
                    depends_on: plan.graph.deps(node).iter().map(|d| d.to_string()).collect(),
                    desired: plan.desired_spec(node),
                })
                .collect(),
        })
        .collect()
}
