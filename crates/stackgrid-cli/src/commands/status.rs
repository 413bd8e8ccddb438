//! `stackctl status` — stored entities and apply runs.

use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use stackgrid_state::{ApplyRun, EntityRecord, EntityStatus, StateStore};

use super::check_format;

#[derive(Serialize)]
struct Status {
    entities: Vec<EntityRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    history: Vec<EntityRecord>,
    runs: Vec<ApplyRun>,
}

pub fn status(data_dir: &Path, format: &str, history: bool) -> Result<()> {
    check_format(format)?;
    let db_path = data_dir.join("stackgrid.redb");
    if !db_path.is_file() {
        bail!("no state at {}; run `stackctl apply` first", db_path.display());
    }
    let store = StateStore::open(&db_path)?;
    let status = collect(&store, history)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render(&status));
    }
    Ok(())
}

fn collect(store: &StateStore, history: bool) -> Result<Status> {
    let entities = store.list_entities()?;
    let mut superseded = Vec::new();
    if history {
        for record in &entities {
            superseded.extend(store.list_history(&record.table_key())?);
        }
    }
    Ok(Status {
        entities,
        history: superseded,
        runs: store.list_runs()?,
    })
}

fn status_label(status: &EntityStatus) -> String {
    match status {
        EntityStatus::Ready => "ready".to_string(),
        EntityStatus::Failed {
            reason,
            terminal: true,
        } => format!("failed (terminal): {reason}"),
        EntityStatus::Failed { reason, .. } => format!("failed: {reason}"),
        EntityStatus::Superseded => "superseded".to_string(),
        EntityStatus::Retired => "retired".to_string(),
    }
}

fn render(status: &Status) -> String {
    let mut out = format!("Entities ({})\n", status.entities.len());
    for record in &status.entities {
        let id = record
            .resource_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {:<44} g{:<3} {:<14} {}\n",
            record.table_key(),
            record.generation,
            id,
            status_label(&record.status)
        ));
    }

    if !status.history.is_empty() {
        out.push_str(&format!("\nHistory ({})\n", status.history.len()));
        for record in &status.history {
            out.push_str(&format!(
                "  {:<44} {}\n",
                record.history_key(),
                status_label(&record.status)
            ));
        }
    }

    out.push_str(&format!("\nRuns ({})\n", status.runs.len()));
    for run in &status.runs {
        out.push_str(&format!(
            "  {} {:?}: {} created, {} updated, {} kept, {} retired, {} failed, {} skipped\n",
            run.id,
            run.outcome,
            run.created.len(),
            run.updated.len(),
            run.kept.len(),
            run.retired.len(),
            run.failed.len(),
            run.skipped.len()
        ));
        for failure in &run.failed {
            out.push_str(&format!("      {failure}\n"));
        }
    }
    out
}
