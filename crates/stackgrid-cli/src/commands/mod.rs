pub mod apply;
pub mod init;
pub mod plan;
pub mod probe;
pub mod rollout;
pub mod status;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result, bail};
use stackgrid_core::StackConfig;
use stackgrid_core::config::ResolvedStack;

/// Load and resolve a stack.toml. Relative paths inside it are resolved
/// against the file's directory.
pub fn load_stack(config: &Path) -> Result<ResolvedStack> {
    let parsed = StackConfig::from_file(config)
        .with_context(|| format!("reading {}", config.display()))?;
    let base = config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parsed
        .resolve(base)
        .with_context(|| format!("validating {}", config.display()))
}

pub fn check_format(format: &str) -> Result<()> {
    match format {
        "text" | "json" => Ok(()),
        other => bail!("unknown format {other:?}; expected text or json"),
    }
}
