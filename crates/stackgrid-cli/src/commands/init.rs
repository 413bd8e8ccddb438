//! `stackctl init` — scaffold a stack.toml.

use std::path::Path;

use anyhow::{Result, bail};
use stackgrid_core::StackConfig;
use tracing::info;

pub fn init(path: &Path, name: &str, domain: &str, zone: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }

    let config = StackConfig::scaffold(name, domain, zone);
    // Refuse to write a file that would not validate.
    config.resolve(Path::new("."))?;

    std::fs::write(path, config.to_toml_string()?)?;
    info!(path = %path.display(), stack = %name, "stack.toml written");
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_round_trips_and_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.toml");

        init(&path, "demo", "app.example.com", "Z0123456789ABC", false).unwrap();
        let parsed = StackConfig::from_file(&path).unwrap();
        assert_eq!(parsed.stack.name, "demo");

        assert!(init(&path, "demo", "app.example.com", "Z0123456789ABC", false).is_err());
        init(&path, "other", "app.example.com", "Z0123456789ABC", true).unwrap();
        assert_eq!(StackConfig::from_file(&path).unwrap().stack.name, "other");
    }

    #[test]
    fn invalid_domain_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.toml");
        assert!(init(&path, "demo", "not a domain", "Z0123456789ABC", false).is_err());
        assert!(!path.exists());
    }
}
