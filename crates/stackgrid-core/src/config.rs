//! stack.toml configuration parser.
//!
//! The file mirrors the shape of the deployed topology: one `[stack]`
//! section with the two required keys (`domain_record`, `hosted_zone_id`)
//! and optional sections for everything that has a sensible default.
//! [`StackConfig::resolve`] applies defaults and validates the values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::image::{ImageError, ImageRef};
use crate::types::SubnetRole;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse stack.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render stack.toml: {0}")]
    Render(#[from] toml::ser::Error),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("invalid domain record: {0}")]
    InvalidDomain(String),
    #[error("invalid hosted zone id: {0}")]
    InvalidZoneId(String),
    #[error("invalid duration for {field}: {value}")]
    InvalidDuration { field: &'static str, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid image: {0}")]
    Image(#[from] ImageError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    pub stack: StackSection,
    pub network: Option<NetworkSection>,
    pub certificate: Option<CertificateSection>,
    pub target_pool: Option<TargetPoolSection>,
    pub service: Option<ServiceSection>,
    pub retry: Option<RetrySection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSection {
    pub name: String,
    pub region: Option<String>,
    /// Fully qualified name the service answers on (e.g. app.example.com).
    pub domain_record: String,
    /// Authoritative zone the alias and validation records go into.
    pub hosted_zone_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    pub cidr: Option<String>,
    pub zones: Option<u8>,
    pub subnets: Option<Vec<SubnetEntry>>,
    pub subnet_prefix: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetEntry {
    pub name: String,
    pub role: SubnetRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSection {
    pub validation_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub record_ttl: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPoolSection {
    pub health_path: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    pub deregistration_delay: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Directory built and pushed to the registry.
    pub build_context: Option<String>,
    /// Prebuilt, digest-pinned image. Mutually exclusive with build_context.
    pub image: Option<String>,
    pub repository: Option<String>,
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub container_port: Option<u16>,
    pub desired_count: Option<u32>,
    pub max_surge_percent: Option<u32>,
    pub min_healthy_percent: Option<u32>,
    pub rollback_on_stall: Option<bool>,
    pub rollout_timeout: Option<String>,
    pub log_stream_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<String>,
    pub max_delay: Option<String>,
}

// ── Resolved settings ──────────────────────────────────────────────

/// Fully defaulted and validated stack settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStack {
    pub name: String,
    pub region: String,
    pub domain: String,
    pub hosted_zone_id: String,
    pub network: NetworkSettings,
    pub certificate: CertificateSettings,
    pub target_pool: TargetPoolSettings,
    pub service: ServiceSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    pub cidr: String,
    pub zones: u8,
    pub subnets: Vec<SubnetEntry>,
    pub subnet_prefix: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateSettings {
    pub validation_timeout: Duration,
    pub poll_interval: Duration,
    pub record_ttl: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetPoolSettings {
    pub health_path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub deregistration_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Build { context: PathBuf, repository: String },
    Prebuilt(ImageRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub image: ImageSource,
    pub cpu: u32,
    pub memory: u32,
    pub container_port: u16,
    pub desired_count: u32,
    pub max_surge_percent: u32,
    pub min_healthy_percent: u32,
    pub rollback_on_stall: bool,
    pub rollout_timeout: Duration,
    pub log_stream_prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

const CPU_SHAPES: [u32; 5] = [256, 512, 1024, 2048, 4096];

impl StackConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a stack.toml with every section spelled out.
    pub fn scaffold(name: &str, domain_record: &str, hosted_zone_id: &str) -> Self {
        StackConfig {
            stack: StackSection {
                name: name.to_string(),
                region: Some("eu-west-1".to_string()),
                domain_record: domain_record.to_string(),
                hosted_zone_id: hosted_zone_id.to_string(),
            },
            network: Some(NetworkSection {
                cidr: Some("10.0.0.0/16".to_string()),
                zones: Some(2),
                subnets: Some(default_subnets()),
                subnet_prefix: None,
            }),
            certificate: Some(CertificateSection {
                validation_timeout: Some("45m".to_string()),
                poll_interval: Some("15s".to_string()),
                record_ttl: Some(60),
            }),
            target_pool: Some(TargetPoolSection {
                health_path: Some("/health".to_string()),
                interval: Some("30s".to_string()),
                timeout: Some("5s".to_string()),
                healthy_threshold: Some(3),
                unhealthy_threshold: Some(3),
                deregistration_delay: Some("5s".to_string()),
            }),
            service: Some(ServiceSection {
                build_context: Some("./app".to_string()),
                image: None,
                repository: Some(format!("{name}-repo")),
                cpu: Some(1024),
                memory: Some(2048),
                container_port: Some(3000),
                desired_count: Some(1),
                max_surge_percent: Some(200),
                min_healthy_percent: Some(100),
                rollback_on_stall: Some(false),
                rollout_timeout: Some("10m".to_string()),
                log_stream_prefix: Some("app".to_string()),
            }),
            retry: Some(RetrySection {
                max_attempts: Some(5),
                base_delay: Some("200ms".to_string()),
                max_delay: Some("5s".to_string()),
            }),
        }
    }

    /// Apply defaults and validate every value.
    ///
    /// Relative build contexts are resolved against `base_dir`.
    pub fn resolve(&self, base_dir: &Path) -> ConfigResult<ResolvedStack> {
        let domain = self.stack.domain_record.trim().to_ascii_lowercase();
        let domain_re = Regex::new(
            r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$",
        )?;
        if !domain_re.is_match(&domain) {
            return Err(ConfigError::InvalidDomain(self.stack.domain_record.clone()));
        }

        let zone_re = Regex::new(r"^[A-Z0-9]{1,32}$")?;
        if !zone_re.is_match(&self.stack.hosted_zone_id) {
            return Err(ConfigError::InvalidZoneId(self.stack.hosted_zone_id.clone()));
        }

        let name_re = Regex::new(r"^[a-z][a-z0-9-]{0,31}$")?;
        if !name_re.is_match(&self.stack.name) {
            return Err(ConfigError::Invalid {
                field: "stack.name",
                reason: format!("{:?} must be lowercase alphanumeric with dashes", self.stack.name),
            });
        }

        Ok(ResolvedStack {
            name: self.stack.name.clone(),
            region: self
                .stack
                .region
                .clone()
                .unwrap_or_else(|| "eu-west-1".to_string()),
            domain,
            hosted_zone_id: self.stack.hosted_zone_id.clone(),
            network: self.resolve_network(),
            certificate: self.resolve_certificate()?,
            target_pool: self.resolve_target_pool()?,
            service: self.resolve_service(base_dir)?,
            retry: self.resolve_retry()?,
        })
    }

    fn resolve_network(&self) -> NetworkSettings {
        let section = self.network.as_ref();
        NetworkSettings {
            cidr: section
                .and_then(|n| n.cidr.clone())
                .unwrap_or_else(|| "10.0.0.0/16".to_string()),
            zones: section.and_then(|n| n.zones).unwrap_or(2),
            subnets: section
                .and_then(|n| n.subnets.clone())
                .unwrap_or_else(default_subnets),
            subnet_prefix: section.and_then(|n| n.subnet_prefix),
        }
    }

    fn resolve_certificate(&self) -> ConfigResult<CertificateSettings> {
        let section = self.certificate.as_ref();
        let settings = CertificateSettings {
            validation_timeout: duration_field(
                "certificate.validation_timeout",
                section.and_then(|c| c.validation_timeout.as_deref()),
                Duration::from_secs(45 * 60),
            )?,
            poll_interval: duration_field(
                "certificate.poll_interval",
                section.and_then(|c| c.poll_interval.as_deref()),
                Duration::from_secs(15),
            )?,
            record_ttl: section.and_then(|c| c.record_ttl).unwrap_or(60),
        };
        if settings.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "certificate.poll_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(settings)
    }

    fn resolve_target_pool(&self) -> ConfigResult<TargetPoolSettings> {
        let section = self.target_pool.as_ref();
        let settings = TargetPoolSettings {
            health_path: section
                .and_then(|t| t.health_path.clone())
                .unwrap_or_else(|| "/health".to_string()),
            interval: duration_field(
                "target_pool.interval",
                section.and_then(|t| t.interval.as_deref()),
                Duration::from_secs(30),
            )?,
            timeout: duration_field(
                "target_pool.timeout",
                section.and_then(|t| t.timeout.as_deref()),
                Duration::from_secs(5),
            )?,
            healthy_threshold: section.and_then(|t| t.healthy_threshold).unwrap_or(3),
            unhealthy_threshold: section.and_then(|t| t.unhealthy_threshold).unwrap_or(3),
            deregistration_delay: duration_field(
                "target_pool.deregistration_delay",
                section.and_then(|t| t.deregistration_delay.as_deref()),
                Duration::from_secs(5),
            )?,
        };

        if !settings.health_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "target_pool.health_path",
                reason: format!("{:?} must start with '/'", settings.health_path),
            });
        }
        if settings.healthy_threshold == 0 || settings.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "target_pool thresholds",
                reason: "must be at least 1".to_string(),
            });
        }
        if settings.timeout >= settings.interval {
            return Err(ConfigError::Invalid {
                field: "target_pool.timeout",
                reason: "must be shorter than the check interval".to_string(),
            });
        }
        Ok(settings)
    }

    fn resolve_service(&self, base_dir: &Path) -> ConfigResult<ServiceSettings> {
        let section = self.service.as_ref();

        let image = match (
            section.and_then(|s| s.image.as_deref()),
            section.and_then(|s| s.build_context.as_deref()),
        ) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid {
                    field: "service.image",
                    reason: "image and build_context are mutually exclusive".to_string(),
                });
            }
            (Some(reference), None) => {
                let image = ImageRef::parse(reference)?;
                if !image.is_immutable() {
                    return Err(ConfigError::Invalid {
                        field: "service.image",
                        reason: format!("{reference} is not pinned by digest"),
                    });
                }
                ImageSource::Prebuilt(image)
            }
            (None, context) => ImageSource::Build {
                context: base_dir.join(context.unwrap_or("./app")),
                repository: section
                    .and_then(|s| s.repository.clone())
                    .unwrap_or_else(|| format!("{}-repo", self.stack.name)),
            },
        };

        let cpu = section.and_then(|s| s.cpu).unwrap_or(1024);
        if !CPU_SHAPES.contains(&cpu) {
            return Err(ConfigError::Invalid {
                field: "service.cpu",
                reason: format!("{cpu} is not one of {CPU_SHAPES:?}"),
            });
        }
        let memory = section.and_then(|s| s.memory).unwrap_or(cpu * 2);
        if memory < cpu * 2 || memory > cpu * 8 {
            return Err(ConfigError::Invalid {
                field: "service.memory",
                reason: format!("{memory} MiB is outside {}..={} for cpu {cpu}", cpu * 2, cpu * 8),
            });
        }

        let container_port = section.and_then(|s| s.container_port).unwrap_or(3000);
        if container_port == 0 {
            return Err(ConfigError::Invalid {
                field: "service.container_port",
                reason: "must be non-zero".to_string(),
            });
        }

        Ok(ServiceSettings {
            image,
            cpu,
            memory,
            container_port,
            desired_count: section.and_then(|s| s.desired_count).unwrap_or(1),
            max_surge_percent: section.and_then(|s| s.max_surge_percent).unwrap_or(200),
            min_healthy_percent: section.and_then(|s| s.min_healthy_percent).unwrap_or(100),
            rollback_on_stall: section.and_then(|s| s.rollback_on_stall).unwrap_or(false),
            rollout_timeout: duration_field(
                "service.rollout_timeout",
                section.and_then(|s| s.rollout_timeout.as_deref()),
                Duration::from_secs(600),
            )?,
            log_stream_prefix: section
                .and_then(|s| s.log_stream_prefix.clone())
                .unwrap_or_else(|| "app".to_string()),
        })
    }

    fn resolve_retry(&self) -> ConfigResult<RetrySettings> {
        let section = self.retry.as_ref();
        let settings = RetrySettings {
            max_attempts: section.and_then(|r| r.max_attempts).unwrap_or(5),
            base_delay: duration_field(
                "retry.base_delay",
                section.and_then(|r| r.base_delay.as_deref()),
                Duration::from_millis(200),
            )?,
            max_delay: duration_field(
                "retry.max_delay",
                section.and_then(|r| r.max_delay.as_deref()),
                Duration::from_secs(5),
            )?,
        };
        if settings.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(settings)
    }
}

fn default_subnets() -> Vec<SubnetEntry> {
    vec![
        SubnetEntry {
            name: "public-subnet".to_string(),
            role: SubnetRole::Public,
        },
        SubnetEntry {
            name: "private-subnet".to_string(),
            role: SubnetRole::Private,
        },
    ]
}

fn duration_field(
    field: &'static str,
    value: Option<&str>,
    default: Duration,
) -> ConfigResult<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[stack]
name = "demo"
domain_record = "app.example.com"
hosted_zone_id = "Z0123456789ABC"
"#;

    #[test]
    fn test_scaffold_roundtrips_through_toml() {
        let config = StackConfig::scaffold("demo", "app.example.com", "Z0123456789ABC");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("app.example.com"));

        let parsed = StackConfig::from_toml(&toml_str).unwrap();
        let resolved = parsed.resolve(Path::new("/srv/demo")).unwrap();
        assert_eq!(resolved.service.max_surge_percent, 200);
        assert_eq!(
            resolved.service.image,
            ImageSource::Build {
                context: PathBuf::from("/srv/demo/./app"),
                repository: "demo-repo".to_string(),
            }
        );
    }

    #[test]
    fn test_minimal_gets_defaults() {
        let config = StackConfig::from_toml(MINIMAL).unwrap();
        let resolved = config.resolve(Path::new(".")).unwrap();

        assert_eq!(resolved.region, "eu-west-1");
        assert_eq!(resolved.network.cidr, "10.0.0.0/16");
        assert_eq!(resolved.network.zones, 2);
        assert_eq!(resolved.network.subnets.len(), 2);
        assert_eq!(resolved.target_pool.deregistration_delay, Duration::from_secs(5));
        assert_eq!(resolved.certificate.record_ttl, 60);
        assert_eq!(resolved.service.container_port, 3000);
        assert_eq!(resolved.service.cpu, 1024);
        assert_eq!(resolved.service.memory, 2048);
        assert_eq!(resolved.retry.max_attempts, 5);
    }

    #[test]
    fn test_rejects_bad_domain() {
        let toml_str = MINIMAL.replace("app.example.com", "not a domain");
        let config = StackConfig::from_toml(&toml_str).unwrap();
        assert!(matches!(
            config.resolve(Path::new(".")),
            Err(ConfigError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_rejects_bad_duration() {
        let toml_str = format!("{MINIMAL}\n[certificate]\nvalidation_timeout = \"whenever\"\n");
        let config = StackConfig::from_toml(&toml_str).unwrap();
        assert!(matches!(
            config.resolve(Path::new(".")),
            Err(ConfigError::InvalidDuration { field: "certificate.validation_timeout", .. })
        ));
    }

    #[test]
    fn test_rejects_mutable_prebuilt_image() {
        let toml_str = format!(
            "{MINIMAL}\n[service]\nimage = \"registry.example.com/app:latest\"\n"
        );
        let config = StackConfig::from_toml(&toml_str).unwrap();
        assert!(matches!(
            config.resolve(Path::new(".")),
            Err(ConfigError::Invalid { field: "service.image", .. })
        ));
    }

    #[test]
    fn test_rejects_memory_outside_cpu_shape() {
        let toml_str = format!("{MINIMAL}\n[service]\ncpu = 1024\nmemory = 512\n");
        let config = StackConfig::from_toml(&toml_str).unwrap();
        assert!(matches!(
            config.resolve(Path::new(".")),
            Err(ConfigError::Invalid { field: "service.memory", .. })
        ));
    }

    #[test]
    fn test_health_timeout_must_be_below_interval() {
        let toml_str = format!("{MINIMAL}\n[target_pool]\ninterval = \"5s\"\ntimeout = \"5s\"\n");
        let config = StackConfig::from_toml(&toml_str).unwrap();
        assert!(matches!(
            config.resolve(Path::new(".")),
            Err(ConfigError::Invalid { field: "target_pool.timeout", .. })
        ));
    }
}
