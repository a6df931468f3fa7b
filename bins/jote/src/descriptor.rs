//! The execution descriptor persisted in every test environment.
//!
//! It is written in docker-compose form so a failed test can be re-run by
//! hand (`docker compose up`) from its preserved directory.

use crate::engine::BackendError;
use jote_common::config::{DESCRIPTOR_FILE, INSTANCE_DIRECTORY, INSTANCE_DIRECTORY_VARIABLE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "job";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDescriptor {
    pub version: String,
    pub services: BTreeMap<String, Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    pub command: String,
    pub working_dir: String,
    pub environment: Vec<String>,
    pub volumes: Vec<String>,
    pub deploy: Deploy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub limits: Limits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub cpus: String,
    pub memory: String,
}

/// What a test asks of its container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub command: String,
    pub memory: String,
    pub cores: u32,
    pub project_directory: String,
    pub working_directory: String,
}

impl ExecutionDescriptor {
    pub fn new(spec: &ContainerSpec, project_path: &Path) -> Self {
        let service = Service {
            image: spec.image.clone(),
            command: spec.command.clone(),
            working_dir: spec.working_directory.clone(),
            environment: vec![format!("{INSTANCE_DIRECTORY_VARIABLE}={INSTANCE_DIRECTORY}")],
            volumes: vec![format!("{}:{}", project_path.display(), spec.project_directory)],
            deploy: Deploy {
                resources: Resources {
                    limits: Limits {
                        cpus: spec.cores.to_string(),
                        // compose understands byte counts, not `Gi`-style suffixes
                        memory: parse_memory(&spec.memory)
                            .map(|bytes| format!("{bytes}b"))
                            .unwrap_or_else(|| spec.memory.clone()),
                    },
                },
            },
        };
        Self {
            version: "3.8".to_string(),
            services: BTreeMap::from([(SERVICE_NAME.to_string(), service)]),
        }
    }

    pub fn path(environment: &Path) -> PathBuf {
        environment.join(DESCRIPTOR_FILE)
    }

    pub fn write(&self, environment: &Path) -> std::io::Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(Self::path(environment), format!("---\n{yaml}"))
    }

    pub fn load(environment: &Path) -> Result<Self, BackendError> {
        let path = Self::path(environment);
        let text = fs::read_to_string(&path).map_err(|e| BackendError::Descriptor {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| BackendError::Descriptor {
            path,
            message: e.to_string(),
        })
    }

    pub fn job(&self) -> Option<&Service> {
        self.services.get(SERVICE_NAME)
    }
}

impl Service {
    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Option<i64> {
        parse_memory(&self.deploy.resources.limits.memory)
    }

    /// CPU limit in units of 10^-9 CPUs.
    pub fn nano_cpus(&self) -> Option<i64> {
        let cpus: f64 = self.deploy.resources.limits.cpus.parse().ok()?;
        Some((cpus * 1_000_000_000.0) as i64)
    }
}

/// Parse a memory quantity such as `512Mi`, `1G` or `1048576`.
/// Docker treats every suffix as binary, so `G` and `Gi` agree.
pub fn parse_memory(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);
    let value: i64 = digits.parse().ok()?;
    let scale: i64 = match suffix {
        "" | "b" => 1,
        "K" | "Ki" | "k" => 1 << 10,
        "M" | "Mi" | "m" => 1 << 20,
        "G" | "Gi" | "g" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(scale)
}
