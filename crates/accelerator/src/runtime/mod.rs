//! Container runtime integration
//!
//! Translates the set of devices allocated to a workload into container
//! creation parameters. The integration protocol is detected once at
//! bootstrap and never changes afterwards:
//!
//! - volume plugin (helper major version 1): binds and device grants served
//!   by a local HTTP endpoint
//! - runtime flag (helper major version 2, and TPUs): a visible-devices
//!   environment variable plus an optional runtime override

pub mod docker;
pub mod probe;
pub mod visible_devices;
pub mod volume;

use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::DeviceId;
use async_trait::async_trait;
use error_stack::Report;
use serde::Serialize;

pub use docker::DockerCliClient;
pub use probe::probe_version;
pub use visible_devices::VisibleDevicesGenerator;
pub use volume::VolumePluginGenerator;

use crate::config::DeviceFamily;
use crate::config::PluginConfig;
use crate::error::AcceleratorError;

/// Version reported by the runtime helper binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
#[display("{major}.{minor}.{patch}")]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Device node exposed to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

/// Container creation parameters, shaped like the engine's host config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeArgs {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceMapping>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl RuntimeArgs {
    pub fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.devices.is_empty() && self.env.is_empty() && self.runtime.is_none()
    }
}

/// Produces runtime parameters for a set of active devices.
#[async_trait]
pub trait RuntimeArgsGenerator: Send + Sync {
    async fn generate(
        &self,
        active: &BTreeSet<DeviceId>,
    ) -> Result<RuntimeArgs, Report<AcceleratorError>>;
}

/// Volume operations of the container engine.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Names of the volumes present on the host.
    async fn list_volumes(&self) -> Result<Vec<String>, Report<AcceleratorError>>;

    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), Report<AcceleratorError>>;
}

/// Detected runtime integration.
pub enum RuntimeIntegration {
    /// No device is ever exposed.
    Disabled { reason: String },
    VolumePlugin(VolumePluginGenerator),
    RuntimeFlag(VisibleDevicesGenerator),
    /// Helper reported a major version without a known protocol.
    Unsupported(RuntimeVersion),
}

impl RuntimeIntegration {
    /// Detect the integration for the configured family.
    ///
    /// Any failure to detect a version disables the integration.
    pub async fn resolve(config: &PluginConfig, containers: Arc<dyn ContainerClient>) -> Self {
        match config.family {
            DeviceFamily::Tpu => {
                let tpu_name = std::env::var("TPU_NAME").unwrap_or_default();
                Self::RuntimeFlag(VisibleDevicesGenerator::tpu(tpu_name))
            }
            DeviceFamily::Cuda => {
                match probe_version(&config.helper_binary, config.probe_timeout).await {
                    Ok(version) => Self::for_version(version, config, containers),
                    Err(e) => {
                        tracing::warn!(
                            helper = %config.helper_binary.display(),
                            error = ?e,
                            "runtime integration disabled"
                        );
                        Self::Disabled {
                            reason: e.current_context().to_string(),
                        }
                    }
                }
            }
        }
    }

    pub fn for_version(
        version: RuntimeVersion,
        config: &PluginConfig,
        containers: Arc<dyn ContainerClient>,
    ) -> Self {
        let integration = match version.major {
            1 => match VolumePluginGenerator::new(
                &config.volume_plugin_url,
                config.volume_plugin_timeout,
                containers,
            ) {
                Ok(generator) => Self::VolumePlugin(generator),
                Err(e) => {
                    tracing::error!(error = ?e, "failed to set up volume plugin client");
                    Self::Disabled {
                        reason: e.current_context().to_string(),
                    }
                }
            },
            2 => Self::RuntimeFlag(VisibleDevicesGenerator::nvidia()),
            _ => Self::Unsupported(version),
        };
        tracing::info!(%version, integration = integration.name(), "runtime integration detected");
        integration
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disabled { .. } => "disabled",
            Self::VolumePlugin(_) => "volume-plugin",
            Self::RuntimeFlag(_) => "runtime-flag",
            Self::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled { .. })
    }
}

#[async_trait]
impl RuntimeArgsGenerator for RuntimeIntegration {
    async fn generate(
        &self,
        active: &BTreeSet<DeviceId>,
    ) -> Result<RuntimeArgs, Report<AcceleratorError>> {
        if active.is_empty() {
            return Ok(RuntimeArgs::default());
        }
        match self {
            Self::Disabled { .. } => Ok(RuntimeArgs::default()),
            Self::VolumePlugin(generator) => generator.generate(active).await,
            Self::RuntimeFlag(generator) => generator.generate(active).await,
            Self::Unsupported(version) => Err(Report::new(
                AcceleratorError::UnsupportedProtocolVersion {
                    version: version.to_string(),
                },
            )),
        }
    }
}
