//! Visible-devices environment integration.

use std::collections::BTreeSet;

use api_types::DeviceId;
use async_trait::async_trait;
use error_stack::Report;

use super::RuntimeArgs;
use super::RuntimeArgsGenerator;
use crate::error::AcceleratorError;

/// Exposes devices through a `<VAR>=<id>,<id>` environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleDevicesGenerator {
    variable: String,
    runtime: Option<String>,
    extra_env: Vec<String>,
}

impl VisibleDevicesGenerator {
    /// NVIDIA container runtime (helper major version 2).
    pub fn nvidia() -> Self {
        Self {
            variable: "NVIDIA_VISIBLE_DEVICES".to_string(),
            runtime: Some("nvidia".to_string()),
            extra_env: Vec::new(),
        }
    }

    /// Cloud TPU, forwarding the TPU name the agent runs with.
    pub fn tpu(tpu_name: impl AsRef<str>) -> Self {
        Self {
            variable: "TPU_VISIBLE_DEVICES".to_string(),
            runtime: None,
            extra_env: vec![format!("TPU_NAME={}", tpu_name.as_ref())],
        }
    }
}

#[async_trait]
impl RuntimeArgsGenerator for VisibleDevicesGenerator {
    async fn generate(
        &self,
        active: &BTreeSet<DeviceId>,
    ) -> Result<RuntimeArgs, Report<AcceleratorError>> {
        // BTreeSet iteration gives the sorted, deduplicated id list
        let ids: Vec<&str> = active.iter().map(DeviceId::as_str).collect();

        let mut env = Vec::with_capacity(1 + self.extra_env.len());
        env.push(format!("{}={}", self.variable, ids.join(",")));
        env.extend(self.extra_env.iter().cloned());

        Ok(RuntimeArgs {
            env,
            runtime: self.runtime.clone(),
            ..Default::default()
        })
    }
}
