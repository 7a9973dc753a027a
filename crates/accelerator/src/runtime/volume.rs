//! Volume plugin integration (helper major version 1).
//!
//! The plugin serves the driver volumes and device files every GPU container
//! needs from `GET /docker/cli/json`. Missing volumes are created through the
//! container engine, and device files are narrowed down to the allocated
//! devices plus the driver-wide control files.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::DeviceId;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;

use super::ContainerClient;
use super::DeviceMapping;
use super::RuntimeArgs;
use super::RuntimeArgsGenerator;
use crate::error::AcceleratorError;

const CLI_JSON_PATH: &str = "/docker/cli/json";
const DEVICE_PERMISSIONS: &str = "mrw";

/// Body of `GET /docker/cli/json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumePluginResponse {
    /// `name:mountpoint:permission` bind strings
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub volume_driver: String,
    #[serde(default)]
    pub devices: Vec<String>,
}

pub struct VolumePluginGenerator {
    client: reqwest::Client,
    url: String,
    containers: Arc<dyn ContainerClient>,
}

impl VolumePluginGenerator {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        containers: Arc<dyn ContainerClient>,
    ) -> Result<Self, Report<AcceleratorError>> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(AcceleratorError::InvalidConfig {
                message: "failed to build volume plugin HTTP client".to_string(),
            })?;

        Ok(Self {
            client,
            url: format!("{}{CLI_JSON_PATH}", base_url.trim_end_matches('/')),
            containers,
        })
    }

    async fn query(&self) -> Result<VolumePluginResponse, Report<AcceleratorError>> {
        let unavailable = |message: String| AcceleratorError::RuntimeIntegrationUnavailable { message };

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .change_context_lazy(|| unavailable(format!("volume plugin at {} is unreachable", self.url)))?;

        response
            .json()
            .await
            .change_context_lazy(|| unavailable(format!("malformed response from {}", self.url)))
    }

    /// Create every required volume the host does not have yet.
    async fn ensure_volumes(
        &self,
        binds: &[String],
        driver: &str,
    ) -> Result<(), Report<AcceleratorError>> {
        let existing: BTreeSet<String> = self.containers.list_volumes().await?.into_iter().collect();

        for name in binds.iter().filter_map(|bind| volume_name(bind)) {
            if existing.contains(name) {
                continue;
            }
            self.containers.create_volume(name, driver).await?;
            tracing::info!(volume = name, driver, "created driver volume");
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeArgsGenerator for VolumePluginGenerator {
    async fn generate(
        &self,
        active: &BTreeSet<DeviceId>,
    ) -> Result<RuntimeArgs, Report<AcceleratorError>> {
        let response = self.query().await?;
        self.ensure_volumes(&response.volumes, &response.volume_driver)
            .await?;

        let devices = filter_devices(&response.devices, active)
            .into_iter()
            .map(|path| DeviceMapping {
                path_on_host: path.clone(),
                path_in_container: path,
                cgroup_permissions: DEVICE_PERMISSIONS.to_string(),
            })
            .collect();

        Ok(RuntimeArgs {
            binds: response.volumes,
            devices,
            ..Default::default()
        })
    }
}

fn volume_name(bind: &str) -> Option<&str> {
    bind.split(':').next().filter(|name| !name.is_empty())
}

/// Index encoded in the trailing digits of a device file name.
pub(crate) fn device_index(path: &str) -> Option<u64> {
    let file = path.rsplit('/').next()?;
    let prefix = file.trim_end_matches(|c: char| c.is_ascii_digit());
    file[prefix.len()..].parse().ok()
}

/// Keep device files of active devices and files without an index.
pub(crate) fn filter_devices(devices: &[String], active: &BTreeSet<DeviceId>) -> Vec<String> {
    let active: BTreeSet<u64> = active.iter().filter_map(DeviceId::index).collect();
    devices
        .iter()
        .filter(|path| device_index(path).map_or(true, |index| active.contains(&index)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;
    use crate::testing::MockContainerClient;

    fn active(ids: &[&str]) -> BTreeSet<DeviceId> {
        ids.iter().copied().map(DeviceId::from).collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn plugin_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CLI_JSON_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Volumes": ["nvidia_driver_384.81:/usr/local/nvidia:ro"],
                "VolumeDriver": "nvidia-docker",
                "Devices": ["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia0", "/dev/nvidia1"],
            })))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_device_index() {
        assert_eq!(device_index("/dev/nvidia12"), Some(12));
        assert_eq!(device_index("/dev/nvidiactl"), None);
        assert_eq!(device_index("/dev/nvidia-uvm"), None);
        assert_eq!(device_index("nvidia3"), Some(3));
    }

    #[test]
    fn test_filter_devices_keeps_active_and_control_files() {
        let devices = strings(&["/dev/nvidiactl", "/dev/nvidia0", "/dev/nvidia1"]);
        assert_eq!(
            filter_devices(&devices, &active(&["1"])),
            strings(&["/dev/nvidiactl", "/dev/nvidia1"])
        );
    }

    #[tokio::test]
    async fn test_generate_against_plugin() {
        let server = plugin_server().await;
        let containers = Arc::new(MockContainerClient::default());
        let generator =
            VolumePluginGenerator::new(&server.uri(), Duration::from_secs(3), containers.clone())
                .unwrap();

        let args = generator.generate(&active(&["1"])).await.unwrap();

        assert_eq!(args.binds, strings(&["nvidia_driver_384.81:/usr/local/nvidia:ro"]));
        let paths: Vec<&str> = args.devices.iter().map(|d| d.path_on_host.as_str()).collect();
        assert_eq!(paths, vec!["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia1"]);
        assert!(args.devices.iter().all(|d| d.cgroup_permissions == "mrw"));
        assert_eq!(args.env, Vec::<String>::new());
        assert_eq!(args.runtime, None);
        assert_eq!(
            containers.created(),
            vec![("nvidia_driver_384.81".to_string(), "nvidia-docker".to_string())]
        );
    }

    #[tokio::test]
    async fn test_existing_volumes_are_not_recreated() {
        let server = plugin_server().await;
        let containers = Arc::new(MockContainerClient::with_volumes(["nvidia_driver_384.81"]));
        let generator =
            VolumePluginGenerator::new(&server.uri(), Duration::from_secs(3), containers.clone())
                .unwrap();

        generator.generate(&active(&["0"])).await.unwrap();
        generator.generate(&active(&["0"])).await.unwrap();

        assert!(containers.created().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_plugin_is_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let generator = VolumePluginGenerator::new(
            &server.uri(),
            Duration::from_secs(3),
            Arc::new(MockContainerClient::default()),
        )
        .unwrap();

        let err = generator.generate(&active(&["0"])).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            AcceleratorError::RuntimeIntegrationUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_slow_plugin_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;
        let generator = VolumePluginGenerator::new(
            &server.uri(),
            Duration::from_millis(100),
            Arc::new(MockContainerClient::default()),
        )
        .unwrap();

        let err = generator.generate(&active(&["0"])).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            AcceleratorError::RuntimeIntegrationUnavailable { .. }
        ));
    }
}
