//! Cloud TPU enumeration through the `ctpu` command line tool.

use std::io;
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;

use crate::error::AcceleratorError;
use crate::inventory::DeviceDriver;
use crate::inventory::DeviceProperties;

const DRIVER_NAME: &str = "ctpu";
const MACHINE_TYPE_PREFIX: &str = "Compute Engine Machine Type:";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// TPUs do not report their memory; the host VM's 7.5 GB is used instead.
const TPU_MEMORY_SIZE: u64 = 7_500_000_000;

pub struct CtpuDriver {
    binary: PathBuf,
    /// Bound on each `ctpu` invocation; the process is killed past it.
    timeout: Duration,
}

impl CtpuDriver {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, Report<AcceleratorError>> {
        let command = || format!("{} {}", self.binary.display(), args.join(" "));

        let mut child = match Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Report::new(e).change_context(AcceleratorError::DriverUnavailable {
                    driver: DRIVER_NAME.to_string(),
                }));
            }
            Err(e) => {
                return Err(Report::new(e).change_context(AcceleratorError::DeviceQuery {
                    message: format!("failed to run {}", command()),
                }));
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        tracing::warn!(error = %e, "failed to kill {}", command());
                    }
                    let _ = child.wait();
                    return Err(Report::new(AcceleratorError::DeviceQuery {
                        message: format!("{} timed out after {:?}", command(), self.timeout),
                    }));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(Report::new(e).change_context(AcceleratorError::DeviceQuery {
                        message: format!("failed to wait for {}", command()),
                    }));
                }
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        if !status.success() {
            let stderr = stderr.join().unwrap_or_default();
            return Err(Report::new(AcceleratorError::DeviceQuery {
                message: format!("{} exited with {status}", command()),
            })
            .attach_printable(String::from_utf8_lossy(&stderr).into_owned()));
        }

        String::from_utf8(stdout).change_context(AcceleratorError::DeviceQuery {
            message: "ctpu output is not valid UTF-8".to_string(),
        })
    }
}

/// Read a child pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        buffer
    })
}

/// TPU names from `ctpu ls -no-header`: the second column of every row.
pub(crate) fn parse_tpu_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// Machine type from `ctpu status -details`.
pub(crate) fn parse_machine_type(details: &str) -> Option<String> {
    details
        .lines()
        .find_map(|line| line.trim().strip_prefix(MACHINE_TYPE_PREFIX))
        .map(str::trim)
        .filter(|machine| !machine.is_empty())
        .map(str::to_string)
}

impl DeviceDriver for CtpuDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn enumerate(&self) -> Result<Vec<DeviceProperties>, Report<AcceleratorError>> {
        let listing = self.run(&["ls", "-no-header"])?;
        let names = parse_tpu_names(&listing);

        let mut devices = Vec::with_capacity(names.len());
        for (index, name) in (0u32..).zip(names) {
            let machine_type = match self.run(&["status", "-details", "-name", &name]) {
                Ok(details) => parse_machine_type(&details),
                Err(e) => {
                    tracing::warn!(tpu = %name, error = ?e, "failed to read TPU details");
                    None
                }
            };
            let machine_type = machine_type.unwrap_or_else(|| "unknown".to_string());

            devices.push(DeviceProperties {
                index,
                pci_bus_id: None,
                hw_location: format!("{machine_type}@{name}"),
                memory_size: TPU_MEMORY_SIZE,
                processing_units: 1,
                model_name: "Cloud TPU".to_string(),
                uuid: None,
            });
        }

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_tpu_names() {
        let listing = "1\ttpu-alpha\tREADY\n2  tpu-beta  CREATING\n\nbroken\n";
        assert_eq!(
            parse_tpu_names(listing),
            vec!["tpu-alpha".to_string(), "tpu-beta".to_string()]
        );
    }

    #[test]
    fn test_parse_machine_type() {
        let details = "Name: tpu-alpha\nCompute Engine Machine Type:   n1-standard-2\nState: READY\n";
        assert_eq!(parse_machine_type(details).as_deref(), Some("n1-standard-2"));
        assert_eq!(parse_machine_type("Name: tpu-alpha\n"), None);
        assert_eq!(parse_machine_type("Compute Engine Machine Type:\n"), None);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let driver = CtpuDriver::new("/nonexistent/ctpu", Duration::from_secs(1));
        let err = driver.enumerate().unwrap_err();
        assert!(matches!(
            err.current_context(),
            AcceleratorError::DriverUnavailable { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_enumerate_with_fake_ctpu() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("ctpu");
        std::fs::write(
            &script,
            r#"#!/bin/sh
case "$1" in
  ls) printf '1  tpu-a  READY\n2  tpu-b  READY\n' ;;
  status)
    if [ "$4" = "tpu-a" ]; then
      printf 'Name: tpu-a\nCompute Engine Machine Type: n1-standard-2\n'
    else
      printf 'Name: tpu-b\n'
    fi
    ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let devices = CtpuDriver::new(&script, Duration::from_secs(5)).enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].hw_location, "n1-standard-2@tpu-a");
        assert_eq!(devices[1].hw_location, "unknown@tpu-b");
        assert_eq!(devices[1].memory_size, TPU_MEMORY_SIZE);
        assert_eq!(devices[1].processing_units, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_ctpu_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("ctpu");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let started = Instant::now();
        let err = CtpuDriver::new(&script, Duration::from_millis(200))
            .enumerate()
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err.current_context() {
            AcceleratorError::DeviceQuery { message } => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
