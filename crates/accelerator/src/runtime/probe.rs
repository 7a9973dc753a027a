//! Helper binary version probe.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;

use super::RuntimeVersion;
use crate::error::AcceleratorError;

/// Run `<binary> version` and parse the first `<name>: <major>.<minor>.<patch>` line.
#[tracing::instrument(skip(binary, timeout), fields(binary = %binary.display()))]
pub async fn probe_version(
    binary: &Path,
    timeout: Duration,
) -> Result<RuntimeVersion, Report<AcceleratorError>> {
    let failed = |message: String| AcceleratorError::VersionDetectionFailed { message };

    let output = tokio::time::timeout(
        timeout,
        Command::new(binary).arg("version").kill_on_drop(true).output(),
    )
    .await
    .change_context_lazy(|| failed(format!("{} version timed out after {timeout:?}", binary.display())))?
    .change_context_lazy(|| failed(format!("failed to run {}", binary.display())))?;

    if !output.status.success() {
        return Err(Report::new(failed(format!(
            "{} version exited with {}",
            binary.display(),
            output.status
        )))
        .attach_printable(String::from_utf8_lossy(&output.stderr).into_owned()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = parse_version_output(&stdout).ok_or_else(|| {
        Report::new(failed(format!(
            "{} version printed no version line",
            binary.display()
        )))
        .attach_printable(stdout.clone().into_owned())
    })?;

    tracing::debug!(%version, "helper version detected");
    Ok(version)
}

pub(crate) fn parse_version_output(output: &str) -> Option<RuntimeVersion> {
    output.lines().find_map(parse_version_line)
}

fn parse_version_line(line: &str) -> Option<RuntimeVersion> {
    let (name, rest) = line.split_once(':')?;
    if name.trim().is_empty() {
        return None;
    }

    let mut parts = rest.split_whitespace().next()?.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    // tolerate suffixes such as "3-rc1"
    let patch = parts.next()?;
    let digits = patch
        .find(|c: char| !c.is_ascii_digit())
        .map_or(patch, |end| &patch[..end]);
    let patch = digits.parse().ok()?;

    Some(RuntimeVersion {
        major,
        minor,
        patch,
    })
}
