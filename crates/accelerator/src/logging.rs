//! Process logging for the agent
//!
//! Regular events go to stderr; events with a `metrics.*` target are written
//! as InfluxDB line protocol to a daily-rolling measurements file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

use crate::error::AcceleratorError;

const METRICS_TARGET_PREFIX: &str = "metrics.";
const MAX_MEASUREMENT_FILES: usize = 3;

pub(crate) struct InfluxLineFormatter;

#[derive(Default)]
struct FieldVisitor {
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name().strip_prefix("tag_") {
            Some(tag) => self.tags.insert(tag.to_string(), value),
            None => self.fields.insert(field.name().to_string(), value),
        };
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

impl<S, N> FormatEvent<S, N> for InfluxLineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let target = event.metadata().target();
        write!(
            writer,
            "{}",
            target.strip_prefix(METRICS_TARGET_PREFIX).unwrap_or(target)
        )?;

        for (key, value) in &visitor.tags {
            write!(writer, ",{key}={value}")?;
        }

        let fields: Vec<String> = visitor
            .fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        write!(writer, " {}", fields.join(","))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        writeln!(writer, " {timestamp}")
    }
}

fn is_metrics_target(target: &str) -> bool {
    target.starts_with(METRICS_TARGET_PREFIX)
}

/// Install the global subscriber.
///
/// The returned guard flushes the measurements file when dropped.
pub fn init(measurements_file: &Path) -> Result<WorkerGuard, Report<AcceleratorError>> {
    let invalid = |message: String| AcceleratorError::InvalidConfig { message };

    let directory = measurements_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = measurements_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            Report::new(invalid(format!(
                "measurements file {} has no usable file name",
                measurements_file.display()
            )))
        })?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(MAX_MEASUREMENT_FILES)
        .build(directory)
        .change_context_lazy(|| {
            invalid(format!(
                "failed to open measurements file in {}",
                directory.display()
            ))
        })?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let fmt_layer = utils::logging::get_fmt_layer().with_filter(
        utils::logging::env_filter()
            .and(filter::filter_fn(|metadata| !is_metrics_target(metadata.target()))),
    );

    let metrics_layer = tracing_subscriber::fmt::layer()
        .event_format(InfluxLineFormatter)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(|metadata| is_metrics_target(metadata.target())));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(metrics_layer)
        .try_init()
        .change_context(invalid("a global tracing subscriber is already installed".to_string()))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_influx_line_format() {
        let buffer = SharedBuffer::default();
        let writer = buffer.clone();
        let layer = tracing_subscriber::fmt::layer()
            .event_format(InfluxLineFormatter)
            .with_writer(move || writer.clone())
            .with_ansi(false);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(
                target: "metrics.accelerator_device",
                tag_key = "cuda_mem",
                tag_device = "0",
                current = 512u64,
                capacity = 1024u64,
            );
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line = output.trim_end();
        let (measurement, timestamp) = line.rsplit_once(' ').unwrap();
        similar_asserts::assert_eq!(
            measurement,
            "accelerator_device,device=0,key=cuda_mem capacity=1024,current=512"
        );
        assert!(timestamp.parse::<u128>().is_ok());
    }

    #[test]
    fn test_metrics_target_filter() {
        assert!(is_metrics_target("metrics.accelerator_node"));
        assert!(!is_metrics_target("accelerator::collector"));
        assert!(!is_metrics_target("accelerator::metrics_helper"));
    }
}
