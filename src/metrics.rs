use crate::sink::SeriesSnapshot;
use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::fmt::Write as _;
use std::sync::OnceLock;

pub use crate::telemetry::RuntimeCountersSnapshot;

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn record_event_response(&self, opt_type: &str) {
        self.counters.record_event_response(opt_type);
    }
}

/// Returns the shared `MetricsCollector` instance.
pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}

/// Prometheus text exposition of the runtime counters followed by every sink series.
pub fn render_prometheus(counters: &RuntimeCountersSnapshot, series: &[SeriesSnapshot]) -> String {
    let mut output = String::new();

    append_counter(
        &mut output,
        "vtn_events_delivered_total",
        "Events handed to the delivery channel",
        counters.events_delivered,
    );
    append_counter(
        &mut output,
        "vtn_event_delivery_failures_total",
        "Events the delivery channel could not hand over",
        counters.event_delivery_failures,
    );
    append_counter(
        &mut output,
        "vtn_report_values_ingested_total",
        "Report values routed to a callback",
        counters.report_values_ingested,
    );
    append_counter(
        &mut output,
        "vtn_report_values_unroutable_total",
        "Report values dropped because no callback was registered",
        counters.report_values_unroutable,
    );
    append_counter(
        &mut output,
        "vtn_report_callback_failures_total",
        "Report callback invocations that failed",
        counters.report_callback_failures,
    );
    append_counter(
        &mut output,
        "vtn_backup_writes_total",
        "Successful VEN backup snapshot writes",
        counters.backup_writes,
    );
    append_counter(
        &mut output,
        "vtn_backup_write_failures_total",
        "Failed VEN backup snapshot writes",
        counters.backup_write_failures,
    );

    append_labelled(
        &mut output,
        "vtn_polls_total",
        "Polls answered by response kind",
        "response",
        counters.polls.iter().map(|(label, total)| (*label, *total)),
    );
    append_labelled(
        &mut output,
        "vtn_event_tasks_cancelled_total",
        "Scheduled event tasks cancelled by reason",
        "reason",
        counters
            .cancellations
            .iter()
            .map(|(label, total)| (*label, *total)),
    );
    append_labelled(
        &mut output,
        "vtn_event_responses_total",
        "Event responses received by opt type",
        "opt_type",
        counters
            .event_responses
            .iter()
            .map(|(label, total)| (label.as_str(), *total)),
    );

    for entry in series {
        let _ = writeln!(output, "# HELP {} {}", entry.name, escape_help(&entry.help));
        let _ = writeln!(output, "# TYPE {} gauge", entry.name);
        if let Some(value) = entry.value {
            let _ = writeln!(output, "{} {}", entry.name, value);
        }
    }

    output
}

fn append_counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

fn append_labelled<'a>(
    output: &mut String,
    name: &str,
    help: &str,
    label: &str,
    values: impl Iterator<Item = (&'a str, u64)>,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value_label, total) in values {
        let _ = writeln!(
            output,
            "{name}{{{label}=\"{}\"}} {total}",
            escape_label(value_label)
        );
    }
}

fn escape_help(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
