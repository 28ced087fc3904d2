//! Prometheus text exposition format.
//!
//! Renders the hub metric families into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::hub::HubMetrics;
use crate::vec::{GaugeVec, HistogramVec};

/// Render every hub metric family into Prometheus text format.
pub fn render_prometheus(metrics: &HubMetrics) -> String {
    let mut out = String::new();

    render_gauge(&mut out, &metrics.placement_status_last_timestamp);
    render_gauge(&mut out, &metrics.eviction_complete);
    render_gauge(&mut out, &metrics.update_run_status_last_timestamp);
    render_histogram(&mut out, &metrics.update_run_approval_request_latency);
    render_histogram(&mut out, &metrics.update_run_stage_cluster_updating_duration);
    render_histogram(&mut out, &metrics.scheduling_cycle_duration);
    render_gauge(&mut out, &metrics.scheduling_active_workers);

    out
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn label_set(names: &[&'static str], values: &[String], extra: Option<(&str, &str)>) -> String {
    let mut pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(n, v)| format!("{n}=\"{}\"", escape(v)))
        .collect();
    if let Some((n, v)) = extra {
        pairs.push(format!("{n}=\"{v}\""));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn render_gauge(out: &mut String, g: &GaugeVec) {
    let _ = writeln!(out, "# HELP {} {}", g.name(), g.help());
    let _ = writeln!(out, "# TYPE {} gauge", g.name());
    for (values, v) in g.snapshot() {
        let _ = writeln!(out, "{}{} {}", g.name(), label_set(g.label_names(), &values, None), v);
    }
}

fn render_histogram(out: &mut String, h: &HistogramVec) {
    let name = h.name();
    let _ = writeln!(out, "# HELP {name} {}", h.help());
    let _ = writeln!(out, "# TYPE {name} histogram");
    for (values, series) in h.snapshot() {
        for (bound, count) in h.bounds().iter().zip(&series.buckets) {
            let le = bound.to_string();
            let labels = label_set(h.label_names(), &values, Some(("le", &le)));
            let _ = writeln!(out, "{name}_bucket{labels} {count}");
        }
        let inf = label_set(h.label_names(), &values, Some(("le", "+Inf")));
        let _ = writeln!(out, "{name}_bucket{inf} {}", series.count);
        let plain = label_set(h.label_names(), &values, None);
        let _ = writeln!(out, "{name}_sum{plain} {}", series.sum);
        let _ = writeln!(out, "{name}_count{plain} {}", series.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_empty() {
        let output = render_prometheus(&HubMetrics::new());
        // Should still have type declarations.
        assert!(output.contains("# HELP scheduling_cycle_duration_milliseconds"));
        assert!(output.contains("# TYPE scheduling_cycle_duration_milliseconds histogram"));
        assert!(output.contains("# TYPE scheduling_active_workers gauge"));
    }

    #[test]
    fn render_gauge_series() {
        let m = HubMetrics::new();
        m.update_run_status_last_timestamp
            .set(&["ns", "run-1", "Run", "Progressing", "True", "UpdateRunStarted"], 1700000000.0);
        m.scheduling_active_workers.set(&[], 3.0);
        let output = render_prometheus(&m);

        assert!(output.contains(
            "fleet_workload_update_run_status_last_timestamp_seconds{namespace=\"ns\",name=\"run-1\",state=\"Run\",condition=\"Progressing\",status=\"True\",reason=\"UpdateRunStarted\"} 1700000000"
        ));
        assert!(output.contains("scheduling_active_workers 3"));
    }

    #[test]
    fn render_histogram_series() {
        let m = HubMetrics::new();
        m.scheduling_cycle_duration.observe(&["false", "false"], 42.0);
        let output = render_prometheus(&m);

        assert!(output.contains(
            "scheduling_cycle_duration_milliseconds_bucket{is_failed=\"false\",needs_requeue=\"false\",le=\"10\"} 0"
        ));
        assert!(output.contains(
            "scheduling_cycle_duration_milliseconds_bucket{is_failed=\"false\",needs_requeue=\"false\",le=\"50\"} 1"
        ));
        assert!(output.contains(
            "scheduling_cycle_duration_milliseconds_bucket{is_failed=\"false\",needs_requeue=\"false\",le=\"+Inf\"} 1"
        ));
        assert!(output.contains(
            "scheduling_cycle_duration_milliseconds_count{is_failed=\"false\",needs_requeue=\"false\"} 1"
        ));
    }

    #[test]
    fn label_values_are_escaped() {
        let m = HubMetrics::new();
        m.eviction_complete.set(&["we\"ird", "true", "true"], 1.0);
        let output = render_prometheus(&m);
        assert!(output.contains("name=\"we\\\"ird\""));
    }
}
