//! Prometheus text exposition format.
//!
//! Renders the gateway counters, the correlator's pending gauge and the
//! autoscaler's latest fleet snapshot for scraping at `/metrics`.

use std::fmt::Write;

use classgrid_autoscale::FleetSnapshot;

use crate::collector::GatewaySnapshot;

fn metric(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render gateway and fleet state into Prometheus text format.
///
/// Fleet gauges are omitted when no autoscaler runs in this process.
pub fn render_prometheus(
    gateway: &GatewaySnapshot,
    pending: usize,
    fleet: Option<&FleetSnapshot>,
) -> String {
    let mut out = String::new();

    metric(&mut out, "classgrid_submissions_total", "counter", "Submissions accepted for dispatch.");
    let _ = writeln!(out, "classgrid_submissions_total {}", gateway.submitted);

    metric(&mut out, "classgrid_results_total", "counter", "Submissions answered, by outcome.");
    for (outcome, value) in [
        ("label", gateway.completed),
        ("capability_failed", gateway.capability_failed),
        ("payload_missing", gateway.payload_missing),
        ("poison_message", gateway.poison),
        ("timeout", gateway.timed_out),
    ] {
        let _ = writeln!(out, "classgrid_results_total{{outcome=\"{outcome}\"}} {value}");
    }

    metric(&mut out, "classgrid_rejected_total", "counter", "Submissions refused before dispatch, by reason.");
    for (reason, value) in [
        ("duplicate", gateway.duplicates),
        ("malformed", gateway.rejected),
        ("internal", gateway.internal_errors),
    ] {
        let _ = writeln!(out, "classgrid_rejected_total{{reason=\"{reason}\"}} {value}");
    }

    metric(&mut out, "classgrid_latency_ms", "gauge", "Round-trip latency of labelled submissions in milliseconds.");
    let _ = writeln!(out, "classgrid_latency_ms{{quantile=\"0.5\"}} {:.2}", gateway.latency_p50_ms);
    let _ = writeln!(out, "classgrid_latency_ms{{quantile=\"0.99\"}} {:.2}", gateway.latency_p99_ms);

    metric(&mut out, "classgrid_pending_requests", "gauge", "Requests waiting for a result.");
    let _ = writeln!(out, "classgrid_pending_requests {pending}");

    if let Some(fleet) = fleet {
        metric(&mut out, "classgrid_backlog", "gauge", "Visible tasks on the task queue at the last tick.");
        let _ = writeln!(out, "classgrid_backlog {}", fleet.backlog);

        metric(&mut out, "classgrid_fleet_instances", "gauge", "Worker instances by state.");
        for (state, value) in [
            ("running", fleet.running),
            ("launching", fleet.launching),
            ("terminating", fleet.terminating),
        ] {
            let _ = writeln!(out, "classgrid_fleet_instances{{state=\"{state}\"}} {value}");
        }

        metric(&mut out, "classgrid_fleet_desired", "gauge", "Desired fleet size at the last tick.");
        let _ = writeln!(out, "classgrid_fleet_desired {}", fleet.desired);

        metric(&mut out, "classgrid_autoscaler_ticks_total", "counter", "Completed autoscaler ticks.");
        let _ = writeln!(out, "classgrid_autoscaler_ticks_total {}", fleet.ticks);

        metric(&mut out, "classgrid_last_decision", "gauge", "Instance count of the last scaling action.");
        let _ = writeln!(
            out,
            "classgrid_last_decision{{action=\"{}\"}} {}",
            fleet.last_decision.action(),
            fleet.last_decision.count()
        );
    }

    out
}
