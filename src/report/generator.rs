//! Measurement report generation.
//!
//! Three renderings of the same [`Report`]: the console summary, a
//! Markdown document and pretty-printed JSON.

use crate::cli::OutputFormat;
use crate::models::{ChannelStats, Report, ReportMetadata, SlotReport};
use anyhow::Result;

const TEXT_HEADER: &str = "------------------ Measurement results ------------------";
const TEXT_FOOTER: &str = "---------------------------------------------------------";

/// Render `report` in the requested format.
pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(generate_text_report(report)),
        OutputFormat::Markdown => Ok(generate_markdown_report(report)),
        OutputFormat::Json => generate_json_report(report),
    }
}

/// Generate the console report.
///
/// Values are truncated to integers, as the cape tooling has always
/// printed them.
pub fn generate_text_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str(TEXT_HEADER);
    output.push('\n');
    output.push_str(&format!("Power Rails: {}\n", report.slots.len()));
    output.push_str(&format!(
        "Duration: {}s\n",
        report.metadata.duration_seconds.trunc()
    ));

    for (i, slot) in report.slots.iter().enumerate() {
        if i > 0 {
            output.push('\n');
        }
        output.push_str(&generate_text_slot(slot));
    }

    output.push_str(TEXT_FOOTER);
    output.push('\n');

    output
}

fn generate_text_slot(slot: &SlotReport) -> String {
    let mut section = String::new();

    section.push_str(&slot.title());
    section.push('\n');
    section.push_str(&text_line("Voltage", &slot.voltage));
    section.push_str(&text_line("Current", &slot.current));
    section.push_str(&text_line("Power  ", &slot.power));

    if slot.failed() {
        section.push_str(&format!("  ⚠️  Capture errors: {}\n", failure_summary(slot)));
    }

    section
}

fn text_line(name: &str, stats: &ChannelStats) -> String {
    format!(
        "  {} ({}): min={} max={} avg={}\n",
        name,
        stats.unit,
        truncated(stats.min),
        truncated(stats.max),
        truncated(stats.avg)
    )
}

fn truncated(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}", v.trunc() as i64),
        None => "n/a".to_string(),
    }
}

/// Which series of a slot saw failures, e.g. `current, 2 refill(s) failed`.
fn failure_summary(slot: &SlotReport) -> String {
    let mut parts = Vec::new();
    if let Some(ref error) = slot.error {
        parts.push(error.clone());
    }
    if slot.voltage.failed {
        parts.push("voltage read failed".to_string());
    }
    if slot.current.failed {
        parts.push("current read failed".to_string());
    }
    if slot.refill_failures > 0 {
        parts.push(format!(
            "{} of {} refill(s) failed",
            slot.refill_failures, slot.cycles
        ));
    }
    parts.join(", ")
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# ACME Power Measurement Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata, report.slots.len()));
    output.push_str(&generate_results_section(&report.slots));

    let failed = report.failed_slots();
    if !failed.is_empty() {
        output.push_str(&generate_failures_section(report));
    }

    output
}

fn generate_metadata_section(metadata: &ReportMetadata, rails: usize) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Cape:** `{}`\n", metadata.host));
    section.push_str(&format!(
        "- **Capture Date:** {}\n",
        metadata.capture_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Power Rails:** {}\n", rails));
    section.push_str(&format!(
        "- **Duration:** {:.1}s (elapsed {:.2}s)\n",
        metadata.duration_seconds, metadata.elapsed_seconds
    ));
    section.push('\n');

    section
}

fn generate_results_section(slots: &[SlotReport]) -> String {
    let mut section = String::new();

    section.push_str("## Results\n\n");
    if slots.is_empty() {
        section.push_str("No power rail was captured.\n\n");
        return section;
    }

    section.push_str("| Rail | Quantity | Unit | Min | Max | Avg | Samples |\n");
    section.push_str("|:---|:---|:---:|---:|---:|---:|---:|\n");

    for slot in slots {
        let title = slot.title();
        for (name, stats) in [
            ("Voltage", &slot.voltage),
            ("Current", &slot.current),
            ("Power", &slot.power),
        ] {
            let marker = if stats.failed { " ⚠️" } else { "" };
            section.push_str(&format!(
                "| {} | {}{} | {} | {} | {} | {} | {} |\n",
                title,
                name,
                marker,
                stats.unit,
                decimal(stats.min),
                decimal(stats.max),
                decimal(stats.avg),
                stats.count
            ));
        }
    }
    section.push('\n');

    section
}

fn decimal(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

fn generate_failures_section(report: &Report) -> String {
    let mut section = String::new();

    section.push_str("## Capture Errors\n\n");
    for slot in report.slots.iter().filter(|s| s.failed()) {
        section.push_str(&format!("- **{}:** {}\n", slot.title(), failure_summary(slot)));
    }
    section.push('\n');

    section
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stats(unit: &str, min: f64, max: f64, avg: f64) -> ChannelStats {
        ChannelStats {
            unit: unit.to_string(),
            count: 3,
            min: Some(min),
            max: Some(max),
            avg: Some(avg),
            failed: false,
        }
    }

    fn create_slot(slot: usize, label: Option<&str>) -> SlotReport {
        SlotReport {
            slot,
            label: label.map(str::to_string),
            voltage: stats("mV", 4998.75, 5001.25, 5000.4),
            current: stats("mA", 249.7, 250.3, 250.0),
            power: stats("uW", 1248187.5, 1251625.9, 1250100.0),
            cycles: 20,
            refill_failures: 0,
            error: None,
        }
    }

    fn create_test_report() -> Report {
        Report {
            metadata: ReportMetadata {
                host: "baylibre-acme.local".to_string(),
                capture_date: Utc::now(),
                duration_seconds: 10.0,
                elapsed_seconds: 10.48,
            },
            slots: vec![create_slot(1, Some("VDD_BAT")), create_slot(2, None)],
        }
    }

    #[test]
    fn test_generate_text_report() {
        let text = generate_text_report(&create_test_report());
        let expected = "\
------------------ Measurement results ------------------
Power Rails: 2
Duration: 10s
VDD_BAT (slot 1)
  Voltage (mV): min=4998 max=5001 avg=5000
  Current (mA): min=249 max=250 avg=250
  Power   (uW): min=1248187 max=1251625 avg=1250100

Slot 2
  Voltage (mV): min=4998 max=5001 avg=5000
  Current (mA): min=249 max=250 avg=250
  Power   (uW): min=1248187 max=1251625 avg=1250100
---------------------------------------------------------
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_text_report_flags_failures() {
        let mut report = create_test_report();
        report.slots[1].current.failed = true;
        report.slots[1].current.min = None;
        report.slots[1].refill_failures = 2;

        let text = generate_text_report(&report);
        assert!(text.contains("Current (mA): min=n/a"));
        assert!(text.contains("Capture errors: current read failed, 2 of 20 refill(s) failed"));
    }

    #[test]
    fn test_generate_markdown_report() {
        let mut report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# ACME Power Measurement Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("`baylibre-acme.local`"));
        assert!(markdown.contains("| VDD_BAT (slot 1) | Power | uW |"));
        assert!(!markdown.contains("## Capture Errors"));

        report.slots[0].voltage.failed = true;
        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("| Voltage ⚠️ |"));
        assert!(markdown.contains("## Capture Errors"));
        assert!(markdown.contains("- **VDD_BAT (slot 1):** voltage read failed"));
    }

    #[test]
    fn test_markdown_without_slots() {
        let mut report = create_test_report();
        report.slots.clear();
        assert!(generate_markdown_report(&report).contains("No power rail was captured."));
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"host\""));
        assert!(json.contains("\"slots\""));
        assert!(json.contains("\"label\": \"VDD_BAT\""));

        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.slots.len(), 2);
        // Unlabelled slots omit the field
        assert!(parsed.slots[1].label.is_none());
    }

    #[test]
    fn test_render_json_is_the_whole_output() {
        let report = create_test_report();
        let json = render(&report, OutputFormat::Json).unwrap();

        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
        assert_eq!(
            render(&report, OutputFormat::Text).unwrap(),
            generate_text_report(&report)
        );
    }

    #[test]
    fn test_worker_error_in_reports() {
        let mut report = create_test_report();
        report.slots[0].error = Some("capture worker for slot 1 panicked: device lost".to_string());

        let text = generate_text_report(&report);
        assert!(text.contains("Capture errors: capture worker for slot 1 panicked: device lost"));
        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("- **VDD_BAT (slot 1):** capture worker for slot 1 panicked"));
    }
}
