//! Post-capture reduction.
//!
//! Turns frozen [`CaptureResult`]s into a [`Report`]: derives the power
//! series from the bus voltage and load current and computes min/max/mean
//! per series. Everything here is pure; the same inputs always produce the
//! same report.

use crate::models::{
    CaptureResult, Channel, ChannelStats, Report, ReportMetadata, SampleSet, SlotReport,
};
use tracing::{debug, warn};

/// Element-wise product of voltage (mV) and current (mA) samples, in uW.
///
/// Capture keeps both series the same length; should they still differ,
/// the result is truncated to the shorter series.
pub fn derive_power(vbat: &[f64], ishunt: &[f64]) -> Vec<f64> {
    vbat.iter().zip(ishunt).map(|(v, i)| v * i).collect()
}

/// Min, max and arithmetic mean of `samples`.
///
/// All three are `None` for an empty series.
pub fn compute_stats(unit: &str, samples: &[f64], failed: bool) -> ChannelStats {
    let (min, max, avg) = if samples.is_empty() {
        (None, None, None)
    } else {
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        (Some(min), Some(max), Some(avg))
    };

    ChannelStats {
        unit: unit.to_string(),
        count: samples.len(),
        min,
        max,
        avg,
        failed,
    }
}

fn series(result: &CaptureResult, channel: Channel) -> (&[f64], &str, bool) {
    match result.channel(channel) {
        Some(SampleSet {
            samples,
            unit,
            failed,
            ..
        }) => (samples.as_slice(), unit.as_str(), *failed),
        None => (&[] as &[f64], channel.unit(), false),
    }
}

/// Reduce one worker's result to its report section.
pub fn aggregate_slot(result: &CaptureResult, label: Option<&str>, power_unit: &str) -> SlotReport {
    let (vbat, vbat_unit, vbat_failed) = series(result, Channel::Vbat);
    let (ishunt, ishunt_unit, ishunt_failed) = series(result, Channel::Ishunt);

    if vbat.len() != ishunt.len() {
        warn!(
            slot = result.slot,
            "{} has {} samples, {} has {}; power truncated",
            Channel::Vbat,
            vbat.len(),
            Channel::Ishunt,
            ishunt.len()
        );
    }
    let power = derive_power(vbat, ishunt);
    debug!(slot = result.slot, "{} power samples derived", power.len());

    SlotReport {
        slot: result.slot,
        label: label.map(str::to_string),
        voltage: compute_stats(vbat_unit, vbat, vbat_failed),
        current: compute_stats(ishunt_unit, ishunt, ishunt_failed),
        power: compute_stats(power_unit, &power, vbat_failed || ishunt_failed),
        cycles: result.stats.cycles,
        refill_failures: result.stats.refill_failures,
        error: result.error.clone(),
    }
}

/// Build the report for a capture session.
///
/// `labels[i]` names slot `i + 1`; slots without a label are shown by
/// number.
pub fn aggregate(
    results: &[CaptureResult],
    labels: &[String],
    power_unit: &str,
    metadata: ReportMetadata,
) -> Report {
    let slots = results
        .iter()
        .map(|result| {
            let label = result
                .slot
                .checked_sub(1)
                .and_then(|i| labels.get(i))
                .map(String::as_str);
            aggregate_slot(result, label, power_unit)
        })
        .collect();

    Report { metadata, slots }
}
