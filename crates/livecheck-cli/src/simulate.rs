//! `livecheck simulate`: run a recorded trace through the classifier and
//! state machine offline, one record per sampling interval.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

use livecheck_core::trace::{self, TraceRecord};
use livecheck_core::{
    Classifier, LivenessEvent, LivenessStateMachine, MachineConfig, Protocol, SessionStatus,
    Thresholds,
};

pub struct SimulateOptions {
    pub protocol: Protocol,
    pub interval: Duration,
    pub debounce_samples: u32,
    pub step_timeout: Duration,
}

/// Outcome of a simulated run.
pub struct SimulationReport {
    pub events: Vec<(usize, LivenessEvent)>,
    pub status: SessionStatus,
    pub samples_consumed: usize,
}

/// Drive the state machine over `records` with synthetic timestamps.
/// Stops at the first terminal event or when the trace runs out.
pub fn run_records(records: &[TraceRecord], opts: &SimulateOptions) -> Result<SimulationReport> {
    let classifier = Classifier::new(opts.protocol, Thresholds::default());
    let mut machine = LivenessStateMachine::new(MachineConfig {
        debounce_samples: opts.debounce_samples,
        max_step_duration: opts.step_timeout,
    });

    let t0 = Instant::now();
    let mut events = Vec::new();
    events.push((0, machine.start(opts.protocol.sequence(), t0)?));

    let mut consumed = 0;
    for (i, record) in records.iter().enumerate() {
        let at = sample_time(t0, opts.interval, i + 1).with_context(|| {
            format!(
                "sample {} at {} ms/sample is out of range",
                i + 1,
                opts.interval.as_millis()
            )
        })?;
        consumed = i + 1;
        let event = match record.as_detection() {
            Ok(face) => machine.observe(&classifier.observe(face, at)),
            Err(reason) => machine.detection_unavailable(reason, at),
        };
        if let Some(event) = event {
            let ends = event.ends_session();
            events.push((consumed, event));
            if ends {
                break;
            }
        }
    }

    Ok(SimulationReport {
        events,
        status: machine.status(),
        samples_consumed: consumed,
    })
}

/// Timestamp of the `n`th sample after `t0`, if representable.
fn sample_time(t0: Instant, interval: Duration, n: usize) -> Option<Instant> {
    let n = u32::try_from(n).ok()?;
    t0.checked_add(interval.checked_mul(n)?)
}

pub fn run(path: &Path, opts: SimulateOptions) -> Result<()> {
    let records = trace::load_trace(path)
        .with_context(|| format!("failed to load trace {}", path.display()))?;

    println!(
        "Replaying {} record(s) from {} as '{}' at {} ms/sample",
        records.len(),
        path.display(),
        opts.protocol,
        opts.interval.as_millis()
    );

    let report = run_records(&records, &opts)?;
    for (sample, event) in &report.events {
        println!("  [{sample:>4}] {}", describe(event));
    }

    println!();
    println!(
        "Result: {} after {} sample(s)",
        report.status, report.samples_consumed
    );
    if report.status == SessionStatus::InProgress {
        println!("Trace ended before the challenge finished.");
    }
    Ok(())
}

fn describe(event: &LivenessEvent) -> String {
    match event {
        LivenessEvent::GuidanceChanged { step, index, .. } => {
            format!("guidance: step {} -> {}", index + 1, step)
        }
        LivenessEvent::ChallengeCompleted { .. } => "challenge completed".to_string(),
        LivenessEvent::SessionReset { reason, .. } => format!("session reset ({})", reason.as_str()),
        LivenessEvent::DetectionUnavailable { reason, .. } => {
            format!("detection unavailable: {reason}")
        }
    }
}
