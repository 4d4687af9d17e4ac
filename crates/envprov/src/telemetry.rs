//! Logging for provisioning runs.
//!
//! Everything is written to stderr; stdout belongs to reports, plans and the
//! test command. Events inside a run carry the run's span fields (`run_id`,
//! `job`, `python`), and events emitted while an external command runs also
//! carry its `step`.

use crate::spec::InterpreterVersion;
use tracing::{Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber once per process.
///
/// `level` applies unless `RUST_LOG` says otherwise. `json` switches to one
/// JSON object per line with the current span's fields flattened in. A
/// subscriber installed earlier (e.g. by a test harness) is left in place.
pub fn init_tracing(json: bool, level: Level) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

/// Span covering one provisioning run.
pub fn run_span(run_id: &str, job: Option<&str>, python: InterpreterVersion) -> Span {
    tracing::info_span!(
        "provision",
        run_id = %run_id,
        job = job.unwrap_or("-"),
        python = %python,
    )
}

/// Span covering one external command.
pub fn step_span(step: &str) -> Span {
    tracing::debug_span!("step", step = %step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
        tracing::info!("still logging");
    }

    #[test]
    fn test_spans_enter_cleanly() {
        init_tracing(false, Level::DEBUG);
        let run = run_span("run-1", Some("py27"), InterpreterVersion::new(2, 7));
        let _run = run.enter();
        let step = step_span("install_base");
        let _step = step.enter();
        tracing::debug!("inside step");
    }
}
