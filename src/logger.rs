use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::workflow::store::{CorrelationEntry, Stage, StoreHooks};
use scanhost_proto::wire::CorrelationId;

/// Install the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"`); `RUST_LOG`
///   overrides it when set.
/// - Human-readable logs go to stderr and to a daily-rolling text file
///   under `<root>/logs/`. Stdout stays free for prompts.
/// - Workflow audit events (target `"workflow"`) additionally land in a
///   daily-rolling JSON file, one object per line.
pub fn init_tracing(root: &Path, log_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_dir = root.join("logs");

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "warden.log");
    let txt_layer = fmt::Layer::default().with_writer(txt_appender).with_ansi(false);

    let json_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "workflow.json");
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("workflow=info"));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(txt_layer)
        .with(json_layer)
        .init();

    Ok(())
}

/// Store hooks that write one audit line per workflow transition, so the
/// JSON log replays every file's path through the system.
#[derive(Debug, Default, Clone)]
pub struct AuditHooks;

impl StoreHooks for AuditHooks {
    fn entry_created(&self, id: &CorrelationId, entry: &CorrelationEntry) {
        info!(
            target: "workflow",
            id = %id,
            file = %entry.file.filename,
            stage = ?entry.stage,
            "workflow started"
        );
    }

    fn stage_changed(&self, id: &CorrelationId, from: Stage, to: Stage) {
        info!(
            target: "workflow",
            id = %id,
            from = ?from,
            to = ?to,
            "workflow advanced"
        );
    }

    fn entry_resolved(&self, id: &CorrelationId, entry: &CorrelationEntry) {
        info!(
            target: "workflow",
            id = %id,
            file = %entry.file.filename,
            stage = ?entry.stage,
            verdict = ?entry.verdict,
            open_for_ms = open_for_ms(entry),
            "workflow resolved"
        );
    }
}

/// How long the workflow was tracked, from first sighting to resolution.
fn open_for_ms(entry: &CorrelationEntry) -> i64 {
    Utc::now()
        .signed_duration_since(entry.created_at)
        .num_milliseconds()
}
