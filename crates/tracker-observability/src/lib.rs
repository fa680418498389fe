use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "tracker";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Poller,
    PrPoller,
    Layers,
    Stream,
    Completion,
    Dispatcher,
    Cache,
    Engine,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Poller => "poller",
            Component::PrPoller => "pr_poller",
            Component::Layers => "layers",
            Component::Stream => "stream",
            Component::Completion => "completion",
            Component::Dispatcher => "dispatcher",
            Component::Cache => "cache",
            Component::Engine => "engine",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Structured lifecycle event. Unset fields are logged as empty strings so the JSONL schema
/// stays flat.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerEvent<'a> {
    pub event: &'a str,
    pub job_id: Option<&'a str>,
    pub plan_id: Option<&'a str>,
    pub slice: Option<u32>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> TrackerEvent<'a> {
    pub fn new(event: &'a str) -> Self {
        Self {
            event,
            ..Default::default()
        }
    }

    pub fn job(mut self, job_id: &'a str) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn plan(mut self, plan_id: &'a str) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn slice(mut self, slice: u32) -> Self {
        self.slice = Some(slice);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_code(mut self, code: &'a str) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub fn emit_event(level: Level, component: Component, event: TrackerEvent<'_>) {
    let slice = event.slice.map(|s| s.to_string()).unwrap_or_default();
    match level {
        Level::ERROR => tracing::error!(
            target: "tracker.obs",
            component = component.as_str(),
            event = event.event,
            job_id = event.job_id.unwrap_or(""),
            plan_id = event.plan_id.unwrap_or(""),
            slice = slice.as_str(),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "tracker_event"
        ),
        Level::WARN => tracing::warn!(
            target: "tracker.obs",
            component = component.as_str(),
            event = event.event,
            job_id = event.job_id.unwrap_or(""),
            plan_id = event.plan_id.unwrap_or(""),
            slice = slice.as_str(),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "tracker_event"
        ),
        _ => tracing::info!(
            target: "tracker.obs",
            component = component.as_str(),
            event = event.event,
            job_id = event.job_id.unwrap_or(""),
            plan_id = event.plan_id.unwrap_or(""),
            slice = slice.as_str(),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "tracker_event"
        ),
    }
}

/// Installs a console layer plus a daily-rolled JSONL file layer under `logs_dir`.
///
/// The returned guard must be held for as long as file logging should keep flushing.
pub fn init_process_logging(
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        logs_dir: logs_dir.display().to_string(),
        prefix: LOG_PREFIX.to_string(),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", LOG_PREFIX);

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: tracker.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}
