use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use cutout_core::{TelemetryEvent, TelemetrySink};
use reqwest::blocking::Client;
use serde::Serialize;

pub const SINK_ENV: &str = "CUTOUT_TELEMETRY_SINK";
pub const FILE_ENV: &str = "CUTOUT_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "CUTOUT_TELEMETRY_ENDPOINT";

pub fn sink_from_env() -> Option<Arc<dyn TelemetrySink>> {
    sink_from_vars(|key| std::env::var(key).ok())
}

/// Same selection as [`sink_from_env`] over an arbitrary variable lookup.
pub fn sink_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Option<Arc<dyn TelemetrySink>> {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mode = non_empty(SINK_ENV)?;
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Arc::new(StdoutSink)),
        "tracing" | "log" => Some(Arc::new(TracingSink)),
        "file" => {
            let path = non_empty(FILE_ENV)?;
            Some(Arc::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = non_empty(ENDPOINT_ENV)?;
            Some(Arc::new(HttpSink::new(endpoint)))
        }
        other => {
            tracing::warn!(sink = other, "unknown telemetry sink, telemetry disabled");
            None
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    variant: Option<String>,
    backend: Option<String>,
    duration_ms: Option<u64>,
    detail: Option<String>,
    timestamp_ms: u64,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            variant: event.variant.map(|v| v.label().to_string()),
            backend: event.backend.clone(),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(&TelemetryEnvelope::from(&event)) {
            println!("{}", line);
        }
    }
}

/// Forwards events into the `tracing` pipeline under the `telemetry` target.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        tracing::info!(
            target: "telemetry",
            event = ?event.event_type,
            variant = event.variant.map(|v| v.label()),
            backend = event.backend.as_deref(),
            duration_ms = event.duration_ms,
            detail = event.detail.as_deref(),
            "telemetry event"
        );
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(&TelemetryEnvelope::from(&event)) {
            if let Err(err) = self.write_line(&line) {
                tracing::debug!(error = %err, path = %self.path.display(), "dropping telemetry event");
            }
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        if let Err(err) = self.client.post(&self.endpoint).json(&payload).send() {
            tracing::debug!(error = %err, endpoint = %self.endpoint, "telemetry post failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutout_core::{TelemetryEventType, Variant};

    fn event() -> TelemetryEvent {
        TelemetryEvent {
            event_type: TelemetryEventType::PipelineSuccess,
            variant: Some(Variant::Fast),
            backend: Some("rmbg-1.4/cpu".to_string()),
            duration_ms: Some(42),
            detail: None,
        }
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("events.jsonl");
        let sink = FileSink::new(path.clone());
        sink.emit(event());
        sink.emit(event());

        let contents = std::fs::read_to_string(&path).expect("telemetry file");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(parsed["eventType"], "PipelineSuccess");
        assert_eq!(parsed["variant"], "fast");
        assert_eq!(parsed["backend"], "rmbg-1.4/cpu");
        assert_eq!(parsed["durationMs"], 42);
    }

    #[test]
    fn sink_selection_requires_its_settings() {
        let vars = |pairs: &'static [(&'static str, &'static str)]| {
            move |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
        };
        assert!(sink_from_vars(vars(&[])).is_none());
        assert!(sink_from_vars(vars(&[(SINK_ENV, "stdout")])).is_some());
        assert!(sink_from_vars(vars(&[(SINK_ENV, "file")])).is_none());
        assert!(sink_from_vars(vars(&[(SINK_ENV, "file"), (FILE_ENV, "/tmp/t.jsonl")])).is_some());
        assert!(sink_from_vars(vars(&[(SINK_ENV, "http"), (ENDPOINT_ENV, "  ")])).is_none());
        assert!(sink_from_vars(vars(&[(SINK_ENV, "carrier-pigeon")])).is_none());
    }
}
