use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use cutout_core::{Notification, NotificationKind, NotificationSink};
use serde::Serialize;

pub const SINK_ENV: &str = "CUTOUT_NOTIFY_SINK";
pub const FILE_ENV: &str = "CUTOUT_NOTIFY_FILE";

pub fn sink_from_env() -> Option<Box<dyn NotificationSink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    sink_for_mode(&mode, std::env::var(FILE_ENV).ok())
}

fn sink_for_mode(mode: &str, file: Option<String>) -> Option<Box<dyn NotificationSink>> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Box::new(StdoutSink)),
        "file" => {
            let path = file.filter(|v| !v.trim().is_empty())?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "log" => Some(Box::new(TracingSink)),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationEnvelope<'a> {
    kind: NotificationKind,
    title: &'a str,
    description: &'a str,
    timestamp_ms: u64,
}

impl<'a> From<&'a Notification> for NotificationEnvelope<'a> {
    fn from(notification: &'a Notification) -> Self {
        Self {
            kind: notification.kind,
            title: &notification.title,
            description: &notification.description,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

pub struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn notify(&self, notification: Notification) {
        if let Ok(line) = serde_json::to_string(&NotificationEnvelope::from(&notification)) {
            println!("{}", line);
        }
    }
}

/// Appends one JSON object per notification.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating notification log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening notification file")?;
        writeln!(file, "{}", line).context("writing notification line")?;
        Ok(())
    }
}

impl NotificationSink for FileSink {
    fn notify(&self, notification: Notification) {
        if let Ok(line) = serde_json::to_string(&NotificationEnvelope::from(&notification)) {
            if let Err(err) = self.write_line(&line) {
                tracing::warn!(error = %format!("{err:#}"), path = %self.path.display(), "dropped notification");
            }
        }
    }
}

/// Forwards notifications to the `tracing` subscriber.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Error => {
                tracing::error!(title = %notification.title, "{}", notification.description)
            }
            NotificationKind::Success | NotificationKind::Info => {
                tracing::info!(title = %notification.title, "{}", notification.description)
            }
        }
    }
}

/// Keeps every notification in memory; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.notifications().into_iter().map(|n| n.title).collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("toasts.jsonl");
        let sink = FileSink::new(path.clone());
        sink.notify(Notification::success("Deleted", "Image has been removed"));
        sink.notify(Notification::error("Error", "Failed to process image"));

        let text = std::fs::read_to_string(&path).expect("log file exists");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("each line is json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "success");
        assert_eq!(lines[0]["title"], "Deleted");
        assert_eq!(lines[1]["description"], "Failed to process image");
        assert!(lines[1]["timestampMs"].as_u64().is_some());
    }

    #[test]
    fn recording_sink_shares_log_between_clones() {
        let sink = RecordingSink::new();
        let handle = sink.clone();
        handle.notify(Notification::info("Info", "hello"));
        assert_eq!(sink.titles(), vec!["Info".to_string()]);
        sink.clear();
        assert!(handle.notifications().is_empty());
    }

    #[test]
    fn mode_selection() {
        assert!(sink_for_mode("stdout", None).is_some());
        assert!(sink_for_mode(" LOG ", None).is_some());
        assert!(sink_for_mode("file", None).is_none());
        assert!(sink_for_mode("file", Some("  ".to_string())).is_none());
        assert!(sink_for_mode("file", Some("/tmp/cutout.jsonl".to_string())).is_some());
        assert!(sink_for_mode("http", None).is_none());
    }
}
