//! Best-effort experiment tracking.
//!
//! Scalar metrics go to `metrics.jsonl` in the run directory and, when a
//! remote endpoint is configured, to that endpoint as JSON. The tracker is
//! off the correctness path: every failure is downgraded to a warning and
//! training continues.

use log::warn;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
#[cfg(feature = "tracker-http")]
use std::time::Duration;

pub struct ExperimentTracker {
    run_name: String,
    file: Option<File>,
    #[cfg(feature = "tracker-http")]
    remote: Option<(reqwest::blocking::Client, String)>,
}

impl ExperimentTracker {
    /// Tracker that records nothing; used on non-leader ranks and when the
    /// `--tracker` flag is absent.
    pub fn disabled() -> Self {
        Self {
            run_name: String::new(),
            file: None,
            #[cfg(feature = "tracker-http")]
            remote: None,
        }
    }

    /// Open the run's metric stream and announce the run configuration.
    pub fn init(
        output_dir: &Path,
        project: &str,
        run_name: &str,
        config_snapshot: serde_json::Value,
        endpoint: Option<&str>,
    ) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_dir.join("metrics.jsonl"))
            .map_err(|e| warn!("experiment tracker: cannot open metrics.jsonl: {e}"))
            .ok();

        #[cfg(feature = "tracker-http")]
        let remote = endpoint.and_then(|url| {
            match reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
            {
                Ok(client) => Some((client, url.to_string())),
                Err(e) => {
                    warn!("experiment tracker: cannot build http client: {e}");
                    None
                }
            }
        });
        #[cfg(not(feature = "tracker-http"))]
        if endpoint.is_some() {
            warn!("experiment tracker: built without `tracker-http`, remote endpoint ignored");
        }

        let mut tracker = Self {
            run_name: run_name.to_string(),
            file,
            #[cfg(feature = "tracker-http")]
            remote,
        };
        tracker.emit(json!({
            "event": "init",
            "project": project,
            "run": run_name,
            "config": config_snapshot,
        }));
        tracker
    }

    /// Record scalar metrics for one step.
    pub fn log(&mut self, metrics: &[(&str, f64)], step: usize) {
        if self.file.is_none() {
            #[cfg(feature = "tracker-http")]
            if self.remote.is_none() {
                return;
            }
            #[cfg(not(feature = "tracker-http"))]
            return;
        }

        let mut record = serde_json::Map::new();
        record.insert("run".into(), json!(self.run_name));
        record.insert("step".into(), json!(step));
        for (name, value) in metrics {
            record.insert((*name).to_string(), json!(value));
        }
        self.emit(serde_json::Value::Object(record));
    }

    fn emit(&mut self, record: serde_json::Value) {
        if let Some(file) = &mut self.file {
            if let Err(e) = writeln!(file, "{record}") {
                warn!("experiment tracker: metric write failed: {e}");
            }
        }

        #[cfg(feature = "tracker-http")]
        if let Some((client, url)) = &self.remote {
            if let Err(e) = client.post(url).json(&record).send() {
                warn!("experiment tracker: remote log failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = ExperimentTracker::init(
            dir.path(),
            "vton",
            "run-1",
            json!({"lr": 3e-5}),
            None,
        );
        tracker.log(&[("train_loss", 0.5), ("lr", 3e-5)], 1);
        tracker.log(&[("train_loss", 0.25)], 2);

        let content = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let init: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(init["event"], "init");

        let second: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(second["step"], 2);
        assert_eq!(second["train_loss"], 0.25);
    }

    #[test]
    fn test_disabled_tracker_is_silent() {
        let mut tracker = ExperimentTracker::disabled();
        // Must not panic or write anywhere.
        tracker.log(&[("train_loss", 1.0)], 1);
    }
}
