//! Finished runs saved as pretty JSON, one file per run

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cycle::CycleRun;
use super::transcript::Turn;
use crate::session::Bindings;

/// A saved run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id (UUID v7, so ids sort by start time)
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub task: String,
    pub model: String,
    pub workspace: PathBuf,
    pub transcript: Vec<Turn>,
    /// Delta from the last execution
    pub bindings: Bindings,
    pub report_sections: Vec<String>,
    pub steps: usize,
    /// Whether the run reached a final answer
    pub complete: bool,
    /// Why the run stopped early
    pub error: Option<String>,
}

impl RunRecord {
    /// Snapshot `run`; `error` is the failure that ended it, if any
    pub fn from_run(run: &CycleRun, model: impl Into<String>, error: Option<String>) -> Self {
        Self {
            id: run.run_id.to_string(),
            created_at: run.started_at,
            updated_at: Utc::now(),
            task: run.state.task.clone(),
            model: model.into(),
            workspace: run.session_key.workspace.clone(),
            transcript: run.state.transcript.clone(),
            bindings: run.state.bindings.clone(),
            report_sections: run.state.report_sections.clone(),
            steps: run.state.steps,
            complete: error.is_none(),
            error,
        }
    }

    /// Report sections joined as markdown
    pub fn report_markdown(&self) -> String {
        let mut report = format!("# {}\n", self.task.trim());
        for section in &self.report_sections {
            report.push('\n');
            report.push_str(section.trim());
            report.push('\n');
        }
        report
    }
}

/// Summary of a run for listing
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub steps: usize,
    pub complete: bool,
}

pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// `~/.codeact/runs`, or `.codeact/runs` when there is no home directory
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codeact")
            .join("runs")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save(&self, record: &RunRecord) -> io::Result<PathBuf> {
        let path = self.record_path(&record.id)?;
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(&self, id: &str) -> io::Result<RunRecord> {
        read_record(&self.record_path(id)?)
    }

    /// All readable records, newest first
    pub fn list(&self) -> io::Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(record) = read_record(&path) {
                    runs.push(RunSummary {
                        id: record.id,
                        task: truncate(&record.task, 50),
                        created_at: record.created_at,
                        steps: record.steps,
                        complete: record.complete,
                    });
                }
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(runs)
    }

    pub fn delete(&self, id: &str) -> io::Result<()> {
        std::fs::remove_file(self.record_path(id)?)
    }

    fn record_path(&self, id: &str) -> io::Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid run id {:?}", id),
            ));
        }
        Ok(self.base_dir.join(format!("{}.json", id)))
    }
}

fn read_record(path: &Path) -> io::Result<RunRecord> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Truncate to `max_chars` characters, ending with "..." when shortened
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BindingValue;
    use chrono::Duration;

    fn record(id: &str, task: &str, created_at: DateTime<Utc>) -> RunRecord {
        let mut bindings = Bindings::new();
        bindings.insert("total", BindingValue::json(42));
        RunRecord {
            id: id.to_string(),
            created_at,
            updated_at: created_at,
            task: task.to_string(),
            model: "ollama:qwen3".to_string(),
            workspace: PathBuf::from("/tmp/ws/anonymous_default"),
            transcript: vec![Turn::human(task), Turn::agent("The total is 42.")],
            bindings,
            report_sections: vec!["The total is 42.".to_string()],
            steps: 1,
            complete: true,
            error: None,
        }
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path()).unwrap();
        let saved = record("run-1", "Sum the column", Utc::now());

        let path = store.save(&saved).unwrap();
        assert!(path.ends_with("run-1.json"));
        assert_eq!(store.load("run-1").unwrap(), saved);
    }

    #[test]
    fn test_list_newest_first_with_truncated_task() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path()).unwrap();
        let now = Utc::now();
        let long_task = "Analyse every CSV file in the data directory and summarise the results";

        store.save(&record("older", "short task", now - Duration::minutes(5))).unwrap();
        store.save(&record("newer", long_task, now)).unwrap();
        std::fs::write(tmp.path().join("garbage.json"), "not json").unwrap();

        let runs = store.list().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "newer");
        assert_eq!(runs[0].task.chars().count(), 50);
        assert!(runs[0].task.ends_with("..."));
        assert_eq!(runs[1].task, "short task");
    }

    #[test]
    fn test_delete_and_invalid_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::new(tmp.path()).unwrap();
        store.save(&record("gone", "t", Utc::now())).unwrap();

        store.delete("gone").unwrap();
        assert!(store.load("gone").is_err());
        assert_eq!(
            store.load("../etc/passwd").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_report_markdown() {
        let report = record("r", "Sum the column", Utc::now()).report_markdown();
        assert_eq!(report, "# Sum the column\n\nThe total is 42.\n");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }
}
