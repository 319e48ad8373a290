use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chat_gateway_error::GatewayError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::store::SessionStore;

/// Transcripts live in a foreign layout the gateway only reads:
/// `<claude_root>/projects/<slug>/<session_id>.jsonl`.
#[derive(Debug, Clone)]
pub struct TranscriptDir {
    root: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapStats {
    pub sessions: usize,
    pub agent_runs: usize,
}

#[derive(Debug)]
struct TranscriptMetadata {
    session_id: String,
    title: String,
    cwd: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    parent_session_id: Option<String>,
    is_agent_run: bool,
}

fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

impl TranscriptDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    /// Slug for a working directory: the first component when the cwd
    /// already lives under the projects dir, else the cwd with every
    /// non-alphanumeric byte replaced by `-`.
    fn project_slug(&self, cwd: &str) -> String {
        let projects = self.projects_dir();
        if let Ok(relative) = Path::new(cwd).strip_prefix(&projects) {
            if let Some(first) = relative.components().next() {
                return first.as_os_str().to_string_lossy().into_owned();
            }
        }
        cwd.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    fn session_file(&self, cwd: &str, session_id: &str) -> PathBuf {
        self.projects_dir()
            .join(self.project_slug(cwd))
            .join(format!("{session_id}.jsonl"))
    }

    /// Parses every non-empty transcript line as JSON, skipping junk.
    pub fn load_messages(&self, cwd: &str, session_id: &str) -> Vec<Value> {
        let path = self.session_file(cwd, session_id);
        let Ok(file) = fs::File::open(&path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                serde_json::from_str::<Value>(line).ok()
            })
            .collect()
    }

    pub fn count_messages(&self, cwd: &str, session_id: &str) -> usize {
        let path = self.session_file(cwd, session_id);
        let Ok(file) = fs::File::open(&path) else {
            return 0;
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .count()
    }

    /// Walks `projects/*/*.jsonl` and upserts discovered metadata into the
    /// store. Agent-run transcripts (`agent-*.jsonl`) land in the agent
    /// sessions table; their parent linkage is kept only when the parent is
    /// already a known session.
    pub fn bootstrap(&self, store: &SessionStore) -> Result<BootstrapStats, GatewayError> {
        if !self.root.exists() {
            return Err(GatewayError::invalid_request(format!(
                "claude directory does not exist: {}",
                self.root.display()
            )));
        }

        let mut primary = Vec::new();
        let mut agent_runs = Vec::new();
        for metadata in self.discover() {
            if metadata.is_agent_run {
                agent_runs.push(metadata);
            } else {
                primary.push(metadata);
            }
        }

        let mut known_ids = store.session_ids()?;
        let mut stats = BootstrapStats::default();

        for metadata in primary {
            store.upsert_session(
                &metadata.session_id,
                &metadata.title,
                &metadata.cwd,
                metadata.created_at,
                metadata.updated_at,
            )?;
            known_ids.insert(metadata.session_id);
            stats.sessions += 1;
        }

        for metadata in agent_runs {
            let parent = metadata
                .parent_session_id
                .as_deref()
                .filter(|parent| known_ids.contains(*parent));
            store.upsert_agent_session(
                &metadata.session_id,
                parent,
                &metadata.title,
                &metadata.cwd,
                metadata.created_at,
                metadata.updated_at,
            )?;
            stats.agent_runs += 1;
        }

        tracing::info!(
            sessions = stats.sessions,
            agent_runs = stats.agent_runs,
            root = %self.root.display(),
            "transcript bootstrap complete"
        );
        Ok(stats)
    }

    fn discover(&self) -> Vec<TranscriptMetadata> {
        let projects = self.projects_dir();
        let Ok(entries) = fs::read_dir(&projects) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for project in entries.flatten() {
            if !project.path().is_dir() {
                continue;
            }
            let Ok(files) = fs::read_dir(project.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                    continue;
                }
                if let Some(metadata) = extract_metadata(&path) {
                    found.push(metadata);
                }
            }
        }
        found
    }
}

fn is_agent_run_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("agent-") && name.ends_with(".jsonl"))
        .unwrap_or(false)
}

/// First transcript line carries the metadata; unusable files yield none.
fn extract_metadata(path: &Path) -> Option<TranscriptMetadata> {
    let file = fs::File::open(path).ok()?;
    let first_line = BufReader::new(file).lines().next()?.ok()?;
    let data: Value = serde_json::from_str(&first_line).ok()?;

    let session_id = data
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(ToOwned::to_owned)
        })?;

    let cwd = data
        .get("cwd")
        .or_else(|| data.get("project_path"))
        .and_then(Value::as_str)
        .filter(|cwd| !cwd.is_empty())?
        .to_owned();

    let title = data
        .get("title")
        .and_then(Value::as_str)
        .or_else(|| {
            data.get("message")
                .and_then(|message| message.get("text"))
                .and_then(Value::as_str)
        })
        .filter(|title| !title.is_empty())
        .unwrap_or(&session_id)
        .to_owned();

    Some(TranscriptMetadata {
        created_at: parse_timestamp(data.get("created_at").and_then(Value::as_str)),
        updated_at: parse_timestamp(data.get("updated_at").and_then(Value::as_str)),
        parent_session_id: data
            .get("parent_session_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        is_agent_run: is_agent_run_file(path),
        session_id,
        title,
        cwd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_transcript(dir: &Path, slug: &str, name: &str, lines: &[&str]) {
        let project = dir.join("projects").join(slug);
        fs::create_dir_all(&project).expect("mkdir");
        let mut file = fs::File::create(project.join(name)).expect("create");
        for line in lines {
            writeln!(file, "{line}").expect("write");
        }
    }

    #[test]
    fn slug_replaces_non_alphanumerics() {
        let dir = TranscriptDir::new("/home/u/.claude");
        assert_eq!(dir.project_slug("/tmp/my proj"), "-tmp-my-proj");
    }

    #[test]
    fn slug_uses_first_component_under_projects_dir() {
        let dir = TranscriptDir::new("/home/u/.claude");
        assert_eq!(
            dir.project_slug("/home/u/.claude/projects/alpha/nested"),
            "alpha"
        );
    }

    #[test]
    fn load_messages_skips_junk_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = TranscriptDir::new(tmp.path());
        write_transcript(
            tmp.path(),
            "-tmp-proj",
            "s1.jsonl",
            &[
                r#"{"session_id":"s1","cwd":"/tmp/proj","type":"user"}"#,
                "",
                "not json",
                r#"{"type":"assistant"}"#,
            ],
        );

        let messages = dir.load_messages("/tmp/proj", "s1");
        assert_eq!(messages.len(), 2);
        assert_eq!(dir.count_messages("/tmp/proj", "s1"), 3);
    }

    #[test]
    fn bootstrap_counts_sessions_and_agent_runs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = TranscriptDir::new(tmp.path());
        write_transcript(
            tmp.path(),
            "projA",
            "s1.jsonl",
            &[r#"{"session_id":"s1","cwd":"/tmp/a","title":"Alpha","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-02T00:00:00Z"}"#],
        );
        write_transcript(
            tmp.path(),
            "projA",
            "agent-run1.jsonl",
            &[r#"{"session_id":"agent-run1","cwd":"/tmp/a","parent_session_id":"s1"}"#],
        );
        write_transcript(tmp.path(), "projA", "broken.jsonl", &["{nope"]);
        write_transcript(
            tmp.path(),
            "projB",
            "no-cwd.jsonl",
            &[r#"{"session_id":"x"}"#],
        );

        let store = SessionStore::in_memory().expect("store");
        let stats = dir.bootstrap(&store).expect("bootstrap");
        assert_eq!(
            stats,
            BootstrapStats {
                sessions: 1,
                agent_runs: 1
            }
        );

        let row = store.get_session("s1").expect("get").expect("row");
        assert_eq!(row.title, "Alpha");
        assert_eq!(row.cwd, "/tmp/a");
    }

    #[test]
    fn bootstrap_rejects_missing_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = TranscriptDir::new(tmp.path().join("missing"));
        let store = SessionStore::in_memory().expect("store");
        let err = dir.bootstrap(&store).expect_err("missing root");
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }
}
