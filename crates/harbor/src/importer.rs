//! Project import: sync the agent's on-disk session tree into the catalog.
//!
//! Only encoded project directories with strictly more than three session
//! files are imported. The real working directory is recovered from the
//! `cwd` fields inside the session records; the dash-decoded directory name
//! is the fallback of last resort.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harbor_protocol::LogRecord;
use serde::Serialize;

use crate::catalog::{ProjectRepository, SessionRepository};
use crate::config::HarborConfig;
use crate::sessionlog;

/// A directory qualifies with strictly more than this many `.jsonl` files.
const IMPORT_THRESHOLD: usize = 3;

/// Minimum share of occurrences for the most-recent `cwd` to win.
const RECENT_CWD_MIN_SHARE: f64 = 0.25;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub projects_imported: usize,
    pub sessions_upserted: usize,
    pub sessions_deleted: usize,
}

/// Scan `~/.{agent}/projects` and reconcile every qualifying project.
///
/// Postcondition per project: the catalog's session set equals the set of
/// `.jsonl` files on disk, with metadata freshly derived from each file.
pub async fn sync_agent_tree(
    config: &HarborConfig,
    projects: &ProjectRepository,
    sessions: &SessionRepository,
    user_id: &str,
) -> Result<SyncOutcome> {
    let root = sessionlog::projects_root(&config.agent_home(), &config.agent.name);
    let mut outcome = SyncOutcome::default();

    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(root = %root.display(), "no agent session tree to import");
            return Ok(outcome);
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("reading agent session tree {}", root.display()));
        }
    };

    for entry in entries {
        let entry = entry.context("reading session tree entry")?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let files = session_files(&dir)?;
        if files.len() <= IMPORT_THRESHOLD {
            tracing::debug!(
                dir = %dir.display(),
                files = files.len(),
                "skipping project below import threshold"
            );
            continue;
        }

        let encoded = entry.file_name().to_string_lossy().into_owned();
        let project_path = recover_project_path(&files, &encoded);
        let name = project_name(&project_path);
        let project = projects.upsert_by_path(&name, &project_path).await?;
        outcome.projects_imported += 1;

        let (upserted, deleted) =
            sync_project_sessions(sessions, &project.id, user_id, &files).await?;
        outcome.sessions_upserted += upserted;
        outcome.sessions_deleted += deleted;

        tracing::info!(
            project = %project_path,
            sessions = upserted,
            deleted,
            "synced project"
        );
    }

    Ok(outcome)
}

/// Reconcile one project's sessions: upsert every file on disk, then sweep
/// catalog rows with no backing file.
async fn sync_project_sessions(
    sessions: &SessionRepository,
    project_id: &str,
    user_id: &str,
    files: &[PathBuf],
) -> Result<(usize, usize)> {
    let mut on_disk = HashSet::new();
    let mut upserted = 0;

    for file in files {
        let Some(session_id) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let metadata = sessionlog::reconcile_file(file)?;
        sessions
            .upsert(session_id, project_id, user_id, &metadata)
            .await?;
        on_disk.insert(session_id.to_string());
        upserted += 1;
    }

    let orphans: Vec<String> = sessions
        .ids_for_project(project_id)
        .await?
        .into_iter()
        .filter(|id| !on_disk.contains(id))
        .collect();
    let deleted = sessions.delete_many(&orphans).await? as usize;

    Ok((upserted, deleted))
}

fn session_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading project dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    files.sort();
    Ok(files)
}

/// Recover the project's working directory from `cwd` fields in the session
/// records.
fn recover_project_path(files: &[PathBuf], encoded: &str) -> String {
    let mut observations: Vec<(String, Option<i64>)> = Vec::new();
    for file in files {
        let Ok(contents) = std::fs::read_to_string(file) else {
            continue;
        };
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<LogRecord>(line) else {
                continue;
            };
            if let Some(cwd) = record.cwd.clone() {
                let ts = record.timestamp_millis();
                observations.push((cwd, ts));
            }
        }
    }

    pick_dominant_cwd(&observations)
        .unwrap_or_else(|| sessionlog::decode_project_path(encoded))
}

/// Dominance rule: a single distinct `cwd` wins outright; otherwise prefer
/// the one with the most recent timestamp if it accounts for at least a
/// quarter of the occurrences, else fall back to the most frequent.
fn pick_dominant_cwd(observations: &[(String, Option<i64>)]) -> Option<String> {
    if observations.is_empty() {
        return None;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (cwd, _) in observations {
        *counts.entry(cwd.as_str()).or_default() += 1;
    }

    if counts.len() == 1 {
        return Some(observations[0].0.clone());
    }

    let total = observations.len();
    let most_recent = observations
        .iter()
        .filter_map(|(cwd, ts)| ts.map(|t| (cwd, t)))
        .max_by_key(|(_, t)| *t)
        .map(|(cwd, _)| cwd.as_str());

    if let Some(recent) = most_recent {
        let share = counts.get(recent).copied().unwrap_or(0) as f64 / total as f64;
        if share >= RECENT_CWD_MIN_SHARE {
            return Some(recent.to_string());
        }
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(cwd, _)| cwd.to_string())
}

fn project_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
