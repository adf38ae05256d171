//! Agent session-log access: path encoding and reconciliation.
//!
//! The agent CLI owns an append-only `.jsonl` file per session under
//! `<home>/.<agent>/projects/<encoded>/`, where `<encoded>` is the project's
//! absolute path with every `/` replaced by `-`. The broker never writes
//! these files; it re-reads them to derive catalog metadata and replay
//! history.

mod reconcile;

pub use reconcile::{reconcile_file, replay_messages};

use std::path::{Path, PathBuf};

/// Encode a project path into its on-disk directory name.
pub fn encode_project_path(path: &str) -> String {
    path.replace('/', "-")
}

/// Invert [`encode_project_path`]. Only exact for paths without dashes.
pub fn decode_project_path(encoded: &str) -> String {
    encoded.replace('-', "/")
}

/// Root of the agent's session tree: `<home>/.<agent>/projects`.
pub fn projects_root(home: &Path, agent_name: &str) -> PathBuf {
    home.join(format!(".{agent_name}")).join("projects")
}

/// Directory holding one project's session files.
pub fn project_dir(home: &Path, agent_name: &str, project_path: &str) -> PathBuf {
    projects_root(home, agent_name).join(encode_project_path(project_path))
}

/// Full path of one session's log file.
pub fn session_file_path(
    home: &Path,
    agent_name: &str,
    project_path: &str,
    session_id: &str,
) -> PathBuf {
    project_dir(home, agent_name, project_path).join(format!("{session_id}.jsonl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_leading_slash_as_leading_dash() {
        assert_eq!(encode_project_path("/home/user/proj"), "-home-user-proj");
    }

    #[test]
    fn decode_inverts_encode() {
        assert_eq!(decode_project_path("-home-user-proj"), "/home/user/proj");
    }

    #[test]
    fn session_file_path_layout() {
        let path = session_file_path(Path::new("/home/u"), "claude", "/work/app", "abc-123");
        assert_eq!(
            path,
            PathBuf::from("/home/u/.claude/projects/-work-app/abc-123.jsonl")
        );
    }

    proptest! {
        /// Round trip holds for any absolute POSIX path without dashes.
        #[test]
        fn encode_round_trips(segments in proptest::collection::vec("[a-z0-9_.]{1,8}", 1..6)) {
            let path = format!("/{}", segments.join("/"));
            prop_assert_eq!(decode_project_path(&encode_project_path(&path)), path);
        }
    }
}
