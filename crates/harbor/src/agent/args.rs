//! Agent CLI argument construction.

use std::path::PathBuf;

/// Everything that shapes one agent CLI invocation.
#[derive(Debug, Clone)]
pub struct TurnCommand {
    pub prompt: String,
    /// Session to address. Combined with `resume` this picks between
    /// `--resume` and `--session-id`.
    pub session_id: Option<String>,
    pub resume: bool,
    /// `--continue`; only honored when no session id is given.
    pub continue_conversation: bool,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub dangerously_skip_permissions: bool,
    /// Stream JSONL records on stdout. On by default; the CLI requires
    /// `--verbose` alongside it.
    pub stream_json: bool,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Image files already written to disk, in the order received.
    pub images: Vec<PathBuf>,
}

impl TurnCommand {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
            resume: false,
            continue_conversation: false,
            model: None,
            permission_mode: None,
            dangerously_skip_permissions: false,
            stream_json: true,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Build the argv, prompt last.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec!["--print".to_string()];

        // --resume / --session-id / --continue are mutually exclusive.
        if let Some(id) = &self.session_id {
            if self.resume {
                args.push("--resume".to_string());
            } else {
                args.push("--session-id".to_string());
            }
            args.push(id.clone());
        } else if self.continue_conversation {
            args.push("--continue".to_string());
        }

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(mode) = &self.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        } else if self.dangerously_skip_permissions {
            args.push("--permission-mode".to_string());
            args.push("acceptEdits".to_string());
        }

        if self.stream_json {
            args.push("--output-format".to_string());
            args.push("stream-json".to_string());
            args.push("--verbose".to_string());
        }

        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(self.disallowed_tools.join(","));
        }

        for image in &self.images {
            args.push("-i".to_string());
            args.push(image.to_string_lossy().into_owned());
        }

        args.push(self.prompt.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation() {
        let args = TurnCommand::new("hello").build_args();
        assert_eq!(
            args,
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "hello"
            ]
        );
    }

    #[test]
    fn session_id_without_resume() {
        let mut cmd = TurnCommand::new("hi");
        cmd.session_id = Some("abc".to_string());
        let args = cmd.build_args();
        assert!(args.windows(2).any(|w| w == ["--session-id", "abc"]));
        assert!(!args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"--continue".to_string()));
    }

    #[test]
    fn resume_wins_over_session_id_flag() {
        let mut cmd = TurnCommand::new("hi");
        cmd.session_id = Some("abc".to_string());
        cmd.resume = true;
        let args = cmd.build_args();
        assert!(args.windows(2).any(|w| w == ["--resume", "abc"]));
        assert!(!args.contains(&"--session-id".to_string()));
    }

    #[test]
    fn continue_only_without_session_id() {
        let mut cmd = TurnCommand::new("hi");
        cmd.continue_conversation = true;
        assert!(cmd.build_args().contains(&"--continue".to_string()));

        cmd.session_id = Some("abc".to_string());
        assert!(!cmd.build_args().contains(&"--continue".to_string()));
    }

    #[test]
    fn skip_permissions_maps_to_accept_edits() {
        let mut cmd = TurnCommand::new("hi");
        cmd.dangerously_skip_permissions = true;
        let args = cmd.build_args();
        assert!(args
            .windows(2)
            .any(|w| w == ["--permission-mode", "acceptEdits"]));
    }

    #[test]
    fn explicit_permission_mode_wins() {
        let mut cmd = TurnCommand::new("hi");
        cmd.dangerously_skip_permissions = true;
        cmd.permission_mode = Some("plan".to_string());
        let args = cmd.build_args();
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "plan"]));
        assert!(!args.contains(&"acceptEdits".to_string()));
    }

    #[test]
    fn tool_lists_are_comma_joined() {
        let mut cmd = TurnCommand::new("hi");
        cmd.allowed_tools = vec!["Bash".to_string(), "Read".to_string()];
        cmd.disallowed_tools = vec!["WebFetch".to_string()];
        let args = cmd.build_args();
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Bash,Read"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--disallowedTools", "WebFetch"]));
    }

    #[test]
    fn images_in_order_and_prompt_last() {
        let mut cmd = TurnCommand::new("describe these");
        cmd.images = vec![PathBuf::from("/tmp/a.png"), PathBuf::from("/tmp/b.jpg")];
        let args = cmd.build_args();
        let first = args.iter().position(|a| a == "/tmp/a.png").unwrap();
        let second = args.iter().position(|a| a == "/tmp/b.jpg").unwrap();
        assert!(first < second);
        assert_eq!(args[first - 1], "-i");
        assert_eq!(args.last().unwrap(), "describe these");
    }
}
