//! Interactive shell sessions over a pseudo-terminal.
//!
//! Each shell session owns a PTY running the platform shell in the project
//! directory. Output is pumped off a blocking reader thread onto a bounded
//! channel; input and resize go the other way. Killing the child is the only
//! way a session ends early.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};

/// Size of the PTY output channel, in chunks.
const OUTPUT_BUFFER_CHUNKS: usize = 256;
/// Size of the PTY input channel.
const INPUT_BUFFER_CHUNKS: usize = 128;

/// A live shell session.
pub struct ShellSession {
    /// Broker-minted opaque id.
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Vec<u8>>,
}

/// A freshly spawned shell plus the receiving ends of its streams.
pub struct SpawnedShell {
    pub session: Arc<ShellSession>,
    /// PTY output chunks, in emission order.
    pub output_rx: mpsc::Receiver<Vec<u8>>,
    /// Resolves once with the exit code when the shell terminates.
    pub exit_rx: oneshot::Receiver<i32>,
}

/// Spawn the platform shell in a PTY at `project_path`.
pub fn spawn_shell(
    project_id: &str,
    user_id: &str,
    project_path: &Path,
    cols: u16,
    rows: u16,
) -> Result<SpawnedShell> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("opening pty")?;

    let mut command = platform_shell_command();
    command.cwd(project_path);
    command.env("TERM", "xterm-256color");
    command.env("COLORTERM", "truecolor");

    let mut child = pair
        .slave
        .spawn_command(command)
        .context("spawning shell in pty")?;
    let killer = child.clone_killer();

    // Reader thread: drain the PTY and forward chunks. blocking_send keeps
    // PTY emission order and applies backpressure to the shell.
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_BUFFER_CHUNKS);
    let mut reader = pair
        .master
        .try_clone_reader()
        .context("cloning pty reader")?;
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });

    // Writer task: apply input to the PTY writer on a blocking thread.
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_BUFFER_CHUNKS);
    let writer = pair.master.take_writer().context("taking pty writer")?;
    let writer = Arc::new(StdMutex::new(writer));
    tokio::spawn(async move {
        while let Some(bytes) = input_rx.recv().await {
            let writer = writer.clone();
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(mut guard) = writer.lock() {
                    let _ = guard.write_all(&bytes);
                    let _ = guard.flush();
                }
            })
            .await;
        }
    });

    // Exit watcher: reap the child and surface its code once.
    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        let _ = exit_tx.send(code);
    });

    let session = Arc::new(ShellSession {
        id: nanoid::nanoid!(12),
        project_id: project_id.to_string(),
        user_id: user_id.to_string(),
        created_at: Utc::now(),
        master: StdMutex::new(pair.master),
        killer: StdMutex::new(killer),
        input_tx,
    });

    debug!(
        "Spawned shell {} for user {} in {}",
        session.id,
        user_id,
        project_path.display()
    );

    Ok(SpawnedShell {
        session,
        output_rx,
        exit_rx,
    })
}

impl ShellSession {
    /// Write bytes to the shell, unchanged.
    pub async fn write_input(&self, bytes: Vec<u8>) -> Result<()> {
        self.input_tx
            .send_timeout(bytes, Duration::from_secs(5))
            .await
            .context("shell input channel closed or full")
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("pty master lock poisoned"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("resizing pty")
    }

    /// Kill the shell child. Idempotent; errors are logged and swallowed.
    pub fn kill(&self) {
        match self.killer.lock() {
            Ok(mut killer) => {
                if let Err(err) = killer.kill() {
                    debug!("Killing shell {} returned {}", self.id, err);
                }
            }
            Err(_) => warn!("Shell {} killer lock poisoned", self.id),
        }
    }
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Incremental UTF-8 decoding of PTY output.
///
/// PTY reads are raw byte chunks, so a multi-byte character can straddle a
/// chunk boundary. Like the JSONL parser's carry buffer, any incomplete
/// trailing sequence is held back until the next chunk instead of being
/// mangled into replacement characters on both sides of the split.
#[derive(Debug, Default)]
pub struct Utf8CarryDecoder {
    carry: Vec<u8>,
}

impl Utf8CarryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk, carrying an incomplete trailing sequence forward.
    /// Invalid bytes still decode lossily; only *incomplete* tails wait.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);
        let complete = complete_utf8_len(&buf);
        self.carry = buf.split_off(complete);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Length of the prefix that ends on a UTF-8 sequence boundary. At most the
/// last three bytes can belong to an incomplete sequence.
fn complete_utf8_len(buf: &[u8]) -> usize {
    let len = buf.len();
    let mut i = len;
    for _ in 0..3 {
        if i == 0 {
            break;
        }
        let byte = buf[i - 1];
        if byte < 0x80 {
            // ASCII tail: everything is complete.
            return len;
        }
        if byte >= 0xc0 {
            // Lead byte: complete iff its full sequence is present.
            let width = match byte {
                0xf0..=0xff => 4,
                0xe0..=0xef => 3,
                _ => 2,
            };
            return if len - (i - 1) >= width { len } else { i - 1 };
        }
        // Continuation byte: keep scanning backwards.
        i -= 1;
    }
    // Three trailing continuation bytes: either a complete 4-byte sequence
    // or garbage the lossy decode handles.
    len
}

/// The platform shell: `powershell.exe -NoLogo` on Windows, `$SHELL --login`
/// elsewhere.
fn platform_shell_command() -> CommandBuilder {
    #[cfg(windows)]
    {
        let mut cmd = CommandBuilder::new("powershell.exe");
        cmd.arg("-NoLogo");
        cmd
    }
    #[cfg(not(windows))]
    {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("--login");
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_passes_ascii_through() {
        let mut decoder = Utf8CarryDecoder::new();
        assert_eq!(decoder.push(b"plain text"), "plain text");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_carries_split_two_byte_char() {
        let mut decoder = Utf8CarryDecoder::new();
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte 'é'.
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let first = decoder.push(&bytes[..split]);
        let second = decoder.push(&bytes[split..]);
        assert_eq!(format!("{first}{second}"), "héllo");
        assert!(!first.contains('\u{fffd}'));
    }

    #[test]
    fn decoder_carries_split_four_byte_char() {
        let mut decoder = Utf8CarryDecoder::new();
        let bytes = "a🦀b".as_bytes();
        // Feed one byte at a time; no replacement chars may appear.
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.push(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "a🦀b");
    }

    #[test]
    fn decoder_flushes_dangling_bytes_on_finish() {
        let mut decoder = Utf8CarryDecoder::new();
        assert_eq!(decoder.push(&[0xe2, 0x94]), "");
        // Stream ends mid-sequence: finish surfaces the replacement char
        // rather than swallowing the bytes.
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn decoder_does_not_stall_on_invalid_lead() {
        let mut decoder = Utf8CarryDecoder::new();
        // An incomplete lead followed by ASCII must flush on the next push.
        assert_eq!(decoder.push(&[0xe0]), "");
        assert_eq!(decoder.push(b"ok"), "\u{fffd}ok");
    }

    #[tokio::test]
    async fn shell_echoes_input_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let spawned = spawn_shell("p1", "u1", dir.path(), 80, 24).unwrap();
        let mut output_rx = spawned.output_rx;

        spawned
            .session
            .write_input(b"echo harbor-$((40+2))\n".to_vec())
            .await
            .unwrap();

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains("harbor-42") {
            let chunk = tokio::time::timeout_at(deadline, output_rx.recv())
                .await
                .ok()
                .flatten();
            match chunk {
                Some(bytes) => seen.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
        assert!(seen.contains("harbor-42"), "output was: {seen}");

        spawned.session.write_input(b"exit\n".to_vec()).await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(10), spawned.exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn kill_terminates_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let spawned = spawn_shell("p1", "u1", dir.path(), 80, 24).unwrap();
        spawned.session.kill();
        let result = tokio::time::timeout(Duration::from_secs(10), spawned.exit_rx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn resize_does_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let spawned = spawn_shell("p1", "u1", dir.path(), 80, 24).unwrap();
        spawned.session.resize(120, 40).unwrap();
        spawned.session.kill();
    }
}
