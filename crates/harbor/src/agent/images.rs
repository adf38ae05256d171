//! Per-turn temp image handling.
//!
//! Images attached to a `send_message` are materialised under
//! `<project>/.tmp/images/<unix-ms>/image-<i>.<ext>` before the agent CLI is
//! spawned, and that directory is deleted exactly once, whichever of the
//! turn's happy end, its error path, or the session close handler gets there
//! first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use harbor_protocol::TurnImage;
use log::{debug, warn};

/// A turn's temp image directory. Cleanup is a guarded no-op after the first
/// call.
#[derive(Debug)]
pub struct TempImageDir {
    dir: PathBuf,
    paths: Vec<PathBuf>,
    cleaned: AtomicBool,
}

impl TempImageDir {
    /// Paths of the written images, in the order received.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Delete the directory. Idempotent; failures are logged and swallowed
    /// (best-effort release).
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(
                "Failed to remove temp image dir {}: {}",
                self.dir.display(),
                err
            );
        } else {
            debug!("Removed temp image dir {}", self.dir.display());
        }
    }
}

/// Write the turn's images to a fresh temp directory under the project.
///
/// Returns `None` when there is nothing to write.
pub async fn write_turn_images(
    project_path: &Path,
    images: &[TurnImage],
) -> Result<Option<TempImageDir>> {
    if images.is_empty() {
        return Ok(None);
    }

    let dir = project_path
        .join(".tmp")
        .join("images")
        .join(chrono::Utc::now().timestamp_millis().to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating temp image dir {}", dir.display()))?;

    let mut paths = Vec::with_capacity(images.len());
    for (i, image) in images.iter().enumerate() {
        let path = match write_image(&dir, i, image).await {
            Ok(path) => path,
            Err(err) => {
                // Don't leave a half-written directory behind.
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(err);
            }
        };
        paths.push(path);
    }

    Ok(Some(TempImageDir {
        dir,
        paths,
        cleaned: AtomicBool::new(false),
    }))
}

async fn write_image(dir: &Path, index: usize, image: &TurnImage) -> Result<PathBuf> {
    if let Some(data_url) = &image.data {
        let (media_type, payload) = split_data_url(data_url)?;
        let ext = image
            .media_type
            .as_deref()
            .or(media_type)
            .map(extension_for_media_type)
            .unwrap_or("png");
        let bytes = BASE64
            .decode(payload)
            .context("decoding base64 image data")?;
        let path = dir.join(format!("image-{index}.{ext}"));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing image {}", path.display()))?;
        return Ok(path);
    }

    if let Some(source) = &image.path {
        let source = PathBuf::from(source);
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png")
            .to_string();
        let path = dir.join(format!("image-{index}.{ext}"));
        tokio::fs::copy(&source, &path)
            .await
            .with_context(|| format!("copying image {}", source.display()))?;
        return Ok(path);
    }

    bail!("image {index} has neither data nor path");
}

/// Split a `data:image/png;base64,....` URL into media type and payload.
/// A bare base64 string is accepted with an unknown media type.
fn split_data_url(data_url: &str) -> Result<(Option<&str>, &str)> {
    let Some(rest) = data_url.strip_prefix("data:") else {
        return Ok((None, data_url));
    };
    let (header, payload) = rest
        .split_once(',')
        .context("malformed data URL: missing comma")?;
    let media_type = header.split(';').next().filter(|s| !s.is_empty());
    Ok((media_type, payload))
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_image(payload: &[u8], media_type: &str) -> TurnImage {
        TurnImage {
            data: Some(format!("data:{media_type};base64,{}", BASE64.encode(payload))),
            path: None,
            media_type: None,
        }
    }

    #[tokio::test]
    async fn writes_data_url_images_in_order() {
        let project = tempfile::tempdir().unwrap();
        let images = vec![
            data_image(b"first", "image/png"),
            data_image(b"second", "image/jpeg"),
        ];

        let temp = write_turn_images(project.path(), &images)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(temp.paths().len(), 2);
        assert!(temp.paths()[0].to_string_lossy().ends_with("image-0.png"));
        assert!(temp.paths()[1].to_string_lossy().ends_with("image-1.jpg"));
        assert_eq!(std::fs::read(&temp.paths()[0]).unwrap(), b"first");

        temp.cleanup().await;
    }

    #[tokio::test]
    async fn copies_raw_paths() {
        let project = tempfile::tempdir().unwrap();
        let source = project.path().join("shot.webp");
        std::fs::write(&source, b"pixels").unwrap();

        let images = vec![TurnImage {
            data: None,
            path: Some(source.to_string_lossy().into_owned()),
            media_type: None,
        }];
        let temp = write_turn_images(project.path(), &images)
            .await
            .unwrap()
            .unwrap();

        assert!(temp.paths()[0].to_string_lossy().ends_with("image-0.webp"));
        assert_eq!(std::fs::read(&temp.paths()[0]).unwrap(), b"pixels");
        temp.cleanup().await;
    }

    #[tokio::test]
    async fn no_images_means_no_directory() {
        let project = tempfile::tempdir().unwrap();
        assert!(write_turn_images(project.path(), &[])
            .await
            .unwrap()
            .is_none());
        assert!(!project.path().join(".tmp").exists());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let project = tempfile::tempdir().unwrap();
        let temp = write_turn_images(project.path(), &[data_image(b"x", "image/png")])
            .await
            .unwrap()
            .unwrap();

        let dir = temp.paths()[0].parent().unwrap().to_path_buf();
        assert!(dir.exists());
        temp.cleanup().await;
        assert!(!dir.exists());
        // Second call must be a no-op, not an error.
        temp.cleanup().await;
    }

    #[tokio::test]
    async fn invalid_base64_fails_and_leaves_nothing() {
        let project = tempfile::tempdir().unwrap();
        let images = vec![TurnImage {
            data: Some("data:image/png;base64,!!!not-base64!!!".to_string()),
            path: None,
            media_type: None,
        }];
        assert!(write_turn_images(project.path(), &images).await.is_err());
        let base = project.path().join(".tmp").join("images");
        let leftovers = std::fs::read_dir(&base)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
