use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::context::{Context, ResolvedImage};
use crate::error::VemuError;

/// Strip the `sha256:` algorithm prefix. Bare hex digests are accepted too.
pub fn expected_sha256(digest: &str) -> Result<String, VemuError> {
    let hex_digest = match digest.split_once(':') {
        Some(("sha256", rest)) => rest,
        Some((algo, _)) => {
            return Err(VemuError::Validation {
                message: format!("unsupported digest algorithm '{algo}'"),
            });
        }
        None => digest,
    };
    if hex_digest.len() != 64 || !hex_digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VemuError::Validation {
            message: format!("malformed sha256 digest '{digest}'"),
        });
    }
    Ok(hex_digest.to_ascii_lowercase())
}

/// Download a response body to a file, hashing and updating the progress bar
/// as chunks arrive. Returns the hex digest of what was written.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<String, VemuError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VemuError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| VemuError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk).await.map_err(|e| VemuError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| VemuError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(hex::encode(hasher.finalize()))
}

/// Move a fully downloaded `.part` file into place if its digest matches,
/// otherwise delete it.
async fn commit_download(
    part: &Path,
    dest: &Path,
    expected: &str,
    actual: &str,
) -> Result<(), VemuError> {
    if actual != expected {
        let _ = tokio::fs::remove_file(part).await;
        return Err(VemuError::DigestMismatch {
            path: dest.display().to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    tokio::fs::rename(part, dest)
        .await
        .map_err(|e| VemuError::Io {
            context: format!("renaming {} to {}", part.display(), dest.display()),
            source: e,
        })
}

/// Make sure the base image for `(name, arch)` exists at its resolved path,
/// downloading and verifying it if not. Present images are not re-hashed.
pub async fn pull_base_image(
    context: &Context,
    name: &str,
    arch: &str,
) -> Result<PathBuf, VemuError> {
    let image = context.resolve_base_image(name, arch)?;
    fetch(&image).await?;
    Ok(image.path)
}

async fn fetch(image: &ResolvedImage) -> Result<(), VemuError> {
    let dest = &image.path;
    if dest.is_file() {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(());
    }
    let expected = expected_sha256(&image.digest)?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VemuError::Io {
                context: format!("creating base image dir {}", parent.display()),
                source: e,
            })?;
    }

    tracing::info!(url = %image.url, "downloading base image");

    let response = reqwest::get(&image.url)
        .await
        .map_err(|e| VemuError::ImageDownload {
            message: format!("request to {} failed", image.url),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(VemuError::ImageDownload {
            message: format!("HTTP {} from {}", response.status(), image.url),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let part = dest.with_extension("img.part");
    // stale part from an interrupted download
    let _ = tokio::fs::remove_file(&part).await;

    let actual = match download_to_file(&part, response, &pb).await {
        Ok(digest) => digest,
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
    };
    pb.finish_and_clear();

    commit_download(&part, dest, &expected, &actual).await?;
    tracing::info!(path = %dest.display(), sha256 = %actual, "base image verified");
    Ok(())
}
