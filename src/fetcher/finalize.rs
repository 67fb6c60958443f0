// Staging area and final placement of downloaded media
//
// Backends write into `<dir>/temp/` and only move the finished file to
// `<dir>/<slug>.<ext>` as their last step, so nothing watching the output
// directory ever sees a partial file. A failed move leaves the staged file
// where it is for diagnosis.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::errors::FetchError;

pub const TEMP_DIR_NAME: &str = "temp";

/// `<dir>/temp`
pub fn temp_dir(directory: &Path) -> PathBuf {
    directory.join(TEMP_DIR_NAME)
}

/// Create the staging directory if needed and return it
pub async fn ensure_temp_dir(directory: &Path) -> Result<PathBuf, FetchError> {
    let temp = temp_dir(directory);
    tokio::fs::create_dir_all(&temp).await?;
    Ok(temp)
}

/// Final destination for a slug. `extension` may be given with or without its dot.
pub fn destination(directory: &Path, slug: &str, extension: &str) -> PathBuf {
    let extension = extension.trim_start_matches('.');
    if extension.is_empty() {
        directory.join(slug)
    } else {
        directory.join(format!("{}.{}", slug, extension))
    }
}

/// Leftovers of an interrupted transfer: yt-dlp fragments and our own `.tmp` files
fn is_partial(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".tmp")
}

/// Find the single staged file `<dir>/temp/<slug>.*`
pub async fn find_staged(directory: &Path, slug: &str) -> Result<PathBuf, FetchError> {
    let temp = temp_dir(directory);
    let prefix = format!("{}.", slug);

    let mut matches = Vec::new();
    let mut entries = tokio::fs::read_dir(&temp).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && !is_partial(&name) {
            matches.push(entry.path());
        }
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        n => Err(FetchError::UnexpectedResponse(format!(
            "unexpected number of files in staging area: {}",
            n
        ))),
    }
}

/// Move a staged file to its final destination.
///
/// Uses a rename, which is atomic on one filesystem. Across filesystems the
/// file is copied next to the destination first and renamed from there.
pub async fn finalize(staged: &Path, destination: &Path) -> Result<PathBuf, FetchError> {
    debug!(from = %staged.display(), to = %destination.display(), "finalizing");

    let placed = match tokio::fs::rename(staged, destination).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => copy_then_rename(staged, destination).await,
        Err(e) => Err(e),
    };

    placed.map_err(|source| FetchError::Finalize {
        from: staged.to_path_buf(),
        to: destination.to_path_buf(),
        source,
    })?;

    Ok(destination.to_path_buf())
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    // EXDEV
    e.raw_os_error() == Some(18)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

async fn copy_then_rename(staged: &Path, destination: &Path) -> io::Result<()> {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sibling = destination.with_file_name(format!(".{}.partial", file_name));

    tokio::fs::copy(staged, &sibling).await?;
    if let Err(e) = tokio::fs::rename(&sibling, destination).await {
        let _ = tokio::fs::remove_file(&sibling).await;
        return Err(e);
    }
    tokio::fs::remove_file(staged).await
}
