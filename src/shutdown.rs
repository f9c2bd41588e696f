use std::io;
use std::path::Path;

use log::{debug, info, warn};
use tokio::fs;
use tokio::signal::unix::{signal, SignalKind};

use crate::output::{PLAYLIST_NAME, SEGMENT_EXTENSION};

/// Resolves on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() -> io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

/// Best-effort removal of playlists and segments under `root`.
///
/// Does not wait for live sessions; anything missing or unreadable is
/// skipped. Returns the number of files removed.
pub async fn cleanup(root: &Path) -> usize {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping {}: {}", dir.display(), e);
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            // never follow links out of the output root
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || !is_output_artifact(&path) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    info!("Removed {} output artifacts from {}", removed, root.display());
    removed
}

fn is_output_artifact(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == PLAYLIST_NAME)
        || path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION)
}
