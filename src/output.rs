use std::io;
use std::path::{Component, Path, PathBuf};

use log::debug;
use tokio::fs;

use crate::error::SessionError;

pub const PLAYLIST_NAME: &str = "index.m3u8";
pub const SEGMENT_EXTENSION: &str = "ts";

/// The directory all stream output is confined to.
#[derive(Debug, Clone)]
pub struct OutputRoot {
    root: PathBuf,
}

/// A prepared per-stream output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDir {
    /// Sanitized name relative to the root, also used as the stream key.
    pub name: String,
    pub path: PathBuf,
}

impl OutputDir {
    pub fn playlist(&self) -> PathBuf {
        self.path.join(PLAYLIST_NAME)
    }
}

impl OutputRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OutputRoot { root: root.into() }
    }

    /// Creates `<root>/<name>/`, refusing anything that would land outside
    /// the root. Existing directories are fine.
    pub async fn prepare(&self, name: &str) -> Result<OutputDir, SessionError> {
        let relative = sanitize(name)?;

        create_dir(&self.root)
            .await
            .map_err(|e| path_error(&self.root, e))?;
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|e| path_error(&self.root, e))?;

        // Walk one component at a time so a symlink planted inside the root
        // is caught before anything is created behind it.
        let mut current = root.clone();
        for component in relative.components() {
            current.push(component);
            match fs::symlink_metadata(&current).await {
                Ok(_) => {
                    let resolved = fs::canonicalize(&current)
                        .await
                        .map_err(|e| path_error(&current, e))?;
                    let is_dir = fs::metadata(&resolved)
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if !resolved.starts_with(&root) || !is_dir {
                        return Err(SessionError::Path(format!(
                            "{} resolves outside of the output root or is not a directory",
                            current.display()
                        )));
                    }
                    current = resolved;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    create_dir(&current)
                        .await
                        .map_err(|e| path_error(&current, e))?;
                }
                Err(e) => return Err(path_error(&current, e)),
            }
        }

        debug!("Prepared output directory {}", current.display());
        Ok(OutputDir {
            name: relative.to_string_lossy().into_owned(),
            path: current,
        })
    }
}

/// Lexically normalizes a publishing name into a path relative to the root.
pub fn sanitize(name: &str) -> Result<PathBuf, SessionError> {
    if name.is_empty() {
        return Err(SessionError::InvalidRequest(
            "publishing name is empty".to_string(),
        ));
    }
    if name.contains('\0') {
        return Err(SessionError::Path(format!("{:?} contains a NUL byte", name)));
    }

    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return Err(SessionError::Path(format!(
                        "{:?} escapes the output root",
                        name
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SessionError::Path(format!("{:?} is an absolute path", name)));
            }
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(SessionError::Path(format!(
            "{:?} does not name a directory below the output root",
            name
        )));
    }
    Ok(relative)
}

async fn create_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder.create(path).await
}

fn path_error(path: &Path, e: io::Error) -> SessionError {
    SessionError::Path(format!("{}: {}", path.display(), e))
}
