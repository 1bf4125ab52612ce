//! Installer archive handling: extraction, staging hygiene, and guarded
//! destructive cleanup.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::errors::{AgentError, AgentResult};

/// Roots under which destructive directory cleanup is permitted. Cleaning a
/// non-empty directory anywhere else aborts.
pub const CLEANUP_ALLOWLIST: &[&str] = &["/private/tmp", "/tmp", "/var/folders", "/usr/local/amazon/var"];

/// Extract a zip archive into `dest`.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> AgentResult<()> {
    let file = File::open(archive_path)
        .map_err(|err| AgentError::InstallerFailed(format!("open archive: {err}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| AgentError::InstallerFailed(format!("read archive: {err}")))?;
    archive
        .extract(dest)
        .map_err(|err| AgentError::InstallerFailed(format!("extract archive: {err}")))?;
    debug!(archive = %archive_path.display(), dest = %dest.display(), "extracted archive");
    Ok(())
}

fn is_under_allowlist(path: &Path) -> bool {
    let Ok(canonical) = path.canonicalize() else {
        return false;
    };
    CLEANUP_ALLOWLIST
        .iter()
        .any(|root| canonical.starts_with(root))
}

/// Remove every child of `path`, leaving the directory itself.
///
/// A non-empty directory outside the allowlist is refused; this is the hard
/// safety net under installer cleanup paths.
pub fn clean_directory(path: &Path) -> AgentResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let entries: Vec<_> = std::fs::read_dir(path)?.collect::<Result<_, _>>()?;
    if entries.is_empty() {
        return Ok(());
    }
    if !is_under_allowlist(path) {
        return Err(AgentError::InstallerFailed(format!(
            "refusing destructive cleanup outside allowlisted roots: {}",
            path.display()
        )));
    }

    for entry in entries {
        let child = entry.path();
        let result = if child.is_dir() {
            std::fs::remove_dir_all(&child)
        } else {
            std::fs::remove_file(&child)
        };
        if let Err(err) = result {
            warn!(path = %child.display(), error = %err, "failed to remove during cleanup");
            return Err(err.into());
        }
    }
    Ok(())
}

/// Remove staging files that are not the expected archive or signature.
pub fn scrub_foreign_files(staging: &Path, keep: &[&Path]) -> AgentResult<()> {
    if !staging.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        let child = entry.path();
        if keep.iter().any(|k| *k == child.as_path()) {
            continue;
        }
        let result = if child.is_dir() {
            std::fs::remove_dir_all(&child)
        } else {
            std::fs::remove_file(&child)
        };
        if let Err(err) = result {
            warn!(path = %child.display(), error = %err, "failed to scrub staging entry");
        }
    }
    Ok(())
}

/// Locate the single installable package with the given extension under
/// `dir` (searched recursively).
pub fn find_package(dir: &Path, extension: &str) -> AgentResult<PathBuf> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                // Bundle-style packages (e.g. `.pkg` directories) match too.
                if path.extension().is_some_and(|ext| ext == extension) {
                    return Ok(path);
                }
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == extension) {
                return Ok(path);
            }
        }
    }
    Err(AgentError::InstallerFailed(format!(
        "no .{extension} package found under {}",
        dir.display()
    )))
}

/// Recursively copy `source`'s contents into `dest` (created if absent).
pub fn copy_dir_contents(source: &Path, dest: &Path) -> AgentResult<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir_contents(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
