//! External compression of finished export files.

use super::naming::ZIP_EXTENSION;
use std::{
    ffi::OsString,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::ExitStatus,
};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("error removing stale archive {}: {source}", path.display())]
    RemoveStale { path: PathBuf, source: io::Error },
    #[error("error starting compressor `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("compressor `{program}` failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("compressor `{program}` did not produce {}", path.display())]
    MissingArchive { program: String, path: PathBuf },
    #[error("error moving archive into place at {}: {source}", path.display())]
    Finalize { path: PathBuf, source: io::Error },
}

/// Runs a zip-compatible program as `<program> -j -q <archive> <file>`.
#[derive(Clone, Debug)]
pub struct Compressor {
    program: String,
}

impl Compressor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Compress `source` into `<source>.zip` and return the archive path.
    ///
    /// The archive is built as `<source>.zip.partial` and renamed over
    /// `<source>.zip` only once the compressor succeeded, so an existing
    /// archive stays intact until it is replaced. zip appends to existing
    /// archives, so a leftover partial archive is removed first. The source
    /// file is removed only after the rename; on any failure it stays on disk
    /// untouched.
    pub async fn compress(&self, source: &Path) -> Result<PathBuf, CompressError> {
        let archive = with_suffix(source, &format!(".{ZIP_EXTENSION}"));
        let partial = with_suffix(&archive, ".partial");

        remove_if_present(&partial)
            .await
            .map_err(|source| CompressError::RemoveStale {
                path: partial.clone(),
                source,
            })?;

        let result = self.run(source, &partial).await;
        if let Err(err) = result {
            if let Err(cleanup) = remove_if_present(&partial).await {
                warn!("failed to remove {}: {}", partial.display(), cleanup);
            }
            return Err(err);
        }

        if let Err(err) = fs::rename(&partial, &archive).await {
            if let Err(cleanup) = remove_if_present(&partial).await {
                warn!("failed to remove {}: {}", partial.display(), cleanup);
            }
            return Err(CompressError::Finalize {
                path: archive,
                source: err,
            });
        }
        debug!("archive written to {}", archive.display());

        if let Err(err) = fs::remove_file(source).await {
            warn!(
                "failed to remove uncompressed export {}: {}",
                source.display(),
                err
            );
        }

        Ok(archive)
    }

    async fn run(&self, source: &Path, archive: &Path) -> Result<(), CompressError> {
        let output = Command::new(&self.program)
            .arg("-j")
            .arg("-q")
            .arg(archive)
            .arg(source)
            .output()
            .await
            .map_err(|err| CompressError::Spawn {
                program: self.program.clone(),
                source: err,
            })?;

        if !output.status.success() {
            return Err(CompressError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if fs::metadata(archive).await.is_err() {
            return Err(CompressError::MissingArchive {
                program: self.program.clone(),
                path: archive.to_path_buf(),
            });
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!("removed stale archive {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in for `zip` that copies the input to the archive path.
    fn fake_zip(dir: &Path) -> String {
        let script = dir.join("fake-zip.sh");
        std::fs::write(&script, "#!/bin/sh\ncp \"$4\" \"$3\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    /// Appends the input to the archive, the way zip updates existing files.
    fn appending_zip(dir: &Path) -> String {
        let script = dir.join("append-zip.sh");
        std::fs::write(&script, "#!/bin/sh\ncat \"$4\" >> \"$3\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn replaces_stale_archive_and_removes_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orders.bak");
        std::fs::write(&source, b"fresh").unwrap();
        std::fs::write(dir.path().join("orders.bak.zip"), b"stale").unwrap();

        let archive = Compressor::new(fake_zip(dir.path()))
            .compress(&source)
            .await
            .unwrap();

        assert_eq!(archive, dir.path().join("orders.bak.zip"));
        assert_eq!(std::fs::read(&archive).unwrap(), b"fresh");
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn failing_compressor_keeps_previous_archive() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orders.bak");
        let archive = dir.path().join("orders.bak.zip");
        std::fs::write(&source, b"fresh").unwrap();
        std::fs::write(&archive, b"last-good").unwrap();

        let err = Compressor::new("false").compress(&source).await.unwrap_err();

        assert!(matches!(err, CompressError::Failed { .. }));
        assert_eq!(std::fs::read(&archive).unwrap(), b"last-good");
        assert!(!dir.path().join("orders.bak.zip.partial").exists());
        assert!(source.exists());
    }

    #[tokio::test]
    async fn leftover_partial_archive_is_not_appended_to() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orders.bak");
        std::fs::write(&source, b"fresh").unwrap();
        std::fs::write(dir.path().join("orders.bak.zip.partial"), b"crashed").unwrap();

        let archive = Compressor::new(appending_zip(dir.path()))
            .compress(&source)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&archive).unwrap(), b"fresh");
        assert!(!dir.path().join("orders.bak.zip.partial").exists());
    }

    #[tokio::test]
    async fn failing_compressor_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orders.bak");
        std::fs::write(&source, b"data").unwrap();

        let err = Compressor::new("false").compress(&source).await.unwrap_err();
        assert!(matches!(err, CompressError::Failed { .. }));
        assert_eq!(std::fs::read(&source).unwrap(), b"data");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orders.bak");
        std::fs::write(&source, b"data").unwrap();

        let err = Compressor::new("/nonexistent/zip-binary")
            .compress(&source)
            .await
            .unwrap_err();
        assert!(matches!(err, CompressError::Spawn { .. }));
        assert!(source.exists());
    }

    #[tokio::test]
    async fn compressor_that_writes_nothing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("orders.bak");
        std::fs::write(&source, b"data").unwrap();

        let err = Compressor::new("true").compress(&source).await.unwrap_err();
        assert!(matches!(err, CompressError::MissingArchive { .. }));
        assert!(source.exists());
    }
}
