// Root-directory file access for the server. Every requested path is
// resolved relative to the configured root; anything that would escape it is
// refused as an access violation before a transfer starts.

use crate::tftp::ErrorCode;
use clap::ValueEnum;
use std::error;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;

/// A file operation the peer must hear about, carrying the wire error code
/// it maps to.
#[derive(Debug)]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
}

impl error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError {
            code: e.kind().into(),
            message: e.to_string(),
        }
    }
}

/// Server policy for write requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WriteMode {
    /// Refuse every write request.
    Disabled,
    /// Accept writes to files that do not exist yet.
    New,
    /// Accept writes, replacing existing files.
    Overwrite,
}

/// Serves files from a single root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<FileStore> {
        let root = root.into().canonicalize()?;
        Ok(FileStore { root })
    }

    /// Maps a requested filename onto the root. A leading slash is treated
    /// as relative to the root (clients routinely send absolute paths), and
    /// any parent-directory component is rejected outright rather than
    /// resolved.
    fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let relative = filename.trim_start_matches('/');
        let requested = Path::new(relative);

        for component in requested.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(StorageError {
                        code: ErrorCode::AccessViolation,
                        message: format!("path '{filename}' escapes the served directory"),
                    })
                }
            }
        }

        Ok(self.root.join(requested))
    }

    pub async fn open_read(&self, filename: &str) -> Result<File, StorageError> {
        let path = self.resolve(filename)?;
        log::debug!("opening {} for read", path.display());
        Ok(File::open(path).await?)
    }

    /// Creates the target for an upload, subject to the configured write
    /// policy. Under `New` an existing file surfaces as FileAlreadyExists
    /// on the wire; `Disabled` refuses before touching the filesystem.
    pub async fn create_write(
        &self,
        filename: &str,
        mode: WriteMode,
    ) -> Result<File, StorageError> {
        let path = self.resolve(filename)?;
        log::debug!("creating {} for write", path.display());
        match mode {
            WriteMode::Disabled => Err(StorageError {
                code: ErrorCode::AccessViolation,
                message: "writes are disabled on this server".to_string(),
            }),
            WriteMode::New => Ok(File::create_new(path).await?),
            WriteMode::Overwrite => Ok(File::create(path).await?),
        }
    }
}
