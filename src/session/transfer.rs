//! Local file checks for config pushes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FileValidationError;

/// Remote command that receives a pushed file on stdin.
pub const DEFAULT_TRANSFER_COMMAND: &str = "scp-config";

/// Files at or above this size are refused.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024;

/// Pause between the last input byte and end-of-input.
pub const DEFAULT_CLOSE_DELAY: Duration = Duration::from_secs(3);

/// Limits and wiring for file pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLimits {
    /// Exclusive size cutoff in bytes.
    pub max_size: u64,
    /// Accepted file name suffixes, e.g. `.cfg`.
    pub extensions: Vec<String>,
    /// Delay before the input pipe is closed.
    pub close_delay: Duration,
    /// Companion command name on the remote side.
    pub command: String,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_FILE_SIZE,
            extensions: vec![".cfg".to_string()],
            close_delay: DEFAULT_CLOSE_DELAY,
            command: DEFAULT_TRANSFER_COMMAND.to_string(),
        }
    }
}

/// A file that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFile {
    /// Path as given.
    pub path: PathBuf,
    /// Base name sent to the remote side.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

impl TransferLimits {
    /// Check that `path` names an existing regular file with an accepted
    /// suffix and a size below the cutoff.
    pub fn validate(&self, path: &Path) -> Result<ValidatedFile, FileValidationError> {
        let display = path.display().to_string();
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileValidationError::NotFound(display))
            }
            Err(e) => return Err(FileValidationError::Metadata(format!("{}: {}", display, e))),
        };
        if metadata.is_dir() {
            return Err(FileValidationError::IsDirectory(display));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            return Err(FileValidationError::InvalidExtension {
                name,
                expected: self.extensions.clone(),
            });
        }

        let size = metadata.len();
        if size >= self.max_size {
            return Err(FileValidationError::TooLarge {
                size,
                max: self.max_size,
            });
        }

        Ok(ValidatedFile {
            path: path.to_path_buf(),
            name,
            size,
        })
    }

    /// Command line that asks the remote side to store `name`.
    ///
    /// `route` is appended verbatim and is expected to start with a space
    /// when non-empty.
    pub fn companion_command(&self, name: &str, route: &str) -> String {
        format!("{} {}{}", self.command, name, route)
    }
}
