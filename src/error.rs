use std::path::{Path, PathBuf};

/// Setup and scoring errors.
///
/// Every setup error is fatal: a malformed phantom or source map
/// invalidates the whole simulation, so callers propagate these up to the
/// binary and stop.
#[derive(Debug, thiserror::Error)]
pub enum PhantomError {
    #[error("cannot open {}: {source}", .path.display())]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: malformed {field}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        field: String,
        reason: String,
    },

    #[error("{}: {reason}", .path.display())]
    DataIntegrity { path: PathBuf, reason: String },

    #[error("organ tag {tag} has no catalog entry{}", describe_file(.file.as_deref()))]
    UnknownTag { tag: u32, file: Option<PathBuf> },

    #[error("no catalogued material is named '{name}'")]
    UnknownMaterial { name: String },

    #[error("slice headers disagree on {axis}: {reason}")]
    GeometryMismatch { axis: &'static str, reason: String },

    #[error("voxel {index:?} is outside grid {shape:?}")]
    IndexOutOfRange { index: [usize; 3], shape: [usize; 3] },

    #[error("probability map cannot be sampled: {reason}")]
    EmptyMap { reason: String },

    #[error("tally channel {handle} is not registered")]
    UnknownChannel { handle: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn describe_file(file: Option<&Path>) -> String {
    match file {
        Some(path) => format!(" (referenced by {})", path.display()),
        None => String::new(),
    }
}

impl PhantomError {
    /// Malformed field in `path`.
    pub fn parse(path: &Path, field: impl Into<String>, reason: impl Into<String>) -> Self {
        PhantomError::Parse {
            path: path.to_path_buf(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Inputs or results that disagree with each other.
    pub fn integrity(path: &Path, reason: impl Into<String>) -> Self {
        PhantomError::DataIntegrity {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// I/O failure on an output or already opened file.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        PhantomError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type PhantomResult<T> = Result<T, PhantomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_names_the_file() {
        let err = PhantomError::UnknownTag {
            tag: 42,
            file: Some(PathBuf::from("slices/slice_003.g4m")),
        };
        let msg = err.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("slice_003.g4m"));

        let bare = PhantomError::UnknownTag { tag: 7, file: None };
        assert_eq!(bare.to_string(), "organ tag 7 has no catalog entry");
    }

    #[test]
    fn parse_error_mentions_field() {
        let err = PhantomError::parse(Path::new("Data.dat"), "file count", "expected integer");
        assert_eq!(
            err.to_string(),
            "Data.dat: malformed file count: expected integer"
        );
    }
}
