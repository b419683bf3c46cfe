use std::path::{Path, PathBuf};

use crate::error::{PhantomError, PhantomResult};
use crate::utils::tokens::TokenReader;

/// File name of the manifest in phantom and dose-map directories.
pub const MANIFEST_FILE: &str = "Data.dat";

/// Ordered list of data files; the order is the stacking order along z.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Compression flag of phantom manifests; `None` for dose-map manifests.
    pub compression: Option<i32>,
    /// Paths resolved against the manifest directory.
    pub files: Vec<PathBuf>,
}

impl Manifest {
    /// `compression count name...`
    pub fn read_phantom(path: &Path) -> PhantomResult<Self> {
        Self::read(path, true)
    }

    /// `count name...`
    pub fn read_dose(path: &Path) -> PhantomResult<Self> {
        Self::read(path, false)
    }

    fn read(path: &Path, has_compression_flag: bool) -> PhantomResult<Self> {
        let mut tokens = TokenReader::open(path)?;
        let compression = if has_compression_flag {
            Some(tokens.next::<i32>("compression flag")?)
        } else {
            None
        };
        let count: usize = tokens.next("file count")?;
        if count == 0 {
            return Err(PhantomError::parse(path, "file count", "manifest lists no files"));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let files = tokens
            .next_n::<String>(count, "file name")?
            .into_iter()
            .map(|name| base.join(name))
            .collect();

        Ok(Manifest { compression, files })
    }
}
