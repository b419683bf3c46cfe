use std::path::Path;

use crate::error::PhantomResult;
use crate::source::{ProbabilityMap, SourceGrid, SourceMode};

/// Source map reader trait
/// Each dose-map file format implements this trait
pub trait DoseMapParser: Send + Sync {
    /// File extensions handled (without the dot), e.g. "g4d"
    fn supported_extensions(&self) -> Vec<&'static str>;

    /// Whether the file extension is handled
    fn supports(&self, extension: &str) -> bool {
        self.supported_extensions()
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }

    /// Configured mode that selects this reader
    fn mode(&self) -> SourceMode;

    /// Builds the normalized cumulative map from the file
    fn parse_from_file(&self, file_path: &Path) -> PhantomResult<ProbabilityMap>;

    /// Reads only the grid metadata, skipping the intensity data
    fn read_grid_from_file(&self, file_path: &Path) -> PhantomResult<SourceGrid>;

    /// Reader name for logs and error messages
    fn name(&self) -> &'static str;
}
