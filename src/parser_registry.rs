use std::path::Path;

use tracing::info;

use crate::error::{PhantomError, PhantomResult};
use crate::source::{ProbabilityMap, SourceMode};
use crate::utils::parser::DoseMapParser;

/// Dose-map reader registry
/// Holds every available reader and matches one by file extension or configured mode
pub struct ParserRegistry {
    parsers: Vec<Box<dyn DoseMapParser>>,
}

impl ParserRegistry {
    /// Registers all available readers
    pub fn new() -> Self {
        let parsers = crate::parsers::get_all_parsers();
        Self { parsers }
    }

    /// extension: without the dot, e.g. "g4d"
    pub fn find_parser(&self, extension: &str) -> Option<&dyn DoseMapParser> {
        self.parsers
            .iter()
            .find(|parser| parser.supports(extension))
            .map(|p| p.as_ref())
    }

    /// Extracts the extension from the path; `.gz` is looked through
    pub fn find_parser_for_file(&self, file_path: &Path) -> Option<(&dyn DoseMapParser, String)> {
        let mut extension = file_path.extension().and_then(|ext| ext.to_str())?;
        if extension.eq_ignore_ascii_case("gz") {
            extension = Path::new(file_path.file_stem()?)
                .extension()
                .and_then(|ext| ext.to_str())?;
        }
        let extension = extension.to_string();

        self.find_parser(&extension).map(|parser| (parser, extension))
    }

    /// Parser registered for a source mode.
    pub fn parser_for_mode(&self, mode: SourceMode) -> Option<&dyn DoseMapParser> {
        self.parsers
            .iter()
            .find(|parser| parser.mode() == mode)
            .map(|p| p.as_ref())
    }

    /// Picks the reader for `path` under `mode`; `Auto` goes by extension
    pub fn resolve(&self, path: &Path, mode: SourceMode) -> PhantomResult<&dyn DoseMapParser> {
        let parser = match mode {
            SourceMode::Auto => self.find_parser_for_file(path).map(|(parser, _)| parser),
            explicit => self.parser_for_mode(explicit),
        };
        parser.ok_or_else(|| {
            PhantomError::Config(format!(
                "no dose-map reader for {} (mode {mode:?}, supported extensions: {})",
                path.display(),
                self.supported_extensions().join(", ")
            ))
        })
    }

    /// Builds the probability map with the reader chosen by [`ParserRegistry::resolve`]
    pub fn load(&self, path: &Path, mode: SourceMode) -> PhantomResult<ProbabilityMap> {
        let parser = self.resolve(path, mode)?;
        info!(
            parser = parser.name(),
            path = %path.display(),
            "loading source map"
        );
        parser.parse_from_file(path)
    }

    /// Every extension some parser accepts.
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        for parser in &self.parsers {
            extensions.extend(
                parser
                    .supported_extensions()
                    .iter()
                    .map(|s| s.to_lowercase()),
            );
        }
        extensions.sort();
        extensions.dedup();
        extensions
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_by_extension() {
        let registry = ParserRegistry::new();
        assert_eq!(registry.supported_extensions(), vec!["dat", "g4d"]);

        let (parser, ext) = registry
            .find_parser_for_file(Path::new("maps/SparseDoseMap.g4d"))
            .unwrap();
        assert_eq!(parser.mode(), SourceMode::Sparse);
        assert_eq!(ext, "g4d");

        let (parser, _) = registry
            .find_parser_for_file(Path::new("maps/Data.DAT"))
            .unwrap();
        assert_eq!(parser.mode(), SourceMode::Dense);

        let (parser, ext) = registry
            .find_parser_for_file(Path::new("SparseDoseMap.g4d.gz"))
            .unwrap();
        assert_eq!(parser.mode(), SourceMode::Sparse);
        assert_eq!(ext, "g4d");

        assert!(registry.find_parser_for_file(Path::new("slice.g4m")).is_none());
        assert!(registry.find_parser_for_file(Path::new("noext")).is_none());
    }

    #[test]
    fn explicit_mode_overrides_extension() {
        let registry = ParserRegistry::new();
        let parser = registry
            .resolve(Path::new("custom.txt"), SourceMode::Sparse)
            .unwrap();
        assert_eq!(parser.mode(), SourceMode::Sparse);
        assert!(registry.parser_for_mode(SourceMode::Auto).is_none());

        assert!(matches!(
            registry.resolve(Path::new("custom.txt"), SourceMode::Auto),
            Err(PhantomError::Config(_))
        ));
    }

    #[test]
    fn load_reads_sparse_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SparseDoseMap.g4d");
        std::fs::write(&path, "2 1 1 1 0 2 0 1 0 1\n1 1.0\n").unwrap();
        let map = ParserRegistry::new().load(&path, SourceMode::Auto).unwrap();
        assert_eq!(map.sample_voxel(0.4).unwrap(), 1);
    }
}
