mod dense;
pub mod lists;
pub mod manifest;
mod sparse;

pub use dense::DenseDoseMapParser;
pub use sparse::SparseDoseMapParser;

/// All available dose-map readers
pub fn get_all_parsers() -> Vec<Box<dyn crate::utils::parser::DoseMapParser>> {
    vec![
        Box::new(DenseDoseMapParser::new()),
        Box::new(SparseDoseMapParser::new()),
    ]
}
