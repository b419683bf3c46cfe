//! Counted list files: a count followed by that many tokens.

use std::path::Path;
use std::str::FromStr;

use crate::error::{PhantomError, PhantomResult};
use crate::utils::tokens::TokenReader;

/// Reads a count and then that many values.
pub fn read_counted<T>(path: &Path, field: &str) -> PhantomResult<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let mut tokens = TokenReader::open(path)?;
    let count: usize = tokens.next("entry count")?;
    tokens.next_n(count, field)
}

/// Energy-bin upper edges (keV); must be positive and strictly increasing.
pub fn read_energy_bins(path: &Path) -> PhantomResult<Vec<f64>> {
    let edges: Vec<f64> = read_counted(path, "energy bin edge")?;
    if edges.is_empty() {
        return Err(PhantomError::parse(path, "energy bin count", "no bins defined"));
    }
    let mut low = 0.0;
    for &edge in &edges {
        if !(edge > low) {
            return Err(PhantomError::parse(
                path,
                "energy bin edge",
                format!("{edge} does not exceed the previous edge {low}"),
            ));
        }
        low = edge;
    }
    Ok(edges)
}

/// Organ tags, e.g. `OrgantagOfInterest.txt`.
pub fn read_tag_list(path: &Path) -> PhantomResult<Vec<u32>> {
    read_counted(path, "organ tag")
}

/// Material or species names.
pub fn read_name_list(path: &Path) -> PhantomResult<Vec<String>> {
    read_counted(path, "name")
}
