//! Element and tissue definitions, and the organ tag -> material index map.

use std::collections::BTreeMap;
use std::path::Path;

use ahash::AHashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{PhantomError, PhantomResult};
use crate::utils::tokens::TokenReader;

/// Dense index into the material table. Index 0 is the background medium.
pub type MaterialIndex = usize;

/// Element fractions and density per organ tag.
pub const COMPOSITION_FILE: &str = "ECompDensity.txt";
/// Organ tag to name table, aligned with the composition file.
pub const ORGAN_NAME_FILE: &str = "OrgantagvsName.txt";

/// Organ tag bound to the background medium.
pub const BACKGROUND_TAG: u32 = 0;

/// One element column of the composition table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementDef {
    pub symbol: &'static str,
    pub name: &'static str,
    pub z: u32,
    /// g/mol
    pub molar_mass: f64,
}

const fn element(symbol: &'static str, name: &'static str, z: u32, molar_mass: f64) -> ElementDef {
    ElementDef {
        symbol,
        name,
        z,
        molar_mass,
    }
}

/// Column order of the composition file.
const STANDARD_ELEMENTS: [ElementDef; 14] = [
    element("H", "Hydrogen", 1, 1.008),
    element("C", "Carbon", 6, 12.011),
    element("N", "Nitrogen", 7, 14.007),
    element("O", "Oxygen", 8, 16.00),
    element("Na", "Sodium", 11, 22.98977),
    element("Mg", "Magnesium", 12, 24.305),
    element("P", "Phosphorus", 15, 30.973762),
    element("S", "Sulfur", 16, 32.065),
    element("Cl", "Chlorine", 17, 35.453),
    element("Ar", "Argon", 18, 39.948),
    element("K", "Potassium", 19, 39.0983),
    element("Ca", "Calcium", 20, 40.078),
    element("Fe", "Iron", 26, 55.845),
    element("I", "Iodine", 53, 126.90447),
];

/// Element slot (1-based composition-file column) -> element definition.
#[derive(Debug, Clone)]
pub struct ElementTable {
    elements: BTreeMap<usize, ElementDef>,
}

impl ElementTable {
    /// The 14 columns of `ECompDensity.txt`: H C N O Na Mg P S Cl Ar K Ca Fe I.
    pub fn standard() -> Self {
        let elements = STANDARD_ELEMENTS
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, def)| (i + 1, def))
            .collect();
        ElementTable { elements }
    }

    /// Replaces or adds the element in `slot`.
    pub fn with_element(mut self, slot: usize, def: ElementDef) -> Self {
        self.elements.insert(slot, def);
        self
    }

    /// Element of a column slot.
    pub fn get(&self, slot: usize) -> Option<&ElementDef> {
        self.elements.get(&slot)
    }

    /// Column slot of an element symbol.
    pub fn slot_of(&self, symbol: &str) -> Option<usize> {
        self.elements
            .iter()
            .find(|(_, def)| def.symbol == symbol)
            .map(|(slot, _)| *slot)
    }

    /// Number of fraction columns per composition record.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Slots and elements in column order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ElementDef)> {
        self.elements.iter().map(|(slot, def)| (*slot, def))
    }
}

impl Default for ElementTable {
    fn default() -> Self {
        ElementTable::standard()
    }
}

/// A catalogued tissue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Material {
    pub name: String,
    pub organ_tag: u32,
    /// g/cm³
    pub density: f64,
    /// Element slot -> mass fraction. Only positive fractions are kept.
    pub composition: BTreeMap<usize, f64>,
}

impl Material {
    /// Sum of the element fractions; not forced to 1.
    pub fn mass_fraction_sum(&self) -> f64 {
        self.composition.values().sum()
    }
}

/// Tissue materials and the organ tag lookup.
///
/// Built once at startup and immutable afterwards; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct MaterialCatalog {
    elements: ElementTable,
    materials: Vec<Material>,
    tag_to_index: AHashMap<u32, MaterialIndex>,
}

impl MaterialCatalog {
    /// A catalog that only knows the background medium (air, tag 0).
    pub fn with_background(elements: ElementTable) -> Self {
        let mut composition = BTreeMap::new();
        if let Some(slot) = elements.slot_of("N") {
            composition.insert(slot, 0.7);
        }
        if let Some(slot) = elements.slot_of("O") {
            composition.insert(slot, 0.3);
        }
        let air = Material {
            name: "Air".to_string(),
            organ_tag: BACKGROUND_TAG,
            density: 1.290e-3,
            composition,
        };

        let mut tag_to_index = AHashMap::new();
        tag_to_index.insert(BACKGROUND_TAG, 0);
        MaterialCatalog {
            elements,
            materials: vec![air],
            tag_to_index,
        }
    }

    /// Loads the standard element table from the two aligned streams.
    pub fn load(composition: TokenReader, names: TokenReader) -> PhantomResult<Self> {
        Self::load_with_elements(ElementTable::standard(), composition, names)
    }

    /// Reads `ECompDensity.txt` and `OrgantagvsName.txt` from `dir`.
    pub fn load_from_dir(dir: &Path) -> PhantomResult<Self> {
        let composition = TokenReader::open(&dir.join(COMPOSITION_FILE))?;
        let names = TokenReader::open(&dir.join(ORGAN_NAME_FILE))?;
        Self::load(composition, names)
    }

    /// Composition records are `tag f_1 .. f_n density` with percentages per
    /// element slot; name records are `tag name`. Both streams enumerate the
    /// tags in the same order.
    pub fn load_with_elements(
        elements: ElementTable,
        mut composition: TokenReader,
        mut names: TokenReader,
    ) -> PhantomResult<Self> {
        let mut catalog = MaterialCatalog::with_background(elements);
        let count: usize = composition.next("material count")?;
        let slots: Vec<usize> = catalog.elements.iter().map(|(slot, _)| slot).collect();

        for _ in 0..count {
            let tag: u32 = composition.next("organ tag")?;
            let mut fractions = BTreeMap::new();
            for &slot in &slots {
                let percent: f64 = composition.next("element fraction")?;
                if percent > 0.0 {
                    fractions.insert(slot, percent / 100.0);
                }
            }
            let density: f64 = composition.next("density")?;
            if !(density > 0.0) {
                return Err(PhantomError::parse(
                    composition.path(),
                    "density",
                    format!("tag {tag} has non-positive density {density}"),
                ));
            }

            let name_tag: u32 = names.next("organ tag")?;
            let name: String = names.next("organ name")?;
            if name_tag != tag {
                return Err(PhantomError::integrity(
                    names.path(),
                    format!(
                        "organ tag {name_tag} ('{name}') does not match tag {tag} in {}",
                        composition.path().display()
                    ),
                ));
            }

            catalog.insert(
                Material {
                    name,
                    organ_tag: tag,
                    density,
                    composition: fractions,
                },
                composition.path(),
            )?;
        }

        info!(
            materials = catalog.materials.len(),
            source = %composition.path().display(),
            "material catalog loaded"
        );
        Ok(catalog)
    }

    fn insert(&mut self, material: Material, source: &Path) -> PhantomResult<MaterialIndex> {
        let tag = material.organ_tag;
        if self.tag_to_index.contains_key(&tag) {
            let reason = if tag == BACKGROUND_TAG {
                format!("organ tag {tag} is reserved for the background medium")
            } else {
                format!("organ tag {tag} is defined twice")
            };
            return Err(PhantomError::integrity(source, reason));
        }

        let index = self.materials.len();
        debug!(
            tag,
            index,
            name = %material.name,
            density = material.density,
            elements = material.composition.len(),
            "catalogued material"
        );
        self.tag_to_index.insert(tag, index);
        self.materials.push(material);
        Ok(index)
    }

    /// Material index of an organ tag; `UnknownTag` if it was never catalogued.
    pub fn material_index_for_tag(&self, tag: u32) -> PhantomResult<MaterialIndex> {
        self.tag_to_index
            .get(&tag)
            .copied()
            .ok_or(PhantomError::UnknownTag { tag, file: None })
    }

    /// Resolves a subset of tags, in the order given.
    pub fn materials_of_interest(&self, tags: &[u32]) -> PhantomResult<Vec<MaterialIndex>> {
        tags.iter()
            .map(|&tag| self.material_index_for_tag(tag))
            .collect()
    }

    /// Resolves organ names, in the order given.
    pub fn materials_named(&self, names: &[String]) -> PhantomResult<Vec<MaterialIndex>> {
        names
            .iter()
            .map(|name| {
                self.materials
                    .iter()
                    .position(|m| &m.name == name)
                    .ok_or_else(|| PhantomError::UnknownMaterial { name: name.clone() })
            })
            .collect()
    }

    /// Material at `index`.
    pub fn material(&self, index: MaterialIndex) -> Option<&Material> {
        self.materials.get(index)
    }

    /// All materials, background first.
    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    /// Element table used for the compositions.
    pub fn elements(&self) -> &ElementTable {
        &self.elements
    }

    /// Number of materials including the background.
    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(tag: u32, percents: &[(usize, f64)], density: f64) -> String {
        let mut cols = vec![0.0; 14];
        for &(slot, pct) in percents {
            cols[slot - 1] = pct;
        }
        let cols: Vec<String> = cols.iter().map(|c| c.to_string()).collect();
        format!("{tag} {} {density}\n", cols.join(" "))
    }

    fn reader(label: &str, text: String) -> TokenReader {
        TokenReader::from_reader(label, std::io::Cursor::new(text.into_bytes()))
    }

    fn two_tissues() -> MaterialCatalog {
        let comp = format!(
            "2\n{}{}",
            row(1, &[(1, 10.5), (2, 25.0), (4, 64.5)], 1.05),
            row(5, &[(1, 3.4), (7, 10.3), (12, 22.5), (4, 63.8)], 1.92)
        );
        let names = "1 Adipose\n5 Cortical_bone\n".to_string();
        MaterialCatalog::load(reader("comp", comp), reader("names", names)).unwrap()
    }

    #[test]
    fn background_is_index_zero() {
        let catalog = two_tissues();
        assert_eq!(catalog.material_index_for_tag(0).unwrap(), 0);
        let air = catalog.material(0).unwrap();
        assert_eq!(air.name, "Air");
        assert!((air.mass_fraction_sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tags_map_to_load_order() {
        let catalog = two_tissues();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.material_index_for_tag(1).unwrap(), 1);
        assert_eq!(catalog.material_index_for_tag(5).unwrap(), 2);

        let bone = catalog.material(2).unwrap();
        assert_eq!(bone.name, "Cortical_bone");
        assert_eq!(bone.density, 1.92);
        assert_eq!(bone.composition.len(), 4);
        assert!((bone.composition[&12] - 0.225).abs() < 1e-12);
        assert!(!bone.composition.contains_key(&2));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let catalog = two_tissues();
        assert!(matches!(
            catalog.material_index_for_tag(9),
            Err(PhantomError::UnknownTag { tag: 9, .. })
        ));
        assert!(catalog.materials_of_interest(&[5, 9]).is_err());
    }

    #[test]
    fn materials_of_interest_keep_requested_order() {
        let catalog = two_tissues();
        assert_eq!(catalog.materials_of_interest(&[5, 1, 0]).unwrap(), vec![2, 1, 0]);
        let named = catalog
            .materials_named(&["Adipose".to_string(), "Air".to_string()])
            .unwrap();
        assert_eq!(named, vec![1, 0]);
        assert!(matches!(
            catalog.materials_named(&["Liver".to_string()]),
            Err(PhantomError::UnknownMaterial { .. })
        ));
    }

    #[test]
    fn mismatched_streams_fail_integrity() {
        let comp = format!("1\n{}", row(3, &[(1, 100.0)], 1.0));
        let result = MaterialCatalog::load(reader("comp", comp), reader("names", "4 Liver\n".into()));
        assert!(matches!(result, Err(PhantomError::DataIntegrity { .. })));
    }

    #[test]
    fn reserved_and_duplicate_tags_fail_integrity() {
        let comp = format!("1\n{}", row(0, &[(1, 100.0)], 1.0));
        let result = MaterialCatalog::load(reader("comp", comp), reader("names", "0 Water\n".into()));
        assert!(matches!(result, Err(PhantomError::DataIntegrity { .. })));

        let comp = format!("2\n{}{}", row(2, &[(1, 100.0)], 1.0), row(2, &[(1, 100.0)], 1.0));
        let result = MaterialCatalog::load(
            reader("comp", comp),
            reader("names", "2 A\n2 B\n".into()),
        );
        assert!(matches!(result, Err(PhantomError::DataIntegrity { .. })));
    }

    #[test]
    fn truncated_composition_is_a_parse_error() {
        let result = MaterialCatalog::load(
            reader("comp", "1\n3 10 20\n".into()),
            reader("names", "3 Liver\n".into()),
        );
        assert!(matches!(result, Err(PhantomError::Parse { .. })));
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MaterialCatalog::load_from_dir(dir.path()),
            Err(PhantomError::FileNotFound { .. })
        ));
    }

    #[test]
    fn extra_elements_are_data() {
        let table = ElementTable::standard().with_element(15, element("Pb", "Lead", 82, 207.2));
        assert_eq!(table.len(), 15);
        assert_eq!(table.slot_of("Pb"), Some(15));
        assert_eq!(table.get(4).map(|e| e.symbol), Some("O"));
    }
}
