//! Structural contracts that schema groups are validated against.
//!
//! A group names its contract through `nx_model`. The contract lists which
//! children the group may declare, whether each is a group or a dataset,
//! which `attributes` a dataset may carry, and the group's default
//! attribute. Children that the contract does not mention are extensions:
//! they are materialized but never checked.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Contract used for devices that declare no schema of their own.
pub const GENERAL_MODEL: &str = "NXgeneralModel";

/// How a contract child's name is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamePattern {
    Exact(String),
    /// NeXus-style template (`AXISNAME_end`): any name ending in `suffix`.
    Template { display: String, suffix: String },
}

impl NamePattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(exact) => exact == name,
            NamePattern::Template { suffix, .. } => {
                if suffix.is_empty() {
                    !name.is_empty()
                } else {
                    name.len() > suffix.len() && name.ends_with(suffix.as_str())
                }
            }
        }
    }

    pub fn display(&self) -> &str {
        match self {
            NamePattern::Exact(name) => name,
            NamePattern::Template { display, .. } => display,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildKind {
    Dataset,
    /// Sub-group, optionally bound to a contract of its own.
    Group { model: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractChild {
    pub name: NamePattern,
    pub kind: ChildKind,
    pub required: bool,
    /// Attributes a dataset child may declare under `attributes`.
    pub attributes: Vec<AttributeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub name: String,
    pub default: Option<String>,
    /// Open contracts accept any group `attributes`.
    pub open: bool,
    pub attributes: Vec<AttributeSpec>,
    pub children: Vec<ContractChild>,
}

impl Contract {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            open: false,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn open(mut self) -> Self {
        self.open = true;
        self
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    pub fn with_attributes(mut self, names: &[&str]) -> Self {
        self.attributes.extend(names.iter().map(|name| AttributeSpec {
            name: name.to_string(),
            required: false,
        }));
        self
    }

    pub fn datasets(mut self, names: &[&str]) -> Self {
        for name in names {
            self.children.push(ContractChild {
                name: NamePattern::Exact(name.to_string()),
                kind: ChildKind::Dataset,
                required: false,
                attributes: Vec::new(),
            });
        }
        self
    }

    pub fn required_dataset(mut self, name: &str) -> Self {
        self.children.push(ContractChild {
            name: NamePattern::Exact(name.to_string()),
            kind: ChildKind::Dataset,
            required: true,
            attributes: Vec::new(),
        });
        self
    }

    /// Dataset template; `attributes` pairs are `(name, required)`.
    pub fn dataset_template(
        mut self,
        display: &str,
        suffix: &str,
        attributes: &[(&str, bool)],
    ) -> Self {
        self.children.push(ContractChild {
            name: NamePattern::Template {
                display: display.to_string(),
                suffix: suffix.to_string(),
            },
            kind: ChildKind::Dataset,
            required: false,
            attributes: attributes
                .iter()
                .map(|(name, required)| AttributeSpec {
                    name: name.to_string(),
                    required: *required,
                })
                .collect(),
        });
        self
    }

    pub fn group(mut self, name: &str, model: Option<&str>) -> Self {
        self.children.push(ContractChild {
            name: NamePattern::Exact(name.to_string()),
            kind: ChildKind::Group {
                model: model.map(str::to_string),
            },
            required: false,
            attributes: Vec::new(),
        });
        self
    }

    /// Contract entry for a child of the given kind.
    ///
    /// Exact names match regardless of kind, so a kind mismatch can be
    /// reported. Templates only match children of their own kind; longer
    /// suffixes are tried first.
    pub fn child(&self, name: &str, is_group: bool) -> Option<&ContractChild> {
        if let Some(exact) = self
            .children
            .iter()
            .find(|child| matches!(&child.name, NamePattern::Exact(n) if n == name))
        {
            return Some(exact);
        }

        self.children
            .iter()
            .filter(|child| matches!(child.name, NamePattern::Template { .. }))
            .filter(|child| matches!(child.kind, ChildKind::Group { .. }) == is_group)
            .filter(|child| child.name.matches(name))
            .max_by_key(|child| match &child.name {
                NamePattern::Template { suffix, .. } => suffix.len(),
                NamePattern::Exact(_) => 0,
            })
    }

    pub fn required_children(&self) -> impl Iterator<Item = &ContractChild> {
        self.children.iter().filter(|child| child.required)
    }
}

/// Registry of contracts by model name.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, Contract>,
}

static BUILTIN: Lazy<ContractRegistry> = Lazy::new(|| {
    let mut registry = ContractRegistry::default();
    for contract in builtin_contracts() {
        registry.register(contract);
    }
    registry
});

impl ContractRegistry {
    /// Registry preloaded with the standard contracts.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Add or replace a contract.
    pub fn register(&mut self, contract: Contract) {
        self.contracts.insert(contract.name.clone(), contract);
    }

    pub fn get(&self, name: &str) -> Option<&Contract> {
        self.contracts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.contracts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

const TRANSFORMATIONS: Option<&str> = Some("NXtransformationsModel");

fn builtin_contracts() -> Vec<Contract> {
    vec![
        Contract::new(GENERAL_MODEL).open(),
        Contract::new("NXcollectionModel").open(),
        Contract::new("NXmonochromatorModel")
            .with_default("energy")
            .datasets(&[
                "wavelength",
                "wavelength_errors",
                "energy",
                "energy_errors",
                "depends_on",
            ])
            .group("distribution", Some("NXdataModel"))
            .group("OFF_GEOMETRY", None)
            .group("CRYSTAL", Some("NXcrystalModel"))
            .group("GRATING", Some("NXgratingModel"))
            .group("TRANSFORMATIONS", TRANSFORMATIONS),
        Contract::new("NXgratingModel")
            .with_default("diffraction_order")
            .datasets(&[
                "angles",
                "period",
                "duty_cycle",
                "depth",
                "diffraction_order",
                "deflection_angle",
                "interior_atmosphere",
                "substrate_material",
                "substrate_density",
                "substrate_thickness",
                "coating_material",
                "substrate_roughness",
                "coating_roughness",
                "layer_thickness",
                "depends_on",
            ])
            .group("figure_data", Some("NXdataModel"))
            .group("OFF_GEOMETRY", None)
            .group("TRANSFORMATIONS", TRANSFORMATIONS),
        Contract::new("NXcrystalModel")
            .with_default("wavelength")
            .datasets(&[
                "usage",
                "type",
                "chemical_formula",
                "order_no",
                "cut_angle",
                "space_group",
                "unit_cell",
                "orientation_matrix",
                "wavelength",
                "d_spacing",
                "scattering_vector",
                "reflection",
                "thickness",
                "density",
                "polar_angle",
                "azimuthal_angle",
                "bragg_angle",
                "temperature",
                "depends_on",
            ])
            .group("temperature_log", Some("NXlogModel"))
            .group("reflectivity", Some("NXdataModel"))
            .group("transmission", Some("NXdataModel"))
            .group("OFF_GEOMETRY", None)
            .group("TRANSFORMATIONS", TRANSFORMATIONS),
        Contract::new("NXtransformationsModel")
            .with_default("vector")
            .dataset_template("AXISNAME_end", "_end", &[])
            .dataset_template("AXISNAME_increment_set", "_increment_set", &[])
            .dataset_template(
                "AXISNAME",
                "",
                &[
                    ("transformation_type", false),
                    ("vector", true),
                    ("offset", false),
                    ("offset_units", false),
                    ("depends_on", false),
                    ("equipment_component", false),
                ],
            ),
        Contract::new("NXpositionerModel")
            .with_default("value")
            .datasets(&[
                "name",
                "description",
                "value",
                "raw_value",
                "target_value",
                "tolerance",
                "soft_limit_min",
                "soft_limit_max",
                "velocity",
                "acceleration_time",
                "controller_record",
                "depends_on",
            ])
            .group("TRANSFORMATIONS", TRANSFORMATIONS),
        Contract::new("NXdetectorModel")
            .with_default("data")
            .datasets(&[
                "data",
                "data_errors",
                "time_of_flight",
                "raw_time_of_flight",
                "detector_number",
                "x_pixel_offset",
                "y_pixel_offset",
                "distance",
                "polar_angle",
                "azimuthal_angle",
                "description",
                "serial_number",
                "local_name",
                "x_pixel_size",
                "y_pixel_size",
                "dead_time",
                "type",
                "real_time",
                "start_time",
                "stop_time",
                "count_time",
                "sequence_number",
                "acquisition_mode",
                "gain_setting",
                "saturation_value",
                "sensor_material",
                "sensor_thickness",
                "threshold_energy",
                "depends_on",
            ])
            .group("calibration_method", Some("NXnoteModel"))
            .group("data_file", Some("NXnoteModel"))
            .group("COLLECTION", Some("NXcollectionModel"))
            .group("TRANSFORMATIONS", TRANSFORMATIONS),
        Contract::new("NXdataModel")
            .with_attributes(&["signal", "axes", "auxiliary_signals"])
            .datasets(&["scaling_factor", "offset", "title", "x", "y", "z"])
            .dataset_template("FIELDNAME_errors", "_errors", &[])
            .dataset_template("DATA", "", &[]),
        Contract::new("NXmonitorModel")
            .with_default("data")
            .datasets(&[
                "mode",
                "start_time",
                "end_time",
                "preset",
                "distance",
                "range",
                "nominal",
                "integral",
                "type",
                "time_of_flight",
                "efficiency",
                "data",
                "sampled_fraction",
                "count_time",
                "depends_on",
            ])
            .group("integral_log", Some("NXlogModel"))
            .group("GEOMETRY", None)
            .group("OFF_GEOMETRY", None)
            .group("TRANSFORMATIONS", TRANSFORMATIONS),
        Contract::new("NXnoteModel")
            .with_default("author")
            .datasets(&[
                "author",
                "date",
                "type",
                "file_name",
                "description",
                "sequence_index",
                "data",
            ]),
        Contract::new("NXlogModel")
            .with_default("value")
            .datasets(&[
                "time",
                "value",
                "raw_value",
                "description",
                "average_value",
                "average_value_errors",
                "minimum_value",
                "maximum_value",
                "duration",
                "cue_timestamp_zero",
                "cue_index",
            ]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = ContractRegistry::builtin();
        for name in [
            "NXgeneralModel",
            "NXmonochromatorModel",
            "NXgratingModel",
            "NXcrystalModel",
            "NXtransformationsModel",
            "NXpositionerModel",
            "NXdetectorModel",
            "NXdataModel",
            "NXmonitorModel",
            "NXcollectionModel",
            "NXnoteModel",
            "NXlogModel",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_template_matching() {
        let registry = ContractRegistry::builtin();
        let transformations = registry.get("NXtransformationsModel").unwrap();

        let end = transformations.child("alpha_end", false).unwrap();
        assert_eq!(end.name.display(), "AXISNAME_end");

        let axis = transformations.child("alpha", false).unwrap();
        assert_eq!(axis.name.display(), "AXISNAME");
        assert!(axis.attributes.iter().any(|a| a.name == "vector" && a.required));

        // templates only cover datasets here, so a group is an extension
        assert!(transformations.child("alpha", true).is_none());
    }

    #[test]
    fn test_exact_match_ignores_kind() {
        let registry = ContractRegistry::builtin();
        let mono = registry.get("NXmonochromatorModel").unwrap();
        let grating = mono.child("GRATING", false).unwrap();
        assert_eq!(
            grating.kind,
            ChildKind::Group {
                model: Some("NXgratingModel".into())
            }
        );
        assert!(mono.child("someGroup", true).is_none());
    }

    #[test]
    fn test_register_custom_contract() {
        let mut registry = ContractRegistry::builtin();
        registry.register(Contract::new("NXslitModel").required_dataset("x_gap"));
        let slit = registry.get("NXslitModel").unwrap();
        assert_eq!(slit.required_children().count(), 1);
    }
}
