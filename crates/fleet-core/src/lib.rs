//! Core domain model for listing snapshot reconciliation: listings, snapshot
//! rows, change sets and the schema variants that map spreadsheet columns
//! onto semantic fields.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fleet-core";

/// Pseudo-field name under which a listing's status takes part in change detection.
pub const STATUS_FIELD: &str = "status";

/// Names a variant may not give its fields: they are listing columns or JSON keys.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "vin",
    "variant",
    STATUS_FIELD,
    "photos",
    "is_new",
    "old_price",
    "changed_columns",
    "created_at",
    "updated_at",
];

/// Semantic field name -> raw cell string.
pub type FieldMap = BTreeMap<String, String>;

/// Read access to named string values, shared by persisted listings,
/// incoming snapshot rows and plain field maps.
pub trait FieldSource {
    fn value(&self, field: &str) -> Option<&str>;
}

impl FieldSource for FieldMap {
    fn value(&self, field: &str) -> Option<&str> {
        self.get(field).map(String::as_str)
    }
}

/// Ordered, duplicate-free list of field names that differ between persisted
/// and incoming state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(Vec<String>);

impl ChangeSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends `field` unless it is already present.
    pub fn push(&mut self, field: impl Into<String>) {
        let field = field.into();
        if !self.0.contains(&field) {
            self.0.push(field);
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|f| f == field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<S: Into<String>> FromIterator<S> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = ChangeSet::new();
        for field in iter {
            set.push(field);
        }
        set
    }
}

/// The reconciled entity as persisted in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Store-assigned identity; `None` until inserted.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "vin")]
    pub key: String,
    pub variant: String,
    #[serde(flatten)]
    pub fields: FieldMap,
    #[serde(rename = "old_price", default, skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<String>,
    pub status: String,
    #[serde(default)]
    pub photos: Vec<String>,
    pub is_new: bool,
    #[serde(rename = "changed_columns", default)]
    pub changed_fields: ChangeSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Listing {
    /// A freshly sighted listing built from a snapshot row.
    pub fn from_row(variant: &str, row: &SnapshotRow, photos: Vec<String>) -> Self {
        Self {
            id: None,
            key: row.key.clone(),
            variant: variant.to_string(),
            fields: row.fields.clone(),
            previous_price: None,
            status: row.status.clone(),
            photos,
            is_new: true,
            changed_fields: ChangeSet::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

impl FieldSource for Listing {
    fn value(&self, field: &str) -> Option<&str> {
        if field == STATUS_FIELD {
            Some(&self.status)
        } else {
            self.field(field)
        }
    }
}

/// One extracted data row of a snapshot. Lives only for the duration of a
/// reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRow {
    /// 1-based spreadsheet row number (the header is row 1).
    pub row_number: usize,
    pub key: String,
    pub status: String,
    pub fields: FieldMap,
    /// Photo links read from the variant's photo columns, if it has any.
    pub photos: Vec<String>,
}

impl SnapshotRow {
    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }
}

impl FieldSource for SnapshotRow {
    fn value(&self, field: &str) -> Option<&str> {
        if field == STATUS_FIELD {
            Some(&self.status)
        } else {
            self.fields.get(field).map(String::as_str)
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing variant config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("variant name must not be empty")]
    EmptyName,
    #[error("variant `{0}` is declared more than once")]
    DuplicateVariant(String),
    #[error("variant `{variant}`: invalid column `{column}`")]
    InvalidColumn { variant: String, column: String },
    #[error("variant `{variant}`: field `{field}` is declared more than once")]
    DuplicateField { variant: String, field: String },
    #[error("variant `{variant}`: field name `{field}` is reserved")]
    ReservedField { variant: String, field: String },
    #[error("variant `{variant}`: {context} refers to undeclared field `{field}`")]
    UnknownField {
        variant: String,
        field: String,
        context: &'static str,
    },
    #[error("variant `{variant}`: {reason}")]
    Status { variant: String, reason: String },
    #[error("no variants configured")]
    NoVariants,
}

/// Converts a spreadsheet column label (`A`, `Z`, `AA`, `BA`, ...) into a
/// 0-based column position.
pub fn column_index(label: &str) -> Option<usize> {
    let label = label.trim();
    if label.is_empty() || label.len() > 3 {
        return None;
    }
    let mut index = 0usize;
    for c in label.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as usize + 1;
        index = index * 26 + digit;
    }
    Some(index - 1)
}

/// Inverse of [`column_index`], used in log and error messages.
pub fn column_label(mut index: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Per-variant table of semantic field -> column position, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    entries: Vec<(String, usize)>,
}

impl ColumnMapping {
    pub fn position(&self, field: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, pos)| *pos)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.position(field).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(name, pos)| (name.as_str(), *pos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a variant decides whether a row is still on sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRule {
    pub column: Option<usize>,
    pub accepted: Vec<String>,
    /// Used when the status cell is blank or the variant has no status column.
    pub default: Option<String>,
}

impl StatusRule {
    pub fn is_accepted(&self, status: &str) -> bool {
        self.accepted.iter().any(|a| a == status)
    }
}

/// A validated schema variant. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVariant {
    name: String,
    key_column: usize,
    price_field: String,
    status: StatusRule,
    columns: ColumnMapping,
    tracked: Vec<String>,
    photo_columns: Vec<usize>,
}

impl SchemaVariant {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    pub fn price_field(&self) -> &str {
        &self.price_field
    }

    pub fn status_rule(&self) -> &StatusRule {
        &self.status
    }

    pub fn columns(&self) -> &ColumnMapping {
        &self.columns
    }

    /// Fields considered for change detection, in their fixed output order.
    pub fn tracked_fields(&self) -> &[String] {
        &self.tracked
    }

    pub fn photo_columns(&self) -> &[usize] {
        &self.photo_columns
    }

    pub fn is_accepted(&self, status: &str) -> bool {
        self.status.is_accepted(status)
    }
}

/// Serialized form of a variant, as written in `variants.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariantSpec {
    pub name: String,
    pub key_column: String,
    pub price_field: String,
    pub status: StatusSpec,
    pub fields: Vec<FieldSpec>,
    pub tracked: Vec<String>,
    #[serde(default)]
    pub photo_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusSpec {
    #[serde(default)]
    pub column: Option<String>,
    pub accepted: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldSpec {
    pub name: String,
    pub column: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariantsFile {
    pub variants: Vec<VariantSpec>,
}

impl TryFrom<VariantSpec> for SchemaVariant {
    type Error = ConfigError;

    fn try_from(spec: VariantSpec) -> Result<Self, Self::Error> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        let col = |label: &str| {
            column_index(label).ok_or_else(|| ConfigError::InvalidColumn {
                variant: name.clone(),
                column: label.to_string(),
            })
        };

        let key_column = col(&spec.key_column)?;

        let mut entries = Vec::with_capacity(spec.fields.len());
        for field in &spec.fields {
            if RESERVED_FIELDS.contains(&field.name.as_str()) {
                return Err(ConfigError::ReservedField {
                    variant: name.clone(),
                    field: field.name.clone(),
                });
            }
            if entries.iter().any(|(n, _)| n == &field.name) {
                return Err(ConfigError::DuplicateField {
                    variant: name.clone(),
                    field: field.name.clone(),
                });
            }
            entries.push((field.name.clone(), col(&field.column)?));
        }
        let columns = ColumnMapping { entries };

        if !columns.contains(&spec.price_field) {
            return Err(ConfigError::UnknownField {
                variant: name.clone(),
                field: spec.price_field.clone(),
                context: "price_field",
            });
        }

        let mut seen = BTreeSet::new();
        for field in &spec.tracked {
            if !seen.insert(field.as_str()) {
                return Err(ConfigError::DuplicateField {
                    variant: name.clone(),
                    field: field.clone(),
                });
            }
            if field != STATUS_FIELD && !columns.contains(field) {
                return Err(ConfigError::UnknownField {
                    variant: name.clone(),
                    field: field.clone(),
                    context: "tracked",
                });
            }
        }

        let status_column = spec.status.column.as_deref().map(col).transpose()?;
        if spec.status.accepted.is_empty() {
            return Err(ConfigError::Status {
                variant: name.clone(),
                reason: "at least one accepted status is required".into(),
            });
        }
        if status_column.is_none() && spec.status.default.is_none() {
            return Err(ConfigError::Status {
                variant: name.clone(),
                reason: "a status column or a default status is required".into(),
            });
        }

        let photo_columns = spec
            .photo_columns
            .iter()
            .map(|label| col(label))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            key_column,
            price_field: spec.price_field,
            status: StatusRule {
                column: status_column,
                accepted: spec.status.accepted,
                default: spec.status.default,
            },
            columns,
            tracked: spec.tracked,
            photo_columns,
        })
    }
}

/// Column layouts of the three upstream export formats.
pub const BUILTIN_VARIANTS_YAML: &str = r#"
variants:
  - name: v1
    key_column: G
    price_field: approved_price
    status:
      column: AN
      accepted: ["В продаже"]
    fields:
      - { name: subject, column: B }
      - { name: location, column: AD }
      - { name: subject_type, column: E }
      - { name: vehicle_type, column: F }
      - { name: year, column: K }
      - { name: mileage, column: L }
      - { name: days_on_sale, column: O }
      - { name: approved_price, column: Q }
    tracked: [subject, subject_type, vehicle_type, mileage, approved_price, status]

  - name: v2
    key_column: D
    price_field: actual_price
    status:
      accepted: ["В продаже"]
      default: "В продаже"
    fields:
      - { name: brand, column: I }
      - { name: model, column: J }
      - { name: exposure_period, column: C }
      - { name: vehicle_type, column: F }
      - { name: vehicle_subtype, column: G }
      - { name: year, column: N }
      - { name: mileage, column: AK }
      - { name: city, column: L }
      - { name: actual_price, column: K }
    tracked: [brand, model, vehicle_type, vehicle_subtype, year, mileage, city, actual_price]
    photo_columns: [AU, AT, AS, AR, AQ]

  - name: v3
    key_column: F
    price_field: actual_price
    status:
      column: C
      accepted: ["В свободной продаже"]
    fields:
      - { name: brand, column: K }
      - { name: model, column: L }
      - { name: exposure_period, column: AW }
      - { name: vehicle_type, column: G }
      - { name: vehicle_subtype, column: H }
      - { name: year, column: R }
      - { name: mileage, column: BA }
      - { name: city, column: P }
      - { name: actual_price, column: N }
    tracked: [brand, model, vehicle_type, vehicle_subtype, year, mileage, city, actual_price, status]
"#;

/// All configured variants, loaded once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct VariantRegistry {
    variants: BTreeMap<String, Arc<SchemaVariant>>,
}

impl VariantRegistry {
    pub fn from_specs(specs: Vec<VariantSpec>) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::NoVariants);
        }
        let mut variants = BTreeMap::new();
        for spec in specs {
            let variant = SchemaVariant::try_from(spec)?;
            let name = variant.name().to_string();
            if variants.insert(name.clone(), Arc::new(variant)).is_some() {
                return Err(ConfigError::DuplicateVariant(name));
            }
        }
        Ok(Self { variants })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: VariantsFile = serde_yaml::from_str(yaml)?;
        Self::from_specs(file.variants)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml_str(BUILTIN_VARIANTS_YAML)
    }

    /// Variants from `path` when given, the built-in set otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaVariant>> {
        self.variants.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.variants.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaVariant> {
        self.variants.values().map(|v| v.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec() -> VariantSpec {
        VariantSpec {
            name: "t".into(),
            key_column: "A".into(),
            price_field: "price".into(),
            status: StatusSpec {
                column: Some("B".into()),
                accepted: vec!["on sale".into()],
                default: None,
            },
            fields: vec![
                FieldSpec { name: "price".into(), column: "C".into() },
                FieldSpec { name: "days".into(), column: "D".into() },
            ],
            tracked: vec!["price".into(), "status".into()],
            photo_columns: vec![],
        }
    }

    #[test]
    fn column_labels_round_trip_known_positions() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("z"), Some(25));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("AD"), Some(29));
        assert_eq!(column_index("AN"), Some(39));
        assert_eq!(column_index("BA"), Some(52));
        assert_eq!(column_label(52), "BA");
        assert_eq!(column_label(0), "A");
        assert_eq!(column_index(""), None);
        assert_eq!(column_index("A1"), None);
    }

    #[test]
    fn builtin_variants_load_and_exclude_display_only_fields() {
        let registry = VariantRegistry::builtin().expect("builtin variants");
        assert_eq!(registry.names(), vec!["v1", "v2", "v3"]);

        let v1 = registry.get("v1").unwrap();
        assert_eq!(v1.key_column(), 6);
        assert_eq!(v1.columns().position("location"), Some(29));
        assert!(v1.is_accepted("В продаже"));
        assert!(!v1.is_accepted("Продан"));
        assert!(!v1.tracked_fields().iter().any(|f| f == "days_on_sale"));

        let v2 = registry.get("v2").unwrap();
        assert_eq!(v2.status_rule().column, None);
        assert_eq!(v2.photo_columns().len(), 5);
        assert!(!v2.tracked_fields().iter().any(|f| f == "exposure_period"));

        let v3 = registry.get("v3").unwrap();
        assert!(v3.is_accepted("В свободной продаже"));
        assert_eq!(v3.tracked_fields().last().map(String::as_str), Some("status"));
    }

    #[test]
    fn undeclared_tracked_field_is_a_config_error() {
        let mut spec = minimal_spec();
        spec.tracked.push("colour".into());
        let err = SchemaVariant::try_from(spec).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { ref field, .. } if field == "colour"));
    }

    #[test]
    fn reserved_field_names_are_rejected() {
        for reserved in ["vin", "photos", "status", "old_price"] {
            let mut spec = minimal_spec();
            spec.fields.push(FieldSpec {
                name: reserved.into(),
                column: "E".into(),
            });
            let err = SchemaVariant::try_from(spec).unwrap_err();
            assert!(
                matches!(err, ConfigError::ReservedField { ref field, .. } if field == reserved),
                "{reserved}: {err}"
            );
        }
    }

    #[test]
    fn undeclared_price_field_is_a_config_error() {
        let mut spec = minimal_spec();
        spec.price_field = "cost".into();
        assert!(matches!(
            SchemaVariant::try_from(spec),
            Err(ConfigError::UnknownField { context: "price_field", .. })
        ));
    }

    #[test]
    fn bad_column_label_is_rejected() {
        let mut spec = minimal_spec();
        spec.fields[0].column = "C3".into();
        assert!(matches!(
            SchemaVariant::try_from(spec),
            Err(ConfigError::InvalidColumn { .. })
        ));
    }

    #[test]
    fn status_needs_column_or_default() {
        let mut spec = minimal_spec();
        spec.status.column = None;
        assert!(matches!(SchemaVariant::try_from(spec), Err(ConfigError::Status { .. })));
    }

    #[test]
    fn duplicate_variant_names_are_rejected() {
        let err = VariantRegistry::from_specs(vec![minimal_spec(), minimal_spec()]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateVariant(name) if name == "t"));
    }

    #[test]
    fn registry_loads_from_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("variants.yaml");
        std::fs::write(&path, BUILTIN_VARIANTS_YAML).expect("write");
        let registry = VariantRegistry::load(Some(&path)).expect("load");
        assert!(registry.get("v2").is_some());
        assert!(matches!(
            VariantRegistry::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn change_set_keeps_first_insertion_order_without_duplicates() {
        let set: ChangeSet = ["price", "status", "price"].into_iter().collect();
        assert_eq!(set.as_slice(), &["price".to_string(), "status".to_string()]);
        assert!(set.contains("status"));
    }

    #[test]
    fn listing_serializes_with_flattened_fields() {
        let row = SnapshotRow {
            row_number: 2,
            key: "VIN1".into(),
            status: "on sale".into(),
            fields: FieldMap::from([("price".to_string(), "100".to_string())]),
            photos: vec![],
        };
        let listing = Listing::from_row("t", &row, vec![]);
        let json = serde_json::to_value(&listing).expect("json");
        assert_eq!(json["vin"], "VIN1");
        assert_eq!(json["price"], "100");
        assert_eq!(json["is_new"], true);
        assert!(json.get("old_price").is_none());
        assert_eq!(json["photos"], serde_json::json!([]));
        assert_eq!(json["changed_columns"], serde_json::json!([]));
    }
}
