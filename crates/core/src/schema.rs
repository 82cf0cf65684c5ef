//! Tenant table schemas.
//!
//! A workspace configures its own tables; each table carries an ordered list
//! of [`FieldSpec`] entries describing the columns the assistant may collect.
//! The core treats these as read-only input owned by the table-configuration
//! collaborator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Integer,
    Currency,
    Date,
    Time,
    Phone,
    Email,
    Url,
    Boolean,
    Select,
    Relation,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Integer | Self::Currency)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Text | Self::Email | Self::Url | Self::Phone)
    }
}

/// A named validation rule attached to a field beyond its base type check.
/// Each rule carries its own failure message override.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum CustomRule {
    NotEmpty,
    IsPositive,
    IsNegative,
    IsInteger,
    IsDecimal,
    MinLength(usize),
    MaxLength(usize),
    ExactLength(usize),
    Contains(String),
    NotContains(String),
    StartsWith(String),
    EndsWith(String),
    Matches(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomRuleSpec {
    #[serde(flatten)]
    pub rule: CustomRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Exact digit count for phone fields. Defaults to 10 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allow_negative: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_rules: Vec<CustomRuleSpec>,
}

/// Relation target for `FieldType::Relation` fields. The value of such a
/// field must resolve to a record in `table_name`; `auto_create` permits the
/// engine to open a nested collection flow when no match exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub table_name: String,
    pub search_field: String,
    pub display_field: String,
    #[serde(default)]
    pub auto_create: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationSpec>,
    /// Phrasing the assistant uses when asking for this field. Also matched
    /// against the previous assistant message to infer which field an
    /// unlabeled reply answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_prompt: Option<String>,
    /// Collection order; lower asks first. Unset sorts after all set values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl FieldSpec {
    pub fn new(key: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            field_type,
            required: false,
            options: Vec::new(),
            validation: None,
            default_value: None,
            relation: None,
            ask_prompt: None,
            priority: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_validation(mut self, validation: ValidationRules) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_relation(mut self, relation: RelationSpec) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn with_ask_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.ask_prompt = Some(prompt.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub id: TableId,
    pub workspace_id: String,
    pub name: String,
    pub fields: Vec<FieldSpec>,
    /// Conditional rules evaluated against the draft before it is written.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<crate::rules::Rule>,
}

impl TableConfig {
    pub fn required_field_keys(&self) -> Vec<String> {
        let mut keys: Vec<&FieldSpec> = self.fields.iter().filter(|f| f.required).collect();
        keys.sort_by_key(|f| f.priority.unwrap_or(u32::MAX));
        keys.into_iter().map(|f| f.key.clone()).collect()
    }

    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Structural heuristic used when the oracle names a table that cannot be
    /// resolved: a table with both a date-typed and a time-typed field is
    /// treated as the tenant's appointment book.
    pub fn looks_like_appointments(&self) -> bool {
        let has_date = self.fields.iter().any(|f| f.field_type == FieldType::Date);
        let has_time = self.fields.iter().any(|f| f.field_type == FieldType::Time);
        has_date && has_time
    }

    pub fn default_values(&self) -> serde_json::Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|f| f.default_value.clone().map(|v| (f.key.clone(), v)))
            .collect()
    }
}

/// Case- and accent-insensitive-ish name normalization used everywhere a
/// tenant table name is compared against oracle output.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Singular/plural-insensitive comparison for Spanish and English table
/// names ("cita" vs "citas", "client" vs "clients").
pub fn names_match_loosely(a: &str, b: &str) -> bool {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b || a.contains(&b) || b.contains(&a) {
        return true;
    }
    let strip = |s: &str| {
        s.strip_suffix("es").map(str::to_string).or_else(|| s.strip_suffix('s').map(str::to_string)).unwrap_or_else(|| s.to_string())
    };
    strip(&a) == strip(&b)
}

#[cfg(test)]
mod tests {
    use super::{names_match_loosely, FieldSpec, FieldType, TableConfig, TableId};

    fn table(fields: Vec<FieldSpec>) -> TableConfig {
        TableConfig {
            id: TableId("tbl-1".to_string()),
            workspace_id: "ws-1".to_string(),
            name: "Citas".to_string(),
            fields,
            rules: Vec::new(),
        }
    }

    #[test]
    fn required_keys_follow_priority_order() {
        let mut cliente = FieldSpec::new("cliente", "Cliente", FieldType::Text).required();
        cliente.priority = Some(1);
        let mut hora = FieldSpec::new("hora", "Hora", FieldType::Time).required();
        hora.priority = Some(3);
        let mut fecha = FieldSpec::new("fecha", "Fecha", FieldType::Date).required();
        fecha.priority = Some(2);
        let notas = FieldSpec::new("notas", "Notas", FieldType::Text);

        let table = table(vec![hora, notas, cliente, fecha]);
        assert_eq!(table.required_field_keys(), vec!["cliente", "fecha", "hora"]);
    }

    #[test]
    fn appointment_heuristic_requires_date_and_time() {
        let with_both = table(vec![
            FieldSpec::new("fecha", "Fecha", FieldType::Date),
            FieldSpec::new("hora", "Hora", FieldType::Time),
        ]);
        let date_only = table(vec![FieldSpec::new("fecha", "Fecha", FieldType::Date)]);

        assert!(with_both.looks_like_appointments());
        assert!(!date_only.looks_like_appointments());
    }

    #[test]
    fn loose_name_matching_covers_plurals_and_substrings() {
        assert!(names_match_loosely("Citas", "cita"));
        assert!(names_match_loosely("clients", "Client"));
        assert!(names_match_loosely("Productos", "producto"));
        assert!(names_match_loosely("tabla de citas", "citas"));
        assert!(!names_match_loosely("Citas", "Productos"));
    }
}
