//! Declarative condition/action rules evaluated against a candidate record.
//!
//! Tenants attach rules to a table ("require delivery_address when channel is
//! delivery", "default currency to MXN"). Evaluation is a pure function of
//! `(rules, data)`; all matching rules accumulate their actions.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupLogic {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Leaf(Condition),
    Group { logic: GroupLogic, conditions: Vec<ConditionNode> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    RequireField { field: String },
    HideField { field: String },
    SetDefault { field: String, value: Value },
    SetValue { field: String, value: Value },
    AddWarning { message: String },
    AddError { message: String },
    Suggest { message: String },
    Validate { field: String, validator: SubValidator },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubValidator {
    Email,
    Phone { digits: Option<u32> },
    MinLength { min: usize },
    MaxLength { max: usize },
    Range { min: Option<f64>, max: Option<f64> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub conditions: Vec<ConditionNode>,
    pub actions: Vec<RuleAction>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleOutcome {
    pub required_fields: Vec<String>,
    pub hidden_fields: Vec<String>,
    pub defaults: Map<String, Value>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub suggestions: Vec<String>,
    pub triggered_rules: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate every rule; actions of all matching rules accumulate. A
    /// `set_default` never clobbers a value already present in `data` or set
    /// earlier in this pass; `set_value` always overrides, and when two
    /// triggered rules set the same field the later-declared rule wins.
    pub fn evaluate(&self, rules: &[Rule], data: &Map<String, Value>) -> RuleOutcome {
        let mut outcome = RuleOutcome::default();

        for rule in rules {
            if !conditions_hold(&rule.conditions, GroupLogic::And, data) {
                continue;
            }
            outcome.triggered_rules.push(rule.name.clone());

            for action in &rule.actions {
                apply_action(action, data, &mut outcome);
            }
        }

        outcome
    }
}

fn apply_action(action: &RuleAction, data: &Map<String, Value>, outcome: &mut RuleOutcome) {
    match action {
        RuleAction::RequireField { field } => {
            if !outcome.required_fields.contains(field) {
                outcome.required_fields.push(field.clone());
            }
        }
        RuleAction::HideField { field } => {
            if !outcome.hidden_fields.contains(field) {
                outcome.hidden_fields.push(field.clone());
            }
        }
        RuleAction::SetDefault { field, value } => {
            let user_has_value =
                data.get(field).map(|v| !crate::validate::value_is_empty(v)).unwrap_or(false);
            if !user_has_value && !outcome.defaults.contains_key(field) {
                outcome.defaults.insert(field.clone(), value.clone());
            }
        }
        RuleAction::SetValue { field, value } => {
            outcome.defaults.insert(field.clone(), value.clone());
        }
        RuleAction::AddWarning { message } => outcome.warnings.push(message.clone()),
        RuleAction::AddError { message } => outcome.errors.push(message.clone()),
        RuleAction::Suggest { message } => outcome.suggestions.push(message.clone()),
        RuleAction::Validate { field, validator } => {
            if let Some(message) = run_sub_validator(field, validator, data) {
                outcome.errors.push(message);
            }
        }
    }
}

fn run_sub_validator(
    field: &str,
    validator: &SubValidator,
    data: &Map<String, Value>,
) -> Option<String> {
    let value = data.get(field)?;
    if crate::validate::value_is_empty(value) {
        return None;
    }
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match validator {
        SubValidator::Email => {
            if text.contains('@') && text.split('@').nth(1).map(|d| d.contains('.')).unwrap_or(false)
            {
                None
            } else {
                Some(format!("{field} debe ser un correo válido"))
            }
        }
        SubValidator::Phone { digits } => {
            let expected = digits.unwrap_or(10) as usize;
            let count = text.chars().filter(|c| c.is_ascii_digit()).count();
            (count != expected)
                .then(|| format!("{field} debe tener exactamente {expected} dígitos"))
        }
        SubValidator::MinLength { min } => (text.chars().count() < *min)
            .then(|| format!("{field} debe tener al menos {min} caracteres")),
        SubValidator::MaxLength { max } => (text.chars().count() > *max)
            .then(|| format!("{field} debe tener como máximo {max} caracteres")),
        SubValidator::Range { min, max } => {
            let n = value.as_f64().or_else(|| text.trim().parse::<f64>().ok())?;
            if min.map(|m| n < m).unwrap_or(false) || max.map(|m| n > m).unwrap_or(false) {
                Some(format!("{field} está fuera del rango permitido"))
            } else {
                None
            }
        }
    }
}

fn conditions_hold(nodes: &[ConditionNode], logic: GroupLogic, data: &Map<String, Value>) -> bool {
    if nodes.is_empty() {
        return true;
    }
    match logic {
        GroupLogic::And => nodes.iter().all(|node| node_holds(node, data)),
        GroupLogic::Or => nodes.iter().any(|node| node_holds(node, data)),
    }
}

fn node_holds(node: &ConditionNode, data: &Map<String, Value>) -> bool {
    match node {
        ConditionNode::Leaf(condition) => condition_holds(condition, data),
        ConditionNode::Group { logic, conditions } => conditions_hold(conditions, *logic, data),
    }
}

fn condition_holds(condition: &Condition, data: &Map<String, Value>) -> bool {
    let actual = data.get(&condition.field);
    let expected = &condition.value;

    match condition.operator.as_str() {
        "eq" => actual.map(|a| values_equal(a, expected)).unwrap_or(false),
        "ne" => actual.map(|a| !values_equal(a, expected)).unwrap_or(true),
        "gt" => compare_numbers(actual, expected).map(|o| o == std::cmp::Ordering::Greater).unwrap_or(false),
        "gte" => compare_numbers(actual, expected).map(|o| o != std::cmp::Ordering::Less).unwrap_or(false),
        "lt" => compare_numbers(actual, expected).map(|o| o == std::cmp::Ordering::Less).unwrap_or(false),
        "lte" => compare_numbers(actual, expected).map(|o| o != std::cmp::Ordering::Greater).unwrap_or(false),
        "contains" => substring_match(actual, expected).unwrap_or(false),
        "not_contains" | "notContains" => substring_match(actual, expected).map(|b| !b).unwrap_or(true),
        "starts_with" | "startsWith" => affix_match(actual, expected, true).unwrap_or(false),
        "ends_with" | "endsWith" => affix_match(actual, expected, false).unwrap_or(false),
        "in" => list_membership(actual, expected).unwrap_or(false),
        "not_in" | "notIn" => list_membership(actual, expected).map(|b| !b).unwrap_or(true),
        "is_empty" | "isEmpty" => actual.map(crate::validate::value_is_empty).unwrap_or(true),
        "is_not_empty" | "isNotEmpty" => {
            actual.map(|v| !crate::validate::value_is_empty(v)).unwrap_or(false)
        }
        "matches" => regex_match(actual, expected).unwrap_or(false),
        other => {
            tracing::warn!(
                event_name = "rules.unknown_operator",
                operator = %other,
                field = %condition.field,
                "condition with unknown operator evaluates to false"
            );
            false
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // "3" and 3 are the same thing once they came through a chat message.
    match (as_lower_text(a), as_lower_text(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn as_lower_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = as_number(actual?)?;
    let b = as_number(expected)?;
    a.partial_cmp(&b)
}

fn substring_match(actual: Option<&Value>, expected: &Value) -> Option<bool> {
    let haystack = as_lower_text(actual?)?;
    let needle = as_lower_text(expected)?;
    Some(haystack.contains(&needle))
}

fn affix_match(actual: Option<&Value>, expected: &Value, prefix: bool) -> Option<bool> {
    let text = as_lower_text(actual?)?;
    let affix = as_lower_text(expected)?;
    Some(if prefix { text.starts_with(&affix) } else { text.ends_with(&affix) })
}

fn list_membership(actual: Option<&Value>, expected: &Value) -> Option<bool> {
    let actual = as_lower_text(actual?)?;
    let list = expected.as_array()?;
    Some(list.iter().filter_map(as_lower_text).any(|item| item == actual))
}

fn regex_match(actual: Option<&Value>, expected: &Value) -> Option<bool> {
    let text = match actual? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let pattern = expected.as_str()?;
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re.is_match(&text)),
        Err(err) => {
            tracing::warn!(
                event_name = "rules.pattern_invalid",
                error = %err,
                "matches condition with invalid pattern evaluates to false"
            );
            Some(false)
        }
    }
}
