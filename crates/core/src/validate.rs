//! Field-level validation and normalization.
//!
//! Every value that reaches a record draft passes through here, whether it
//! was typed by a user or extracted by the oracle. Validation is pure: the
//! same `(key, value, spec)` triple always yields the same result, and a
//! normalized value re-validates cleanly.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{CustomRule, CustomRuleSpec, FieldSpec, FieldType, ValidationRules};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("date regex"));
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("time regex"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    Required,
    Type,
    Range,
    Length,
    Pattern,
    Custom,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldValidation {
    pub valid: bool,
    pub kind: Option<FieldErrorKind>,
    pub error: Option<String>,
    pub normalized: Option<Value>,
}

impl FieldValidation {
    fn ok(normalized: Value) -> Self {
        Self { valid: true, kind: None, error: None, normalized: Some(normalized) }
    }

    fn ok_empty() -> Self {
        Self { valid: true, kind: None, error: None, normalized: None }
    }

    fn fail(kind: FieldErrorKind, error: impl Into<String>) -> Self {
        Self { valid: false, kind: Some(kind), error: Some(error.into()), normalized: None }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidateOptions {
    /// Skip the required check; used for partial/patch updates where absent
    /// fields are legitimate.
    pub skip_required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchValidation {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

pub fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn validate_field(
    _key: &str,
    value: Option<&Value>,
    spec: &FieldSpec,
    options: ValidateOptions,
) -> FieldValidation {
    let empty = value.map(value_is_empty).unwrap_or(true);
    if empty {
        if spec.required && !options.skip_required {
            return FieldValidation::fail(
                FieldErrorKind::Required,
                format!("{} es obligatorio", spec.label),
            );
        }
        return FieldValidation::ok_empty();
    }
    let value = value.expect("non-empty value present");

    let typed = match check_type(value, spec) {
        Ok(normalized) => normalized,
        Err(result) => return result,
    };

    if let Some(rules) = &spec.validation {
        if spec.field_type.is_numeric() {
            if let Err(result) = check_numeric_range(&typed, spec, rules) {
                return result;
            }
        } else if let Err(result) = check_text_length(&typed, spec, rules) {
            return result;
        }
        if let Err(result) = check_pattern(&typed, spec, rules) {
            return result;
        }
        if let Err(result) = check_custom_rules(&typed, spec, &rules.custom_rules) {
            return result;
        }
    }

    FieldValidation::ok(typed)
}

fn check_type(value: &Value, spec: &FieldSpec) -> Result<Value, FieldValidation> {
    let label = &spec.label;
    match spec.field_type {
        FieldType::Text => Ok(Value::String(value_as_text(value))),
        FieldType::Email => {
            let text = value_as_text(value).trim().to_lowercase();
            if EMAIL_RE.is_match(&text) {
                Ok(Value::String(text))
            } else {
                Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label} debe ser un correo válido"),
                ))
            }
        }
        FieldType::Phone => {
            let digits: String =
                value_as_text(value).chars().filter(|c| c.is_ascii_digit()).collect();
            let expected = spec
                .validation
                .as_ref()
                .and_then(|v| v.digits)
                .unwrap_or(10) as usize;
            if digits.len() == expected {
                Ok(Value::String(digits))
            } else {
                Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label} debe tener exactamente {expected} dígitos"),
                ))
            }
        }
        FieldType::Date => {
            let text = value_as_text(value);
            let trimmed = text.trim();
            let Some(caps) = DATE_RE.captures(trimmed) else {
                return Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label} debe usar el formato YYYY-MM-DD"),
                ));
            };
            let year: i32 = caps[1].parse().unwrap_or(0);
            let month: u32 = caps[2].parse().unwrap_or(0);
            let day: u32 = caps[3].parse().unwrap_or(0);
            match NaiveDate::from_ymd_opt(year, month, day) {
                Some(_) => Ok(Value::String(trimmed.to_string())),
                None => Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label}: {trimmed} no es una fecha válida del calendario"),
                )),
            }
        }
        FieldType::Time => {
            let text = value_as_text(value);
            let trimmed = text.trim();
            let Some(caps) = TIME_RE.captures(trimmed) else {
                return Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label} debe usar el formato de 24 horas HH:MM"),
                ));
            };
            let hours: u32 = caps[1].parse().unwrap_or(99);
            let minutes: u32 = caps[2].parse().unwrap_or(99);
            if hours <= 23 && minutes <= 59 {
                Ok(Value::String(format!("{hours:02}:{minutes:02}")))
            } else {
                Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label}: las horas van de 0 a 23 y los minutos de 0 a 59"),
                ))
            }
        }
        FieldType::Number | FieldType::Currency => match parse_number(value) {
            Some(n) => Ok(Value::from(n)),
            None => Err(FieldValidation::fail(
                FieldErrorKind::Type,
                format!("{label} debe ser un número"),
            )),
        },
        FieldType::Integer => match parse_number(value) {
            Some(n) if n.fract() == 0.0 => Ok(Value::from(n as i64)),
            Some(_) => Err(FieldValidation::fail(
                FieldErrorKind::Type,
                format!("{label} debe ser un número entero"),
            )),
            None => Err(FieldValidation::fail(
                FieldErrorKind::Type,
                format!("{label} debe ser un número"),
            )),
        },
        FieldType::Url => {
            let text = value_as_text(value);
            let trimmed = text.trim();
            if url_is_wellformed(trimmed) {
                Ok(Value::String(trimmed.to_string()))
            } else {
                Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label} debe ser una URL válida"),
                ))
            }
        }
        FieldType::Boolean => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64() == Some(1),
                Value::String(s) => {
                    let s = s.trim().to_lowercase();
                    s == "true" || s == "1"
                }
                _ => false,
            };
            Ok(Value::Bool(truthy))
        }
        FieldType::Select => {
            let text = value_as_text(value);
            let trimmed = text.trim();
            if spec.options.is_empty()
                || spec.options.iter().any(|o| o.eq_ignore_ascii_case(trimmed))
            {
                Ok(Value::String(trimmed.to_string()))
            } else {
                Err(FieldValidation::fail(
                    FieldErrorKind::Type,
                    format!("{label} debe ser una de estas opciones: {}", spec.options.join(", ")),
                ))
            }
        }
        // Relation targets are resolved upstream against the referenced
        // table; here the raw search text passes through unchanged.
        FieldType::Relation => Ok(Value::String(value_as_text(value))),
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn url_is_wellformed(text: &str) -> bool {
    let Some(rest) = text.strip_prefix("https://").or_else(|| text.strip_prefix("http://")) else {
        return false;
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    !host.is_empty() && !host.contains(char::is_whitespace)
}

fn check_numeric_range(
    value: &Value,
    spec: &FieldSpec,
    rules: &ValidationRules,
) -> Result<(), FieldValidation> {
    let Some(n) = value.as_f64() else { return Ok(()) };
    let label = &spec.label;
    if !rules.allow_negative && n < 0.0 {
        return Err(FieldValidation::fail(
            FieldErrorKind::Range,
            format!("{label} no puede ser negativo"),
        ));
    }
    if let Some(min) = rules.min {
        if n < min {
            return Err(FieldValidation::fail(
                FieldErrorKind::Range,
                format!("{label} debe ser al menos {min}"),
            ));
        }
    }
    if let Some(max) = rules.max {
        if n > max {
            return Err(FieldValidation::fail(
                FieldErrorKind::Range,
                format!("{label} debe ser como máximo {max}"),
            ));
        }
    }
    Ok(())
}

fn check_text_length(
    value: &Value,
    spec: &FieldSpec,
    rules: &ValidationRules,
) -> Result<(), FieldValidation> {
    let Some(text) = value.as_str() else { return Ok(()) };
    let label = &spec.label;
    let chars = text.chars().count();
    if let Some(min) = rules.min {
        if (chars as f64) < min {
            return Err(FieldValidation::fail(
                FieldErrorKind::Length,
                format!("{label} debe tener al menos {} caracteres", min as usize),
            ));
        }
    }
    if let Some(max) = rules.max {
        if (chars as f64) > max {
            return Err(FieldValidation::fail(
                FieldErrorKind::Length,
                format!("{label} debe tener como máximo {} caracteres", max as usize),
            ));
        }
    }
    Ok(())
}

fn check_pattern(
    value: &Value,
    spec: &FieldSpec,
    rules: &ValidationRules,
) -> Result<(), FieldValidation> {
    let Some(pattern) = &rules.pattern else { return Ok(()) };
    let Some(text) = value.as_str() else { return Ok(()) };
    match Regex::new(pattern) {
        Ok(re) if re.is_match(text) => Ok(()),
        Ok(_) => Err(FieldValidation::fail(
            FieldErrorKind::Pattern,
            format!("{} tiene un formato inválido", spec.label),
        )),
        Err(err) => {
            // Tenant misconfiguration must not block users.
            tracing::warn!(
                event_name = "validate.pattern_invalid",
                field = %spec.key,
                error = %err,
                "skipping unparseable pattern rule"
            );
            Ok(())
        }
    }
}

fn check_custom_rules(
    value: &Value,
    spec: &FieldSpec,
    rules: &[CustomRuleSpec],
) -> Result<(), FieldValidation> {
    for rule_spec in rules {
        if let Some(message) = custom_rule_failure(value, spec, rule_spec) {
            return Err(FieldValidation::fail(FieldErrorKind::Custom, message));
        }
    }
    Ok(())
}

fn custom_rule_failure(value: &Value, spec: &FieldSpec, rule_spec: &CustomRuleSpec) -> Option<String> {
    let label = &spec.label;
    let text = value_as_text(value);
    let number = value.as_f64();
    let failed_message = |default: String| {
        Some(rule_spec.message.clone().unwrap_or(default))
    };

    match &rule_spec.rule {
        CustomRule::NotEmpty => {
            if text.trim().is_empty() {
                return failed_message(format!("{label} no puede estar vacío"));
            }
        }
        CustomRule::IsPositive => {
            if number.map(|n| n <= 0.0).unwrap_or(true) {
                return failed_message(format!("{label} debe ser positivo"));
            }
        }
        CustomRule::IsNegative => {
            if number.map(|n| n >= 0.0).unwrap_or(true) {
                return failed_message(format!("{label} debe ser negativo"));
            }
        }
        CustomRule::IsInteger => {
            if number.map(|n| n.fract() != 0.0).unwrap_or(true) {
                return failed_message(format!("{label} debe ser un número entero"));
            }
        }
        CustomRule::IsDecimal => {
            if number.is_none() {
                return failed_message(format!("{label} debe ser un número decimal"));
            }
        }
        CustomRule::MinLength(min) => {
            if text.chars().count() < *min {
                return failed_message(format!("{label} debe tener al menos {min} caracteres"));
            }
        }
        CustomRule::MaxLength(max) => {
            if text.chars().count() > *max {
                return failed_message(format!("{label} debe tener como máximo {max} caracteres"));
            }
        }
        CustomRule::ExactLength(len) => {
            if text.chars().count() != *len {
                return failed_message(format!("{label} debe tener exactamente {len} caracteres"));
            }
        }
        CustomRule::Contains(needle) => {
            if !text.to_lowercase().contains(&needle.to_lowercase()) {
                return failed_message(format!("{label} debe contener \"{needle}\""));
            }
        }
        CustomRule::NotContains(needle) => {
            if text.to_lowercase().contains(&needle.to_lowercase()) {
                return failed_message(format!("{label} no debe contener \"{needle}\""));
            }
        }
        CustomRule::StartsWith(prefix) => {
            if !text.starts_with(prefix.as_str()) {
                return failed_message(format!("{label} debe empezar con \"{prefix}\""));
            }
        }
        CustomRule::EndsWith(suffix) => {
            if !text.ends_with(suffix.as_str()) {
                return failed_message(format!("{label} debe terminar con \"{suffix}\""));
            }
        }
        CustomRule::Matches(pattern) => match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(&text) {
                    return failed_message(format!("{label} tiene un formato inválido"));
                }
            }
            Err(err) => {
                tracing::warn!(
                    event_name = "validate.custom_pattern_invalid",
                    field = %spec.key,
                    error = %err,
                    "skipping unparseable matches rule"
                );
            }
        },
    }
    None
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    pub is_partial: bool,
}

pub fn validate_all(
    data: &serde_json::Map<String, Value>,
    specs: &[FieldSpec],
    options: BatchOptions,
) -> BatchValidation {
    let mut errors = Vec::new();
    for spec in specs {
        let value = data.get(&spec.key);
        if options.is_partial && value.is_none() {
            continue;
        }
        let result = validate_field(
            &spec.key,
            value,
            spec,
            ValidateOptions { skip_required: options.is_partial },
        );
        if !result.valid {
            errors.push(FieldError {
                field: spec.key.clone(),
                kind: result.kind.unwrap_or(FieldErrorKind::Type),
                message: result.error.unwrap_or_else(|| "invalid value".to_string()),
            });
        }
    }
    BatchValidation { valid: errors.is_empty(), errors }
}
