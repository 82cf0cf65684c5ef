//! Structured field extraction from free text.
//!
//! One oracle completion per turn turns the user's message into a JSON map
//! of candidate field values. Nothing the oracle returns is trusted: every
//! value re-runs through the field validator, unknown keys are dropped, and
//! relation values must resolve against the referenced table before they can
//! touch the draft.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use clerky_core::context::{ChatMessage, PendingRecord, Role};
use clerky_core::kv::TtlCache;
use clerky_core::repo::{RecordRepository, TableRepository};
use clerky_core::schema::{normalize_name, FieldSpec, FieldType, RelationSpec};
use clerky_core::validate::{validate_field, FieldError, FieldErrorKind, ValidateOptions};

use crate::llm::{OracleClient, OracleMessage};

/// Anchors relative date talk ("mañana") to a concrete calendar.
#[derive(Clone, Copy, Debug)]
pub struct DateContext {
    pub today: NaiveDate,
}

impl DateContext {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn tomorrow(&self) -> NaiveDate {
        self.today + ChronoDuration::days(1)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationConfirmation {
    pub field: String,
    pub input: String,
    pub candidate: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationError {
    pub field: String,
    pub message: String,
    pub available_options: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewRelatedRecord {
    pub field: String,
    pub table_name: String,
    pub initial_value: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    pub is_data_response: bool,
    pub extracted_fields: Map<String, Value>,
    pub wants_to_change_flow: bool,
    pub new_intent: Option<String>,
    pub wants_to_change_field: Option<String>,
    pub clarification_needed: Option<String>,
    pub field_errors: Vec<FieldError>,
    pub confirmation_needed: Option<RelationConfirmation>,
    pub relation_error: Option<RelationError>,
    pub needs_new_related_record: Option<NewRelatedRecord>,
}

/// Shape the extraction prompt asks the oracle to emit.
#[derive(Debug, Default, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    is_data_response: bool,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    wants_to_change_flow: bool,
    #[serde(default)]
    new_intent: Option<String>,
    #[serde(default)]
    wants_to_change_field: Option<String>,
    #[serde(default)]
    clarification: Option<String>,
}

pub struct FieldCollector {
    oracle: Arc<dyn OracleClient>,
    tables: Arc<dyn TableRepository>,
    records: Arc<dyn RecordRepository>,
    relation_cache: TtlCache<String>,
    model: String,
    temperature: f32,
}

const EXTRACTION_MAX_TOKENS: u32 = 500;
const RELATION_OPTIONS_SHOWN: usize = 10;

impl FieldCollector {
    pub fn new(
        oracle: Arc<dyn OracleClient>,
        tables: Arc<dyn TableRepository>,
        records: Arc<dyn RecordRepository>,
        model: impl Into<String>,
        temperature: f32,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            oracle,
            tables,
            records,
            relation_cache: TtlCache::new(cache_capacity, cache_ttl),
            model: model.into(),
            temperature,
        }
    }

    pub async fn extract_fields(
        &self,
        workspace_id: &str,
        message: &str,
        pending: &PendingRecord,
        history: &[ChatMessage],
        date_context: DateContext,
    ) -> Extraction {
        let missing = pending.missing_fields();
        if missing.is_empty() {
            // Nothing left to collect; the oracle is not consulted.
            return Extraction { is_data_response: false, ..Extraction::default() };
        }

        let prompt = build_extraction_prompt(message, pending, &missing, history, date_context);
        let payload = match self
            .oracle
            .complete(
                &[OracleMessage::new(Role::User, prompt)],
                &self.model,
                EXTRACTION_MAX_TOKENS,
                self.temperature,
            )
            .await
        {
            Ok(completion) => parse_payload(&completion.content),
            Err(error) => {
                tracing::warn!(
                    event_name = "collector.oracle_failed",
                    error = %error,
                    "extraction degraded to empty result"
                );
                ExtractionPayload::default()
            }
        };

        let mut extraction = self.validate_candidates(workspace_id, pending, payload.fields).await;
        extraction.is_data_response =
            payload.is_data_response || !extraction.extracted_fields.is_empty();
        extraction.wants_to_change_flow = payload.wants_to_change_flow;
        extraction.new_intent = payload.new_intent;
        extraction.wants_to_change_field = payload.wants_to_change_field;
        if extraction.clarification_needed.is_none() {
            extraction.clarification_needed = payload.clarification;
        }
        extraction
    }

    /// Validate candidate field values against the draft, without consulting
    /// the oracle. Also used for field seeds the oracle already placed in the
    /// tool-call arguments.
    pub async fn validate_candidates(
        &self,
        workspace_id: &str,
        pending: &PendingRecord,
        fields: Map<String, Value>,
    ) -> Extraction {
        let missing = pending.missing_fields();
        let mut extraction = Extraction::default();

        for (key, raw_value) in fields {
            let Some(spec) = pending.spec(&key) else {
                tracing::warn!(
                    event_name = "collector.unknown_field_dropped",
                    field = %key,
                    "oracle returned a key outside the schema"
                );
                continue;
            };
            if !missing.contains(&key) {
                // Already collected; the context guard would reject it anyway.
                continue;
            }
            if is_intent_verb(&raw_value) {
                tracing::warn!(
                    event_name = "collector.intent_verb_dropped",
                    field = %key,
                    "intent verb captured as a value"
                );
                continue;
            }

            if spec.field_type == FieldType::Relation {
                self.resolve_relation_field(workspace_id, spec, &raw_value, &mut extraction).await;
                continue;
            }

            self.validate_scalar_field(spec, raw_value, &mut extraction);
        }

        if !extraction.extracted_fields.is_empty() {
            extraction.is_data_response = true;
        }
        extraction
    }

    fn validate_scalar_field(&self, spec: &FieldSpec, raw_value: Value, extraction: &mut Extraction) {
        let mut candidate = raw_value;

        // "2 licencias" answered into a numeric field: the leading number is
        // the quantity, the noun phrase is not part of it.
        if spec.field_type.is_numeric() {
            if let Some(text) = candidate.as_str() {
                if let Some((quantity, _item)) = split_quantity_item(text) {
                    candidate = Value::from(quantity);
                }
            }
        }

        let result =
            validate_field(&spec.key, Some(&candidate), spec, ValidateOptions::default());
        if result.valid {
            if let Some(normalized) = result.normalized {
                extraction.extracted_fields.insert(spec.key.clone(), normalized);
            }
        } else {
            let message =
                result.error.unwrap_or_else(|| format!("{} no es válido", spec.label));
            extraction.field_errors.push(FieldError {
                field: spec.key.clone(),
                kind: result.kind.unwrap_or(FieldErrorKind::Type),
                message: message.clone(),
            });
            if extraction.clarification_needed.is_none() {
                extraction.clarification_needed = Some(message);
            }
        }
    }

    async fn resolve_relation_field(
        &self,
        workspace_id: &str,
        spec: &FieldSpec,
        raw_value: &Value,
        extraction: &mut Extraction,
    ) {
        let Some(relation) = &spec.relation else {
            // Relation-typed field without a relation target is tenant
            // misconfiguration; treat the value as plain text.
            if let Some(text) = raw_value.as_str() {
                extraction
                    .extracted_fields
                    .insert(spec.key.clone(), Value::String(text.to_string()));
            }
            return;
        };
        let search = match raw_value.as_str() {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => return,
        };

        match self.resolve_relation(workspace_id, spec, relation, &search).await {
            RelationResolution::Accepted(canonical) => {
                extraction.extracted_fields.insert(spec.key.clone(), Value::String(canonical));
            }
            RelationResolution::NeedsConfirmation { candidate } => {
                extraction.confirmation_needed = Some(RelationConfirmation {
                    field: spec.key.clone(),
                    input: search,
                    candidate,
                });
            }
            RelationResolution::NeedsNewRecord => {
                extraction.needs_new_related_record = Some(NewRelatedRecord {
                    field: spec.key.clone(),
                    table_name: relation.table_name.clone(),
                    initial_value: search,
                });
            }
            RelationResolution::NotFound { available_options } => {
                let message = if available_options.is_empty() {
                    format!(
                        "No encontré \"{search}\" en {} y no hay registros todavía.",
                        relation.table_name
                    )
                } else {
                    format!(
                        "No encontré \"{search}\" en {}. Opciones: {}.",
                        relation.table_name,
                        available_options.join(", ")
                    )
                };
                extraction.relation_error = Some(RelationError {
                    field: spec.key.clone(),
                    message,
                    available_options,
                });
            }
        }
    }

    async fn resolve_relation(
        &self,
        workspace_id: &str,
        spec: &FieldSpec,
        relation: &RelationSpec,
        search: &str,
    ) -> RelationResolution {
        let cache_key =
            format!("{workspace_id}|{}|{}", relation.table_name, normalize_name(search));
        if let Some(hit) = self.relation_cache.get(&cache_key) {
            return RelationResolution::Accepted(hit);
        }

        let tables = match self.tables.list(workspace_id).await {
            Ok(tables) => tables,
            Err(error) => {
                tracing::warn!(
                    event_name = "collector.relation_tables_failed",
                    error = %error,
                    field = %spec.key,
                    "relation lookup degraded to not-found"
                );
                return RelationResolution::NotFound { available_options: Vec::new() };
            }
        };
        let Some(target) = tables
            .iter()
            .find(|t| clerky_core::schema::names_match_loosely(&t.name, &relation.table_name))
        else {
            return RelationResolution::NotFound { available_options: Vec::new() };
        };

        let records = match self.records.query(workspace_id, &target.id, &Map::new()).await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(
                    event_name = "collector.relation_query_failed",
                    error = %error,
                    field = %spec.key,
                    "relation lookup degraded to not-found"
                );
                Vec::new()
            }
        };

        let needle = normalize_name(search);
        let mut exact = None;
        let mut partial = Vec::new();
        let mut options = Vec::new();

        for record in &records {
            let Some(display) = record
                .data
                .get(&relation.display_field)
                .or_else(|| record.data.get(&relation.search_field))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if options.len() < RELATION_OPTIONS_SHOWN {
                options.push(display.to_string());
            }
            let haystack = normalize_name(display);
            if haystack == needle {
                exact = Some(display.to_string());
            } else if haystack.contains(&needle) || needle.contains(&haystack) {
                partial.push(display.to_string());
            }
        }

        if let Some(canonical) = exact {
            self.relation_cache.insert(cache_key, canonical.clone());
            return RelationResolution::Accepted(canonical);
        }
        if partial.len() == 1 {
            return RelationResolution::NeedsConfirmation { candidate: partial.remove(0) };
        }
        if partial.len() > 1 {
            return RelationResolution::NotFound { available_options: partial };
        }
        if relation.auto_create {
            return RelationResolution::NeedsNewRecord;
        }
        RelationResolution::NotFound { available_options: options }
    }
}

enum RelationResolution {
    Accepted(String),
    NeedsConfirmation { candidate: String },
    NeedsNewRecord,
    NotFound { available_options: Vec<String> },
}

const INTENT_VERBS: &[&str] = &[
    "quiero", "necesito", "dame", "quisiera", "ocupo", "busco", "agendar", "registrar", "want",
    "need", "give me", "book",
];

fn is_intent_verb(value: &Value) -> bool {
    let Some(text) = value.as_str() else { return false };
    let lowered = text.trim().to_lowercase();
    INTENT_VERBS.iter().any(|verb| *verb == lowered)
}

static QUANTITY_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s+(\p{L}[\p{L}\s]*)$").expect("quantity-item regex"));

/// "2 licencias" -> (2, "licencias"). A trailing number glued to a name
/// ("CRM Pro 2") never matches; it stays part of the name.
pub fn split_quantity_item(text: &str) -> Option<(i64, String)> {
    let caps = QUANTITY_ITEM_RE.captures(text)?;
    let quantity = caps[1].parse().ok()?;
    Some((quantity, caps[2].trim().to_string()))
}

fn parse_payload(raw: &str) -> ExtractionPayload {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<ExtractionPayload>(cleaned.trim()) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(
                event_name = "collector.payload_unparseable",
                error = %error,
                "oracle returned non-JSON extraction output"
            );
            ExtractionPayload::default()
        }
    }
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else { return trimmed };
    // Drop an optional language tag on the fence line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest)
}

fn build_extraction_prompt(
    message: &str,
    pending: &PendingRecord,
    missing: &[String],
    history: &[ChatMessage],
    date_context: DateContext,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Extrae datos del mensaje del usuario para el registro de {}.\n",
        pending.table_name
    ));
    prompt.push_str(&format!(
        "Hoy es {}; mañana es {}.\n\n",
        date_context.today.format("%Y-%m-%d"),
        date_context.tomorrow().format("%Y-%m-%d"),
    ));

    if !pending.fields.is_empty() {
        let collected = pending
            .fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!(
            "Campos YA capturados (no los repitas): {collected}\n"
        ));
    }

    prompt.push_str(&format!(
        "Campos que FALTAN (usa exactamente estas claves y ninguna otra): [{}]\n",
        missing.join(", ")
    ));
    for key in missing {
        if let Some(spec) = pending.spec(key) {
            prompt.push_str(&format!("- {key}: {}\n", extraction_hint(spec, date_context)));
        }
    }

    if let Some(current) = currently_asked_field(pending, missing, history) {
        prompt.push_str(&format!(
            "\nEl campo que se está pidiendo en este momento es \"{current}\"; si el mensaje \
             es una respuesta corta sin etiqueta, asígnala a ese campo.\n"
        ));
    }

    prompt.push_str(
        "\nReglas:\n\
         - Un número al inicio seguido de un sustantivo es cantidad+artículo (\"quiero 2 licencias\" => cantidad 2).\n\
         - Un número pegado al final de un nombre de producto es parte del nombre (\"CRM Pro 2\").\n\
         - Nunca captures verbos de intención (quiero, necesito, dame) como valor.\n\
         - Si un dato es ambiguo, déjalo fuera y explica en \"clarification\".\n\n\
         Responde SOLO con JSON estricto, sin markdown:\n\
         {\"is_data_response\": bool, \"fields\": {...}, \"wants_to_change_flow\": bool, \
          \"new_intent\": string|null, \"wants_to_change_field\": string|null, \
          \"clarification\": string|null}\n\n",
    );
    prompt.push_str(&format!("Mensaje del usuario: {message}\n"));
    prompt
}

/// Which missing field the last assistant message was asking about. Matches
/// the configured ask-phrasing or label; with a single field left there is
/// nothing to guess.
fn currently_asked_field(
    pending: &PendingRecord,
    missing: &[String],
    history: &[ChatMessage],
) -> Option<String> {
    if missing.len() == 1 {
        return Some(missing[0].clone());
    }
    let last_assistant = history
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.content.to_lowercase())?;

    for key in missing {
        let Some(spec) = pending.spec(key) else { continue };
        if let Some(ask) = &spec.ask_prompt {
            if last_assistant.contains(&ask.to_lowercase()) {
                return Some(key.clone());
            }
        }
        if last_assistant.contains(&spec.label.to_lowercase()) {
            return Some(key.clone());
        }
    }
    None
}

fn extraction_hint(spec: &FieldSpec, date_context: DateContext) -> String {
    match spec.field_type {
        FieldType::Date => format!(
            "fecha en formato YYYY-MM-DD (\"hoy\" => {}, \"mañana\" => {})",
            date_context.today.format("%Y-%m-%d"),
            date_context.tomorrow().format("%Y-%m-%d"),
        ),
        FieldType::Time => {
            "hora en formato 24h HH:MM (\"a las 4 de la tarde\" => \"16:00\")".to_string()
        }
        FieldType::Number | FieldType::Currency => "número positivo".to_string(),
        FieldType::Integer => "número entero positivo".to_string(),
        FieldType::Phone => "teléfono, solo dígitos".to_string(),
        FieldType::Email => "correo electrónico".to_string(),
        FieldType::Url => "URL completa".to_string(),
        FieldType::Boolean => "true o false".to_string(),
        FieldType::Select => {
            if spec.options.is_empty() {
                "una de las opciones configuradas".to_string()
            } else {
                format!("una de: {}", spec.options.join(" | "))
            }
        }
        FieldType::Relation => "nombre tal como lo dijo el usuario".to_string(),
        FieldType::Text => "texto".to_string(),
    }
}
