//! System prompt assembly, parameterized per tenant.

use clerky_core::context::PendingRecord;
use clerky_core::schema::{FieldType, TableConfig};

#[derive(Clone, Debug)]
pub struct TenantProfile {
    pub workspace_id: String,
    pub assistant_name: String,
    pub business_name: String,
    pub vertical: String,
    pub personality: String,
    pub tone: String,
}

impl Default for TenantProfile {
    fn default() -> Self {
        Self {
            workspace_id: String::new(),
            assistant_name: "Clerky".to_string(),
            business_name: "el negocio".to_string(),
            vertical: "servicios".to_string(),
            personality: "amable y directo".to_string(),
            tone: "informal".to_string(),
        }
    }
}

pub fn build_system_prompt(profile: &TenantProfile, tables: &[TableConfig]) -> String {
    let mut prompt = format!(
        "Eres {assistant}, el asistente de {business} ({vertical}). \
         Tu personalidad: {personality}. Tono: {tone}. \
         Ayudas a registrar, consultar y actualizar información del negocio. \
         Responde siempre en el idioma del usuario.\n",
        assistant = profile.assistant_name,
        business = profile.business_name,
        vertical = profile.vertical,
        personality = profile.personality,
        tone = profile.tone,
    );

    if tables.is_empty() {
        prompt.push_str("\nEl espacio de trabajo aún no tiene tablas configuradas.\n");
        return prompt;
    }

    prompt.push_str("\nTablas disponibles:\n");
    for table in tables {
        let fields = table
            .fields
            .iter()
            .map(|f| {
                let marker = if f.required { "*" } else { "" };
                format!("{}{} ({})", f.key, marker, type_hint(f.field_type))
            })
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!("- {}: {fields}\n", table.name));
    }
    prompt.push_str(
        "\nUsa únicamente los nombres de tabla listados. Los campos marcados con * son obligatorios.\n",
    );
    prompt
}

/// Context block injected while a collection flow is active, biasing the
/// oracle toward re-selecting `create_record` instead of misreading
/// continuation data as a new query.
pub fn build_pending_context(pending: &PendingRecord, missing_fields: &[String]) -> String {
    let collected = pending
        .fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ");
    let collected = if collected.is_empty() { "(ninguno)".to_string() } else { collected };

    format!(
        "Hay un registro de {table} en curso. Campos ya capturados: {collected}. \
         Faltan exactamente estos campos: [{missing}]. \
         Si el mensaje del usuario aporta datos para esos campos, selecciona create_record \
         para {table}; no lo interpretes como una consulta distinta.",
        table = pending.table_name,
        missing = missing_fields.join(", "),
    )
}

fn type_hint(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text => "texto",
        FieldType::Number => "número",
        FieldType::Integer => "entero",
        FieldType::Currency => "importe",
        FieldType::Date => "fecha",
        FieldType::Time => "hora",
        FieldType::Phone => "teléfono",
        FieldType::Email => "correo",
        FieldType::Url => "url",
        FieldType::Boolean => "sí/no",
        FieldType::Select => "opción",
        FieldType::Relation => "referencia",
    }
}
