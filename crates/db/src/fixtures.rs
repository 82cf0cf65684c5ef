//! Demo workspace fixtures shared by tests and `clerky seed`.

use serde_json::json;

use clerky_core::repo::{RecordRepository, RepoError, TableRepository};
use clerky_core::schema::{FieldSpec, FieldType, RelationSpec, TableConfig, TableId};

pub const DEMO_WORKSPACE: &str = "ws-demo";
pub const DEMO_AGENT: &str = "agent-demo";

pub fn citas_table() -> TableConfig {
    TableConfig {
        id: TableId("tbl-citas".to_string()),
        workspace_id: DEMO_WORKSPACE.to_string(),
        name: "Citas".to_string(),
        fields: vec![
            FieldSpec::new("cliente", "Cliente", FieldType::Relation)
                .required()
                .with_relation(RelationSpec {
                    table_name: "Clientes".to_string(),
                    search_field: "nombre".to_string(),
                    display_field: "nombre".to_string(),
                    auto_create: true,
                })
                .with_ask_prompt("¿Para qué cliente es la cita?"),
            FieldSpec::new("fecha", "Fecha", FieldType::Date)
                .required()
                .with_ask_prompt("¿Para qué fecha?"),
            FieldSpec::new("hora", "Hora", FieldType::Time)
                .required()
                .with_ask_prompt("¿A qué hora?"),
            FieldSpec::new("notas", "Notas", FieldType::Text),
        ],
        rules: Vec::new(),
    }
}

pub fn clientes_table() -> TableConfig {
    TableConfig {
        id: TableId("tbl-clientes".to_string()),
        workspace_id: DEMO_WORKSPACE.to_string(),
        name: "Clientes".to_string(),
        fields: vec![
            FieldSpec::new("nombre", "Nombre", FieldType::Text)
                .required()
                .with_ask_prompt("¿Cómo se llama el cliente?"),
            FieldSpec::new("telefono", "Teléfono", FieldType::Phone),
            FieldSpec::new("correo", "Correo", FieldType::Email),
        ],
        rules: Vec::new(),
    }
}

pub fn productos_table() -> TableConfig {
    TableConfig {
        id: TableId("tbl-productos".to_string()),
        workspace_id: DEMO_WORKSPACE.to_string(),
        name: "Productos".to_string(),
        fields: vec![
            FieldSpec::new("nombre", "Nombre", FieldType::Text).required(),
            FieldSpec::new("precio", "Precio", FieldType::Currency).required(),
            FieldSpec::new("existencias", "Existencias", FieldType::Integer),
        ],
        rules: Vec::new(),
    }
}

/// Seed the demo workspace: three tables plus a couple of starter records.
pub async fn seed_demo_workspace(
    tables: &dyn TableRepository,
    records: &dyn RecordRepository,
) -> Result<(), RepoError> {
    let citas = citas_table();
    let clientes = clientes_table();
    let productos = productos_table();

    tables.save(citas).await?;
    tables.save(clientes.clone()).await?;
    tables.save(productos.clone()).await?;

    records
        .create(
            DEMO_WORKSPACE,
            &clientes.id,
            [
                ("nombre".to_string(), json!("Ana López")),
                ("telefono".to_string(), json!("5511223344")),
            ]
            .into_iter()
            .collect(),
        )
        .await?;

    records
        .create(
            DEMO_WORKSPACE,
            &productos.id,
            [
                ("nombre".to_string(), json!("CRM Pro")),
                ("precio".to_string(), json!(499.0)),
                ("existencias".to_string(), json!(25)),
            ]
            .into_iter()
            .collect(),
        )
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use clerky_core::repo::{RecordRepository, TableRepository};
    use serde_json::Map;

    use crate::repositories::{InMemoryRecordRepository, InMemoryTableRepository};

    use super::{seed_demo_workspace, DEMO_WORKSPACE};

    #[tokio::test]
    async fn demo_seed_creates_tables_and_records() {
        let tables = InMemoryTableRepository::default();
        let records = InMemoryRecordRepository::default();

        seed_demo_workspace(&tables, &records).await.expect("seed");

        let listed = tables.list(DEMO_WORKSPACE).await.expect("list tables");
        assert_eq!(listed.len(), 3);

        let citas = listed.iter().find(|t| t.name == "Citas").expect("citas table");
        assert!(citas.looks_like_appointments());
        assert_eq!(citas.required_field_keys(), vec!["cliente", "fecha", "hora"]);

        let clientes = listed.iter().find(|t| t.name == "Clientes").expect("clientes table");
        let stored = records
            .query(DEMO_WORKSPACE, &clientes.id, &Map::new())
            .await
            .expect("query clientes");
        assert_eq!(stored.len(), 1);
    }
}
