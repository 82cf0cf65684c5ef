//! End-to-end dialogue turns against a scripted oracle and in-memory
//! repositories: appointment collection, one-shot extraction, side queries
//! with flow reminders, the confirmation edit loop, garbage short-circuit,
//! undo, nested relation creation, and flow chaining.

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;

use clerky_agent::{
    ChatEngine, Classification, DateContext, EngineOptions, MessageCategory, OracleReply,
    ScriptedOracle, TenantProfile, TurnRequest,
};
use clerky_core::repo::{ChatRepository, RecordRepository};
use clerky_core::schema::TableId;
use clerky_db::fixtures::{seed_demo_workspace, DEMO_AGENT, DEMO_WORKSPACE};
use clerky_db::repositories::{
    InMemoryChatRepository, InMemoryRecordRepository, InMemoryTableRepository,
};

struct Harness {
    engine: ChatEngine,
    oracle: Arc<ScriptedOracle>,
    chats: Arc<InMemoryChatRepository>,
    tables: Arc<InMemoryTableRepository>,
    records: Arc<InMemoryRecordRepository>,
}

async fn harness() -> Harness {
    let oracle = Arc::new(ScriptedOracle::new());
    let chats = Arc::new(InMemoryChatRepository::default());
    let tables = Arc::new(InMemoryTableRepository::default());
    let records = Arc::new(InMemoryRecordRepository::default());
    seed_demo_workspace(tables.as_ref(), records.as_ref()).await.expect("seed demo workspace");

    let engine = ChatEngine::new(
        oracle.clone(),
        chats.clone(),
        tables.clone(),
        records.clone(),
        EngineOptions::default(),
    );
    Harness { engine, oracle, chats, tables, records }
}

fn request(message: &str) -> TurnRequest {
    TurnRequest {
        workspace_id: DEMO_WORKSPACE.to_string(),
        agent_id: DEMO_AGENT.to_string(),
        chat_id: "chat-1".to_string(),
        message: message.to_string(),
        profile: TenantProfile::default(),
        date_context: DateContext::new(NaiveDate::from_ymd_opt(2026, 2, 27).expect("date")),
    }
}

fn tool_call(name: &str, arguments: serde_json::Value) -> OracleReply {
    OracleReply::ToolCall { name: name.to_string(), arguments }
}

async fn seed_client(records: &InMemoryRecordRepository, nombre: &str) {
    records
        .create(
            DEMO_WORKSPACE,
            &TableId("tbl-clientes".to_string()),
            [("nombre".to_string(), json!(nombre))].into_iter().collect(),
        )
        .await
        .expect("seed client");
}

#[tokio::test]
async fn starting_a_creation_flow_asks_for_the_first_missing_field() {
    let h = harness().await;
    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));

    let response = h.engine.handle_turn(request("quiero agendar una cita")).await;

    assert!(response.handled);
    assert!(response.reply.contains("cliente"), "asks for client: {}", response.reply);

    let document = h
        .chats
        .find_by_id(DEMO_WORKSPACE, "chat-1")
        .await
        .expect("find chat")
        .expect("chat saved");
    let pending = document.data.pending_record.expect("pending record persisted");
    assert_eq!(pending.table_name, "Citas");
    assert_eq!(pending.missing_fields(), vec!["cliente", "fecha", "hora"]);
    assert_eq!(document.messages.len(), 2);
}

#[tokio::test]
async fn one_message_can_fill_every_missing_field_and_reach_confirmation() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez", "fecha": "2026-02-28", "hora": "16:00"}}"#,
    );

    let response = h.engine.handle_turn(request("Juan Pérez, mañana a las 4")).await;

    assert!(response.reply.contains("1. Cliente: Juan Pérez"), "{}", response.reply);
    assert!(response.reply.contains("2. Fecha: sábado 28 de febrero de 2026"));
    assert!(response.reply.contains("3. Hora: 4:00 PM"));

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    assert!(document.data.pending_confirmation.is_some());
    assert!(document.data.pending_record.expect("draft kept").missing_fields().is_empty());
}

#[tokio::test]
async fn confirming_writes_the_record_and_logs_an_undoable_action() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez", "fecha": "2026-02-28", "hora": "16:00"}}"#,
    );
    h.engine.handle_turn(request("Juan Pérez, mañana a las 4")).await;

    let response = h.engine.handle_turn(request("sí")).await;
    assert!(response.reply.contains("Citas"), "{}", response.reply);

    let citas = h
        .records
        .query(DEMO_WORKSPACE, &TableId("tbl-citas".to_string()), &serde_json::Map::new())
        .await
        .expect("query citas");
    assert_eq!(citas.len(), 1);
    assert_eq!(citas[0].data.get("cliente"), Some(&json!("Juan Pérez")));
    assert_eq!(citas[0].data.get("hora"), Some(&json!("16:00")));

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    assert!(document.data.pending_record.is_none());
    assert!(document.data.pending_confirmation.is_none());

    let last = h.engine.action_log().get_last_undoable(DEMO_WORKSPACE, Some("chat-1"));
    assert!(last.is_some(), "create should be undoable");
}

#[tokio::test]
async fn side_query_is_answered_with_a_pending_flow_reminder() {
    let h = harness().await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;

    h.oracle.push_reply(tool_call("query_records", json!({ "record_type": "Productos" })));
    let response = h.engine.handle_turn(request("¿qué productos tienen?")).await;

    assert!(response.reply.contains("CRM Pro"), "{}", response.reply);
    assert!(
        response.reply.contains("Recuerda que estábamos registrando tu Citas"),
        "{}",
        response.reply
    );

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    let pending = document.data.pending_record.expect("flow still pending");
    assert_eq!(pending.missing_fields(), vec!["cliente", "fecha", "hora"]);
}

#[tokio::test]
async fn confirmation_edit_loop_changes_one_field_and_reconfirms() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;
    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez", "fecha": "2026-02-28", "hora": "16:00"}}"#,
    );
    h.engine.handle_turn(request("Juan Pérez, mañana a las 4")).await;

    let editing = h.engine.handle_turn(request("cambia la hora")).await;
    assert!(editing.reply.contains("nuevo valor"), "{}", editing.reply);

    let edited = h.engine.handle_turn(request("17:00")).await;
    assert!(edited.reply.contains("3. Hora: 5:00 PM"), "{}", edited.reply);

    h.engine.handle_turn(request("dale")).await;

    let citas = h
        .records
        .query(DEMO_WORKSPACE, &TableId("tbl-citas".to_string()), &serde_json::Map::new())
        .await
        .expect("query citas");
    assert_eq!(citas.len(), 1);
    assert_eq!(citas[0].data.get("hora"), Some(&json!("17:00")));
}

#[tokio::test]
async fn invalid_edit_value_is_rejected_and_editing_continues() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;
    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez", "fecha": "2026-02-28", "hora": "16:00"}}"#,
    );
    h.engine.handle_turn(request("Juan Pérez, mañana a las 4")).await;

    h.engine.handle_turn(request("cambiar hora")).await;
    let rejected = h.engine.handle_turn(request("a las veinte")).await;
    assert!(rejected.reply.contains("HH:MM"), "{}", rejected.reply);

    let fixed = h.engine.handle_turn(request("20:00")).await;
    assert!(fixed.reply.contains("8:00 PM"), "{}", fixed.reply);
}

#[tokio::test]
async fn garbage_messages_short_circuit_without_touching_state() {
    let h = harness().await;
    h.oracle.push_classification(Classification {
        is_valid: false,
        category: MessageCategory::Garbage,
    });

    let response = h.engine.handle_turn(request("asdkjhaskjdh")).await;

    assert!(response.handled);
    assert!(response.reply.contains("No logré entender"), "{}", response.reply);

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    assert!(document.data.pending_record.is_none());
    assert!(document.data.pending_confirmation.is_none());
}

#[tokio::test]
async fn oracle_failure_degrades_to_a_generic_reply() {
    let h = harness().await;
    // No scripted function-call reply queued: the call errors.
    let response = h.engine.handle_turn(request("quiero agendar una cita")).await;
    assert!(response.handled);
    assert!(response.reply.contains("No pude procesar"), "{}", response.reply);
}

#[tokio::test]
async fn undo_deletes_the_last_created_record() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;
    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez", "fecha": "2026-02-28", "hora": "16:00"}}"#,
    );
    h.engine.handle_turn(request("Juan Pérez, mañana a las 4")).await;
    h.engine.handle_turn(request("sí")).await;

    let response = h.engine.handle_turn(request("deshaz lo último")).await;
    assert!(response.reply.contains("Eliminé"), "{}", response.reply);

    let citas = h
        .records
        .query(DEMO_WORKSPACE, &TableId("tbl-citas".to_string()), &serde_json::Map::new())
        .await
        .expect("query citas");
    assert!(citas.is_empty());

    // A second undo has nothing left to roll back.
    let nothing = h.engine.handle_turn(request("deshaz lo último")).await;
    assert!(nothing.reply.contains("ninguna acción"), "{}", nothing.reply);
}

#[tokio::test]
async fn unknown_client_with_auto_create_spawns_the_related_record() {
    let h = harness().await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle
        .push_completion(r#"{"is_data_response": true, "fields": {"cliente": "Marta Díaz"}}"#);
    let response = h.engine.handle_turn(request("para Marta Díaz")).await;

    assert!(
        response.reply.contains("agregué el nuevo registro a Clientes"),
        "{}",
        response.reply
    );
    // The parent flow moves on to its next missing field.
    assert!(response.reply.contains("fecha") || response.reply.contains("Fecha"));

    let clientes = h
        .records
        .query(DEMO_WORKSPACE, &TableId("tbl-clientes".to_string()), &serde_json::Map::new())
        .await
        .expect("query clientes");
    assert!(clientes
        .iter()
        .any(|r| r.data.get("nombre") == Some(&json!("Marta Díaz"))));

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    let pending = document.data.pending_record.expect("parent draft continues");
    assert_eq!(pending.fields.get("cliente"), Some(&json!("Marta Díaz")));
    assert_eq!(pending.missing_fields(), vec!["fecha", "hora"]);
}

#[tokio::test]
async fn completed_flow_chains_into_the_dependent_flow() {
    let h = harness().await;

    h.oracle.push_reply(tool_call(
        "create_flow",
        json!({ "record_type": "Clientes", "then_record_type": "Citas" }),
    ));
    let first = h.engine.handle_turn(request("da de alta un cliente y agéndale una cita")).await;
    assert!(first.reply.contains("cliente") || first.reply.contains("llama"), "{}", first.reply);

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Clientes" })));
    h.oracle
        .push_completion(r#"{"is_data_response": true, "fields": {"nombre": "Marta Díaz"}}"#);
    let preview = h.engine.handle_turn(request("se llama Marta Díaz")).await;
    assert!(preview.reply.contains("1. Nombre: Marta Díaz"), "{}", preview.reply);

    let chained = h.engine.handle_turn(request("sí")).await;
    assert!(chained.reply.contains("Ahora sigamos con Citas"), "{}", chained.reply);

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    let pending = document.data.pending_record.expect("chained draft");
    assert_eq!(pending.table_name, "Citas");

    let flows = h.engine.flow_stack().list("chat-1");
    assert!(flows.iter().any(|f| f.table_name == "Citas"
        && f.collected_fields.contains_key("_parent_result")));
}

#[tokio::test]
async fn confirmation_survives_a_process_restart() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;
    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez", "fecha": "2026-02-28", "hora": "16:00"}}"#,
    );
    h.engine.handle_turn(request("Juan Pérez, mañana a las 4")).await;

    // Fresh engine, same repositories: the in-memory managers start empty
    // and must recover from the chat document.
    let restarted = ChatEngine::new(
        h.oracle.clone(),
        h.chats.clone(),
        h.tables.clone(),
        h.records.clone(),
        EngineOptions::default(),
    );
    let response = restarted.handle_turn(request("sí")).await;
    assert!(response.reply.contains("Citas"), "{}", response.reply);

    let citas = h
        .records
        .query(DEMO_WORKSPACE, &TableId("tbl-citas".to_string()), &serde_json::Map::new())
        .await
        .expect("query citas");
    assert_eq!(citas.len(), 1);
}

#[tokio::test]
async fn updating_a_record_applies_the_patch_and_logs_previous_data() {
    let h = harness().await;
    h.records
        .create(
            DEMO_WORKSPACE,
            &TableId("tbl-citas".to_string()),
            [
                ("cliente".to_string(), json!("Juan Pérez")),
                ("fecha".to_string(), json!("2026-03-02")),
                ("hora".to_string(), json!("10:00")),
            ]
            .into_iter()
            .collect(),
        )
        .await
        .expect("seed cita");

    h.oracle.push_reply(tool_call(
        "update_record",
        json!({
            "record_type": "Citas",
            "filters": { "cliente": "Juan Pérez" },
            "fields": { "hora": "18:00" }
        }),
    ));
    let response = h.engine.handle_turn(request("cambia la cita de Juan a las 6")).await;
    assert!(response.reply.contains("Actualicé"), "{}", response.reply);

    let citas = h
        .records
        .query(DEMO_WORKSPACE, &TableId("tbl-citas".to_string()), &serde_json::Map::new())
        .await
        .expect("query citas");
    assert_eq!(citas[0].data.get("hora"), Some(&json!("18:00")));

    let action = h
        .engine
        .action_log()
        .get_last_undoable(DEMO_WORKSPACE, Some("chat-1"))
        .expect("update logged");
    assert_eq!(
        action.previous_data.as_ref().and_then(|d| d.get("hora")),
        Some(&json!("10:00"))
    );
}

#[tokio::test]
async fn availability_conflict_suggests_free_slots() {
    let h = harness().await;
    h.records
        .create(
            DEMO_WORKSPACE,
            &TableId("tbl-citas".to_string()),
            [
                ("cliente".to_string(), json!("Ana López")),
                ("fecha".to_string(), json!("2026-03-02")),
                ("hora".to_string(), json!("10:00")),
            ]
            .into_iter()
            .collect(),
        )
        .await
        .expect("seed cita");

    h.oracle.push_reply(tool_call(
        "check_availability",
        json!({ "record_type": "Citas", "fecha": "2026-03-02", "hora": "10:00" }),
    ));
    let busy = h.engine.handle_turn(request("¿tienen lugar el 2 de marzo a las 10?")).await;
    assert!(busy.reply.contains("ocupado"), "{}", busy.reply);
    assert!(busy.reply.contains("09:00"), "suggests another slot: {}", busy.reply);

    h.oracle.push_reply(tool_call(
        "check_availability",
        json!({ "record_type": "Citas", "fecha": "2026-03-02", "hora": "11:00" }),
    ));
    let free = h.engine.handle_turn(request("¿y a las 11?")).await;
    assert!(free.reply.contains("libre"), "{}", free.reply);
}

#[tokio::test]
async fn asking_to_change_a_collected_field_reopens_it() {
    let h = harness().await;
    seed_client(&h.records, "Juan Pérez").await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle
        .push_completion(r#"{"is_data_response": true, "fields": {"cliente": "Juan Pérez"}}"#);
    h.engine.handle_turn(request("para Juan Pérez")).await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.oracle.push_completion(
        r#"{"is_data_response": false, "fields": {}, "wants_to_change_field": "cliente"}"#,
    );
    let response = h.engine.handle_turn(request("mejor cambia el cliente")).await;
    assert!(response.reply.contains("cliente"), "{}", response.reply);

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    let pending = document.data.pending_record.expect("draft kept");
    assert!(pending.fields.get("cliente").is_none());
    assert_eq!(pending.missing_fields(), vec!["cliente", "fecha", "hora"]);
}

#[tokio::test]
async fn cancelling_mid_flow_abandons_the_draft() {
    let h = harness().await;

    h.oracle.push_reply(tool_call("create_record", json!({ "record_type": "Citas" })));
    h.engine.handle_turn(request("quiero agendar una cita")).await;

    h.oracle.push_reply(tool_call("query_records", json!({ "record_type": "Citas" })));
    let response = h.engine.handle_turn(request("ya no quiero la cita")).await;
    assert!(response.reply.contains("cancelé"), "{}", response.reply);

    let document =
        h.chats.find_by_id(DEMO_WORKSPACE, "chat-1").await.expect("find").expect("saved");
    assert!(document.data.pending_record.is_none());
}
