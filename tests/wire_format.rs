use rt_voice_session::protocol::models::Metadata;
use rt_voice_session::sdk::AGENT_NETWORK_TOOL;
use rt_voice_session::{
    ClientEvent, ExternalResult, Item, ItemStatus, ResponseStatus, Role, ServerEvent,
    SessionSettings, ToolCatalog,
};
use serde_json::json;

#[test]
fn test_session_update_from_default_settings() {
    let tools = ToolCatalog::agent_network().try_as_tools().unwrap();
    let event = ClientEvent::session_update(SessionSettings::default().to_session_config(tools));
    let value = serde_json::to_value(&event).unwrap();

    assert_eq!(value["type"], "session.update");
    assert!(value.get("event_id").is_none());
    let session = &value["session"];
    assert_eq!(session["input_audio_format"], "pcm16");
    assert_eq!(session["output_audio_format"], "pcm16");
    assert_eq!(session["modalities"], json!(["audio", "text"]));
    assert_eq!(session["turn_detection"]["type"], "server_vad");
    assert_eq!(session["tool_choice"], "auto");

    let tool = &session["tools"][0];
    assert_eq!(tool["type"], "function");
    assert_eq!(tool["name"], AGENT_NETWORK_TOOL);
    assert_eq!(tool["parameters"]["properties"]["request"]["type"], "string");
    assert_eq!(tool["parameters"]["required"], json!(["request"]));
}

#[test]
fn test_session_update_deserialization() {
    let event: ClientEvent = serde_json::from_value(json!({
        "type": "session.update",
        "session": {
            "instructions": "Be brief.",
            "voice": "verse",
            "input_audio_format": "pcm16",
            "turn_detection": { "type": "server_vad", "threshold": 0.6 }
        }
    }))
    .expect("session.update parses");

    match event {
        ClientEvent::SessionUpdate { session, .. } => {
            assert_eq!(session.instructions.as_deref(), Some("Be brief."));
            assert_eq!(session.voice.as_ref().map(|v| v.as_str()), Some("verse"));
            assert!(session.tools.is_none());
        }
        other => panic!("wrong event: {other:?}"),
    }
}

#[test]
fn test_function_call_output_is_anchored() {
    let item = Item::function_call_output("call_1", r#"{"status":"completed","message":"ok"}"#);
    let event = ClientEvent::item_create(item, Some("item_1".to_string()));
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "conversation.item.create",
            "previous_item_id": "item_1",
            "item": {
                "type": "function_call_output",
                "call_id": "call_1",
                "output": "{\"status\":\"completed\",\"message\":\"ok\"}"
            }
        })
    );
}

#[test]
fn test_response_create_is_bare() {
    let value = serde_json::to_value(ClientEvent::response_create()).unwrap();
    assert_eq!(value, json!({ "type": "response.create" }));
}

#[test]
fn test_response_done_with_function_call() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "response.done",
        "event_id": "evt_5",
        "response": {
            "id": "resp_1",
            "object": "realtime.response",
            "status": "completed",
            "status_details": null,
            "output": [{
                "id": "item_1",
                "type": "function_call",
                "status": "completed",
                "name": "send_to_agent_network",
                "call_id": "call_1",
                "arguments": "{\"request\":\"turn off the lights\"}"
            }],
            "usage": { "total_tokens": 42 }
        }
    }))
    .unwrap();

    let ServerEvent::ResponseDone { response, .. } = event else {
        panic!("wrong event");
    };
    assert_eq!(response.status, ResponseStatus::Completed);
    match &response.output[0] {
        Item::FunctionCall { id, status, call_id, arguments, .. } => {
            assert_eq!(id.as_deref(), Some("item_1"));
            assert_eq!(*status, Some(ItemStatus::Completed));
            assert_eq!(call_id, "call_1");
            assert!(arguments.contains("turn off the lights"));
        }
        other => panic!("wrong item: {other:?}"),
    }
}

#[test]
fn test_audio_delta_parses() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "response.audio.delta",
        "event_id": "evt_7",
        "response_id": "resp_1",
        "item_id": "item_2",
        "output_index": 0,
        "content_index": 0,
        "delta": "AAAA"
    }))
    .unwrap();
    assert_eq!(event.kind(), "response.audio.delta");
    assert!(matches!(event, ServerEvent::ResponseAudioDelta { ref delta, .. } if delta == "AAAA"));
}

#[test]
fn unmodeled_server_events_are_not_errors() {
    let event: ServerEvent = serde_json::from_value(json!({
        "type": "conversation.item.truncated",
        "event_id": "evt_8",
        "item_id": "item_2",
        "audio_end_ms": 1200
    }))
    .unwrap();
    assert!(matches!(event, ServerEvent::Unknown(_)));
    assert_eq!(event.kind(), "conversation.item.truncated");
}

#[test]
fn external_result_output_shape() {
    let ok = ExternalResult::completed("Lights are off").with_field("rooms", json!(["kitchen"]));
    let value: serde_json::Value = serde_json::from_str(&ok.to_output()).unwrap();
    assert_eq!(
        value,
        json!({ "status": "completed", "message": "Lights are off", "rooms": ["kitchen"] })
    );

    let failed = ExternalResult::failed("Could not reach the lights", "timeout");
    let value: serde_json::Value = serde_json::from_str(&failed.to_output()).unwrap();
    assert_eq!(value["status"], "error");
    assert_eq!(value["error"], "timeout");
    assert!(failed.is_error());
}

#[test]
fn external_result_accepts_host_json() {
    let result: ExternalResult = serde_json::from_value(json!({
        "status": "completed",
        "message": "Order placed",
        "order_id": "A-17"
    }))
    .unwrap();
    assert!(!result.is_error());
    assert_eq!(result.extra["order_id"], "A-17");
}

#[test]
fn system_message_for_late_results() {
    let item = Item::text_message(Role::System, "Result of the earlier request: done");
    let event = ClientEvent::item_create(item, None);
    let value = serde_json::to_value(&event).unwrap();
    assert!(value.get("previous_item_id").is_none());
    assert_eq!(value["item"]["role"], "system");
    assert_eq!(value["item"]["content"][0]["type"], "input_text");
}

#[test]
fn settings_round_trip_through_json() {
    let mut settings = SessionSettings::default();
    let mut metadata = Metadata::new();
    metadata.insert("tenant".to_string(), json!("acme"));
    settings.metadata = metadata;
    settings.auto_greet = true;

    let text = serde_json::to_string(&settings).unwrap();
    let parsed: SessionSettings = serde_json::from_str(&text).unwrap();
    assert!(parsed.auto_greet);
    assert_eq!(parsed.metadata["tenant"], "acme");
    assert_eq!(parsed.reconnect, settings.reconnect);
    assert_eq!(parsed.capture, settings.capture);
}
