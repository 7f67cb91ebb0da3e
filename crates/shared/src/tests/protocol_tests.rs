use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::{
    domain::{Message, MessageId, PeerUser, Username},
    protocol::{ClientRequest, MarkAsRead, MessageEdited, ServerEvent, TypingSignal},
};

#[test]
fn join_room_carries_bare_username() {
    let frame = serde_json::to_value(ClientRequest::JoinRoom(Username::from("alice"))).expect("json");
    assert_eq!(frame, json!({ "event": "join_room", "data": "alice" }));
}

#[test]
fn outbound_payloads_use_camel_case_fields() {
    let typing = serde_json::to_value(ClientRequest::Typing(TypingSignal {
        is_typing: true,
        to: Username::from("bob"),
    }))
    .expect("json");
    assert_eq!(
        typing,
        json!({ "event": "typing", "data": { "isTyping": true, "to": "bob" } })
    );

    let read = serde_json::to_value(ClientRequest::MarkAsRead(MarkAsRead {
        message_ids: vec![MessageId::from("m1"), MessageId::from("m2")],
        sender: Username::from("bob"),
        receiver: Username::from("alice"),
    }))
    .expect("json");
    assert_eq!(read["event"], "mark_as_read");
    assert_eq!(read["data"]["messageIds"], json!(["m1", "m2"]));
}

#[test]
fn receive_message_accepts_service_field_names() {
    let raw = json!({
        "event": "receive_message",
        "data": {
            "_id": "65f0",
            "sender": "bob",
            "receiver": "alice",
            "message": "hi there",
            "timestamp": "2024-03-01T10:00:00Z",
            "reactions": { "carol": "🔥", "alice": "👍" }
        }
    });
    let event: ServerEvent = serde_json::from_value(raw).expect("event");
    let ServerEvent::ReceiveMessage(message) = event else {
        panic!("unexpected event kind");
    };
    assert_eq!(message.id, Some(MessageId::from("65f0")));
    assert_eq!(message.content, "hi there");
    assert!(!message.read && !message.edited && !message.deleted);
    let reactors: Vec<&str> = message.reactions.iter().map(|(user, _)| user.as_str()).collect();
    assert_eq!(reactors, vec!["alice", "carol"]);
}

#[test]
fn locale_time_of_day_stamp_falls_back_to_receipt_time() {
    let before = Utc::now();
    let message: Message = serde_json::from_value(json!({
        "_id": "m2",
        "sender": "bob",
        "receiver": "alice",
        "message": "sent from an old client",
        "timestamp": "10:31:22 AM"
    }))
    .expect("message");
    assert_eq!(message.content, "sent from an old client");
    assert!(message.sent_at >= before && message.sent_at <= Utc::now());
}

#[test]
fn timestamp_may_be_epoch_millis_or_missing() {
    let millis: Message = serde_json::from_value(json!({
        "_id": "m3",
        "sender": "bob",
        "receiver": "alice",
        "message": "x",
        "timestamp": 1_709_287_200_000_i64
    }))
    .expect("millis");
    assert_eq!(
        millis.sent_at,
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single().expect("valid date")
    );

    let missing: Message = serde_json::from_value(json!({
        "_id": "m4",
        "sender": "bob",
        "receiver": "alice",
        "message": "y"
    }))
    .expect("missing");
    assert!(missing.sent_at <= Utc::now());
}

#[test]
fn edit_event_ignores_service_edited_flag() {
    let raw = r#"{"event":"message_edited","data":{"messageId":"m1","newContent":"x","edited":true}}"#;
    assert_eq!(
        serde_json::from_str::<ServerEvent>(raw).expect("event"),
        ServerEvent::MessageEdited(MessageEdited {
            message_id: MessageId::from("m1"),
            new_content: "x".into(),
        })
    );
}

#[test]
fn unknown_event_kind_is_rejected() {
    let raw = r#"{"event":"server_restarting","data":{}}"#;
    assert!(serde_json::from_str::<ServerEvent>(raw).is_err());
}

#[test]
fn edit_event_without_id_is_rejected() {
    let raw = r#"{"event":"message_edited","data":{"newContent":"x"}}"#;
    assert!(serde_json::from_str::<ServerEvent>(raw).is_err());
}

#[test]
fn tombstoned_message_has_no_display_content() {
    let mut message = Message::pending(
        Username::from("alice"),
        Username::from("bob"),
        "secret",
        "2024-03-01T10:00:00Z".parse().expect("timestamp"),
    );
    assert_eq!(message.display_content(), Some("secret"));
    message.deleted = true;
    assert_eq!(message.display_content(), None);
    assert_eq!(message.content, "secret");
}

#[test]
fn roster_entry_parses_presence_fields() {
    let user: PeerUser = serde_json::from_value(json!({
        "username": "bob",
        "avatar": "data:image/png;base64,AAAA",
        "isOnline": false,
        "lastSeen": "2024-03-01T09:55:00Z"
    }))
    .expect("user");
    assert_eq!(user.username, Username::from("bob"));
    assert!(!user.is_online);
    assert!(user.last_seen_at.is_some());
    assert!(user.avatar_ref.is_some());
}
