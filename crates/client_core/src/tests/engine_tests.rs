use super::*;
use chrono::Duration;
use shared::{
    domain::Reactions,
    protocol::{MessageDeleted, MessageEdited, MessageReacted, TypingSignal, UserStatus},
};

fn at(minute: i64) -> DateTime<Utc> {
    "2024-03-01T10:00:00Z"
        .parse::<DateTime<Utc>>()
        .expect("timestamp")
        + Duration::minutes(minute)
}

fn message(id: &str, sender: &str, receiver: &str, content: &str, minute: i64) -> Message {
    Message {
        id: Some(MessageId::from(id)),
        ..Message::pending(
            Username::from(sender),
            Username::from(receiver),
            content,
            at(minute),
        )
    }
}

fn alice() -> SyncEngine {
    let mut engine = SyncEngine::new(30);
    engine.start_session(Username::from("alice"));
    engine
}

fn alice_viewing(peer: &str, snapshot: Vec<Message>) -> SyncEngine {
    let mut engine = alice();
    let (tag, _) = engine.select_peer(Username::from(peer)).expect("select");
    engine.apply_snapshot(tag, snapshot).expect("current tag");
    engine
}

fn emits(effects: &[Effect]) -> Vec<&ClientRequest> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Emit(request) => Some(request),
            _ => None,
        })
        .collect()
}

fn notifications(effects: &[Effect]) -> Vec<&Notification> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Notify(notification) => Some(notification),
            _ => None,
        })
        .collect()
}

fn stored_ids(engine: &SyncEngine, peer: &str) -> Vec<Option<String>> {
    engine
        .conversation(&Username::from(peer))
        .expect("conversation")
        .messages()
        .iter()
        .map(|message| message.id.as_ref().map(|id| id.as_str().to_string()))
        .collect()
}

#[test]
fn new_messages_keep_delivery_order() {
    let mut engine = alice_viewing("bob", Vec::new());
    for event in [
        message("1", "bob", "alice", "A", 10),
        message("2", "bob", "alice", "B", 5),
        message("3", "alice", "bob", "C", 7),
    ] {
        engine.dispatch(ServerEvent::ReceiveMessage(event), at(20));
    }
    assert_eq!(
        stored_ids(&engine, "bob"),
        vec![Some("1".into()), Some("2".into()), Some("3".into())]
    );
}

#[test]
fn mutations_for_unknown_ids_change_nothing() {
    let mut engine = alice_viewing("bob", vec![message("1", "bob", "alice", "hello", 0)]);
    let before = engine.conversation(&Username::from("bob")).cloned();

    let mut effects = engine.dispatch(
        ServerEvent::MessageEdited(MessageEdited {
            message_id: MessageId::from("404"),
            new_content: "changed".into(),
        }),
        at(1),
    );
    effects.extend(engine.dispatch(
        ServerEvent::MessageDeleted(MessageDeleted {
            message_id: MessageId::from("404"),
        }),
        at(1),
    ));
    effects.extend(engine.dispatch(
        ServerEvent::MessageReacted(MessageReacted {
            message_id: MessageId::from("404"),
            reactions: Reactions::new(),
        }),
        at(1),
    ));

    assert!(effects.is_empty());
    assert_eq!(
        engine.conversation(&Username::from("bob")).map(|c| c.messages().to_vec()),
        before.map(|c| c.messages().to_vec())
    );
    assert_eq!(engine.stats().unmatched, 3);
}

#[test]
fn edit_delete_and_reaction_find_messages_outside_the_selection() {
    let mut engine = alice_viewing("carol", vec![message("c1", "carol", "alice", "hey", 0)]);
    engine.select_peer(Username::from("bob")).expect("select bob");

    engine.dispatch(
        ServerEvent::MessageEdited(MessageEdited {
            message_id: MessageId::from("c1"),
            new_content: "hey there".into(),
        }),
        at(1),
    );
    let reactions: Reactions = [(Username::from("alice"), "👍".to_string())]
        .into_iter()
        .collect();
    engine.dispatch(
        ServerEvent::MessageReacted(MessageReacted {
            message_id: MessageId::from("c1"),
            reactions: reactions.clone(),
        }),
        at(2),
    );

    let carol = engine
        .conversation(&Username::from("carol"))
        .expect("carol stays stored");
    let stored = &carol.messages()[0];
    assert_eq!(stored.content, "hey there");
    assert!(stored.edited);
    assert_eq!(stored.reactions, reactions);

    engine.dispatch(
        ServerEvent::MessageDeleted(MessageDeleted {
            message_id: MessageId::from("c1"),
        }),
        at(3),
    );
    let carol = engine.conversation(&Username::from("carol")).expect("carol");
    assert_eq!(carol.messages()[0].display_content(), None);
}

#[test]
fn snapshot_load_is_idempotent() {
    let snapshot = vec![
        message("1", "alice", "bob", "hi", 0),
        message("2", "bob", "alice", "hey", 1),
    ];
    let mut engine = alice();
    let (tag, _) = engine.select_peer(Username::from("bob")).expect("select");
    engine.apply_snapshot(tag, snapshot.clone()).expect("first");
    let first = engine
        .conversation(&Username::from("bob"))
        .expect("bob")
        .messages()
        .to_vec();
    engine.apply_snapshot(tag, snapshot).expect("second");
    let second = engine
        .conversation(&Username::from("bob"))
        .expect("bob")
        .messages()
        .to_vec();
    assert_eq!(first, second);
}

#[test]
fn read_receipt_round_trip_marks_exactly_the_unread_peer_messages() {
    let mut engine = alice();
    engine.apply_polled_unread([(Username::from("bob"), 3)].into_iter().collect());
    assert_eq!(engine.unread_count(&Username::from("bob")), 3);

    let mut already_read = message("0", "bob", "alice", "old", 0);
    already_read.read = true;
    let snapshot = vec![
        already_read,
        message("1", "bob", "alice", "a", 1),
        message("2", "alice", "bob", "b", 2),
        message("3", "bob", "alice", "c", 3),
        message("4", "bob", "alice", "d", 4),
    ];
    let (tag, _) = engine.select_peer(Username::from("bob")).expect("select");
    let effects = engine.apply_snapshot(tag, snapshot).expect("current tag");

    let emitted = emits(&effects);
    assert_eq!(emitted.len(), 1);
    let ClientRequest::MarkAsRead(ack) = emitted[0] else {
        panic!("expected mark_as_read, got {:?}", emitted[0]);
    };
    assert_eq!(
        ack.message_ids,
        vec![MessageId::from("1"), MessageId::from("3"), MessageId::from("4")]
    );
    assert_eq!(ack.sender, Username::from("bob"));
    assert_eq!(ack.receiver, Username::from("alice"));

    assert_eq!(engine.unread_count(&Username::from("bob")), 0);
    let bob = engine.conversation(&Username::from("bob")).expect("bob");
    assert!(bob.unread_from_peer().is_empty());
    assert!(!bob.messages()[2].read, "own message untouched");
}

#[test]
fn stale_snapshot_never_populates_new_selection() {
    let mut engine = alice();
    let (bob_tag, _) = engine.select_peer(Username::from("bob")).expect("bob");
    let (carol_tag, _) = engine.select_peer(Username::from("carol")).expect("carol");

    let late = engine.apply_snapshot(bob_tag, vec![message("b1", "bob", "alice", "late", 0)]);
    assert!(late.is_none());
    assert!(engine
        .conversation(&Username::from("carol"))
        .expect("carol opened")
        .is_empty());

    engine
        .apply_snapshot(carol_tag, vec![message("c1", "carol", "alice", "hi", 0)])
        .expect("current tag");
    assert_eq!(stored_ids(&engine, "carol"), vec![Some("c1".into())]);
}

#[test]
fn resync_supersedes_the_selection_fetch() {
    let mut engine = alice();
    let (select_tag, _) = engine.select_peer(Username::from("bob")).expect("bob");
    let (resync_tag, peer) = engine.resync().expect("resync");
    assert_eq!(peer, Username::from("bob"));
    assert!(engine.apply_snapshot(select_tag, Vec::new()).is_none());
    assert!(engine.apply_snapshot(resync_tag, Vec::new()).is_some());
}

#[test]
fn message_for_open_conversation_is_acknowledged_immediately() {
    let mut engine = alice_viewing("bob", Vec::new());
    let effects = engine.dispatch(
        ServerEvent::ReceiveMessage(message("9", "bob", "alice", "ping", 0)),
        at(0),
    );
    assert!(matches!(
        emits(&effects).as_slice(),
        [ClientRequest::MarkAsRead(ack)] if ack.message_ids == vec![MessageId::from("9")]
    ));
    assert!(notifications(&effects).is_empty());
    assert_eq!(engine.unread_count(&Username::from("bob")), 0);
    assert!(engine.conversation(&Username::from("bob")).expect("bob").messages()[0].read);
}

#[test]
fn message_from_other_peer_counts_and_notifies() {
    let mut engine = alice_viewing("bob", Vec::new());
    engine.set_permission(NotificationPermission::Granted);

    let effects = engine.dispatch(
        ServerEvent::ReceiveMessage(message(
            "c1",
            "carol",
            "alice",
            "this preview is definitely longer than thirty characters",
            0,
        )),
        at(0),
    );

    assert!(emits(&effects).is_empty());
    assert_eq!(engine.unread_count(&Username::from("carol")), 1);
    assert_eq!(engine.stats().orphaned, 1);
    let alerts = notifications(&effects);
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0], &Notification::Sound);
    let Notification::Desktop { title, body } = alerts[1] else {
        panic!("expected desktop notification");
    };
    assert_eq!(title, "New message from carol");
    assert_eq!(body.chars().count(), 30);
    assert!(body.ends_with('…'));
}

#[test]
fn own_echo_confirms_pending_message_in_place() {
    let mut engine = alice_viewing("bob", vec![message("1", "bob", "alice", "hi", 0)]);
    let (handle, effects) = engine.begin_send("hello bob", at(1)).expect("send");

    assert!(matches!(
        emits(&effects).as_slice(),
        [ClientRequest::SendMessage(outgoing)]
            if outgoing.content == "hello bob" && outgoing.receiver == Username::from("bob")
    ));
    assert_eq!(stored_ids(&engine, "bob"), vec![Some("1".into()), None]);
    assert!(engine
        .conversation(&Username::from("bob"))
        .expect("bob")
        .pending_message(handle)
        .is_some());

    let effects = engine.dispatch(
        ServerEvent::ReceiveMessage(message("2", "alice", "bob", "hello bob", 1)),
        at(1),
    );
    assert!(notifications(&effects).is_empty());
    assert_eq!(
        stored_ids(&engine, "bob"),
        vec![Some("1".into()), Some("2".into())]
    );
    assert_eq!(engine.unread_count(&Username::from("bob")), 0);
}

#[test]
fn send_rejects_blank_content_and_requires_selection() {
    let mut engine = alice();
    assert!(matches!(
        engine.begin_send("hello", at(0)),
        Err(ClientError::NoPeerSelected)
    ));
    engine.select_peer(Username::from("bob")).expect("select");
    assert!(matches!(
        engine.begin_send("   \n", at(0)),
        Err(ClientError::Validation(_))
    ));
    assert!(engine
        .conversation(&Username::from("bob"))
        .expect("bob")
        .is_empty());

    let mut logged_out = SyncEngine::new(30);
    assert!(matches!(
        logged_out.select_peer(Username::from("bob")),
        Err(ClientError::NotLoggedIn)
    ));
}

#[test]
fn typing_signals_follow_keystrokes_and_send() {
    let mut engine = alice_viewing("bob", Vec::new());
    let first = engine.keystroke().expect("peer selected");
    assert_eq!(
        emits(&first.effects),
        vec![&ClientRequest::Typing(TypingSignal {
            is_typing: true,
            to: Username::from("bob"),
        })]
    );
    let second = engine.keystroke().expect("peer selected");
    assert!(second.effects.is_empty());
    assert!(engine.expire_typing(&second.peer, first.generation).is_empty());

    let (_, effects) = engine.begin_send("done", at(0)).expect("send");
    assert_eq!(
        emits(&effects)[1],
        &ClientRequest::Typing(TypingSignal {
            is_typing: false,
            to: Username::from("bob"),
        })
    );
    assert!(engine.expire_typing(&second.peer, second.generation).is_empty());
}

#[test]
fn switching_peer_retracts_local_typing() {
    let mut engine = alice_viewing("bob", Vec::new());
    engine.keystroke().expect("peer selected");
    let (_, effects) = engine.select_peer(Username::from("carol")).expect("carol");
    assert_eq!(
        emits(&effects),
        vec![&ClientRequest::Typing(TypingSignal {
            is_typing: false,
            to: Username::from("bob"),
        })]
    );
}

#[test]
fn presence_updates_refresh_the_selected_copy() {
    let mut engine = alice();
    engine.replace_roster(vec![PeerUser::offline(Username::from("bob"))]);
    engine.select_peer(Username::from("bob")).expect("select");

    let effects = engine.dispatch(
        ServerEvent::UserStatus(UserStatus {
            username: Username::from("bob"),
            is_online: true,
            last_seen: None,
        }),
        at(0),
    );
    assert_eq!(effects.len(), 1);
    assert!(engine.selected().expect("selected").is_online);
    assert_eq!(
        engine.presence_label(&Username::from("bob"), &at(0)).as_deref(),
        Some("Online now")
    );

    engine.dispatch(
        ServerEvent::UserStatus(UserStatus {
            username: Username::from("bob"),
            is_online: false,
            last_seen: None,
        }),
        at(0),
    );
    assert_eq!(
        engine.presence_label(&Username::from("bob"), &at(5)).as_deref(),
        Some("Active 5 min ago")
    );
    assert_eq!(engine.selected().expect("selected").last_seen_at, Some(at(0)));
}

#[test]
fn remote_typing_only_publishes_changes() {
    let mut engine = alice();
    let notice = || {
        ServerEvent::Typing(shared::protocol::TypingNotice {
            from: Username::from("bob"),
            is_typing: true,
        })
    };
    assert_eq!(engine.dispatch(notice(), at(0)).len(), 1);
    assert!(engine.dispatch(notice(), at(0)).is_empty());
    assert!(engine.is_peer_typing(&Username::from("bob")));
}

#[test]
fn malformed_frames_are_counted_and_dropped() {
    let mut engine = alice();
    assert!(engine.dispatch_frame("not json", at(0)).is_empty());
    assert!(engine
        .dispatch_frame(r#"{"event":"teleport","data":{}}"#, at(0))
        .is_empty());
    assert!(engine
        .dispatch_frame(
            r#"{"event":"receive_message","data":{"sender":"bob","receiver":"alice","message":"x","timestamp":"2024-03-01T10:00:00Z"}}"#,
            at(0),
        )
        .is_empty());
    assert_eq!(engine.stats().malformed, 3);
}

#[test]
fn message_with_locale_timestamp_is_stored_at_receipt_time() {
    let mut engine = alice_viewing("bob", vec![message("1", "bob", "alice", "earlier", 0)]);
    let before = Utc::now();
    engine.dispatch_frame(
        r#"{"event":"receive_message","data":{"_id":"2","sender":"bob","receiver":"alice","message":"typed on an old client","timestamp":"10:31:22 AM"}}"#,
        at(5),
    );

    assert_eq!(engine.stats(), DiscardStats::default());
    assert_eq!(
        stored_ids(&engine, "bob"),
        vec![Some("1".to_string()), Some("2".to_string())]
    );
    let stored = &engine
        .conversation(&Username::from("bob"))
        .expect("conversation")
        .messages()[1];
    assert_eq!(stored.content, "typed on an old client");
    assert!(stored.sent_at >= before);
}

#[test]
fn connecting_joins_the_owner_room_and_resets_typing() {
    let mut engine = alice();
    engine.dispatch(
        ServerEvent::Typing(shared::protocol::TypingNotice {
            from: Username::from("bob"),
            is_typing: true,
        }),
        at(0),
    );
    let (epoch, _) = engine.open_channel().expect("open");
    let effects = engine
        .advance_connection(epoch, ConnectionState::Connected)
        .expect("transition")
        .expect("current epoch");
    assert_eq!(
        emits(&effects),
        vec![&ClientRequest::JoinRoom(Username::from("alice"))]
    );
    assert!(!engine.is_peer_typing(&Username::from("bob")));

    engine.close_channel().expect("close");
    assert!(engine
        .advance_connection(epoch, ConnectionState::Connected)
        .expect("stale is not an error")
        .is_none());
}

#[test]
fn reset_forgets_the_session() {
    let mut engine = alice_viewing("bob", vec![message("1", "bob", "alice", "hi", 0)]);
    engine.apply_polled_unread([(Username::from("carol"), 2)].into_iter().collect());
    engine.reset();

    assert!(!engine.has_session());
    assert!(engine.selected().is_none());
    assert!(engine.conversation(&Username::from("bob")).is_none());
    assert!(engine.unread_counts().is_empty());
    assert_eq!(engine.connection_state(), ConnectionState::Idle);
    assert!(engine.open_channel().is_err());
    assert!(engine
        .dispatch(
            ServerEvent::ReceiveMessage(message("2", "bob", "alice", "late", 1)),
            at(1)
        )
        .is_empty());
}
