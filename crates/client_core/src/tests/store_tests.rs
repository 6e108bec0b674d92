use super::*;
use crate::tests_support::{at, conversation, message, pending};

fn ids(state: &ConversationListState) -> Vec<&str> {
    state
        .conversations
        .iter()
        .map(|conversation| conversation.id.as_str())
        .collect()
}

fn loaded(conversations: Vec<Conversation>) -> ConversationListState {
    reduce_list(
        ConversationListState::default(),
        ListAction::Loaded {
            conversations,
            from_cache: false,
        },
    )
}

fn selected_with(conversation: Conversation) -> SelectedConversationState {
    let state = reduce_selected(
        SelectedConversationState::default(),
        SelectedAction::SelectStarted {
            conversation_id: conversation.id.clone(),
        },
    );
    reduce_selected(
        state,
        SelectedAction::Loaded {
            conversation,
            carried: Vec::new(),
        },
    )
}

#[test]
fn list_is_sorted_by_latest_activity_and_deduplicated() {
    let mut active = conversation("c1", 1);
    active.last_activity = Some(at(30));
    let state = loaded(vec![
        conversation("c2", 10),
        active,
        conversation("c3", 20),
        conversation("c2", 40),
    ]);

    assert_eq!(ids(&state), vec!["c1", "c3", "c2"]);
    assert!(!state.loading);
    assert!(!state.from_cache);
}

#[test]
fn equal_activity_keeps_prior_order() {
    let state = loaded(vec![conversation("a", 5), conversation("b", 5)]);
    let state = reduce_list(
        state,
        ListAction::MarkedRead {
            conversation_id: ConversationId::from("b"),
        },
    );
    assert_eq!(ids(&state), vec!["a", "b"]);
}

#[test]
fn committed_customer_messages_raise_unread_and_move_conversation_up() {
    let state = loaded(vec![conversation("c1", 1), conversation("c2", 5)]);
    let state = reduce_list(
        state,
        ListAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![message("c1", "m1", 10, 1), message("c1", "m2", 11, 2)],
            mark_read: false,
        },
    );

    assert_eq!(ids(&state), vec!["c1", "c2"]);
    let c1 = state.get(&ConversationId::from("c1")).expect("c1");
    assert_eq!(c1.unread_count, 2);
    assert!(!c1.last_message_read);
    assert_eq!(c1.last_activity, Some(at(11)));
    assert_eq!(
        c1.last_message.as_ref().map(|last| last.text.as_str()),
        Some("text m2")
    );
}

#[test]
fn committed_messages_marked_read_reset_unread() {
    let mut c1 = conversation("c1", 1);
    c1.unread_count = 4;
    let state = loaded(vec![c1]);
    let state = reduce_list(
        state,
        ListAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![message("c1", "m1", 10, 1)],
            mark_read: true,
        },
    );

    let c1 = state.get(&ConversationId::from("c1")).expect("c1");
    assert_eq!(c1.unread_count, 0);
    assert!(c1.last_message_read);
    assert!(c1.messages.iter().all(|message| message.read));
}

#[test]
fn agent_messages_do_not_raise_unread() {
    let mut outgoing = message("c1", "m1", 10, 1);
    outgoing.sender = Sender::Agent;
    let state = reduce_list(
        loaded(vec![conversation("c1", 1)]),
        ListAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![outgoing],
            mark_read: false,
        },
    );
    assert_eq!(
        state
            .get(&ConversationId::from("c1"))
            .expect("c1")
            .unread_count,
        0
    );
}

#[test]
fn redelivered_message_is_not_counted_twice() {
    let action = || ListAction::MessagesCommitted {
        conversation_id: ConversationId::from("c1"),
        messages: vec![message("c1", "m1", 10, 1)],
        mark_read: false,
    };
    let state = reduce_list(loaded(vec![conversation("c1", 1)]), action());
    let state = reduce_list(state, action());

    let c1 = state.get(&ConversationId::from("c1")).expect("c1");
    assert_eq!(c1.unread_count, 1);
    assert_eq!(c1.messages.len(), 1);
}

#[test]
fn older_message_does_not_replace_preview() {
    let state = reduce_list(
        loaded(vec![conversation("c1", 1)]),
        ListAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![message("c1", "late", 20, 1)],
            mark_read: false,
        },
    );
    let state = reduce_list(
        state,
        ListAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![message("c1", "early", 5, 2)],
            mark_read: false,
        },
    );

    let c1 = state.get(&ConversationId::from("c1")).expect("c1");
    assert_eq!(
        c1.last_message.as_ref().map(|last| last.text.as_str()),
        Some("text late")
    );
    assert_eq!(c1.last_activity, Some(at(20)));
}

#[test]
fn upsert_keeps_local_messages_when_update_has_none() {
    let state = reduce_list(
        loaded(vec![conversation("c1", 1)]),
        ListAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![message("c1", "m1", 10, 1)],
            mark_read: false,
        },
    );
    let mut update = conversation("c1", 1);
    update.status = shared::domain::ConversationStatus::InProgress;
    let state = reduce_list(
        state,
        ListAction::Upserted {
            conversation: update,
        },
    );

    let c1 = state.get(&ConversationId::from("c1")).expect("c1");
    assert_eq!(c1.status, shared::domain::ConversationStatus::InProgress);
    assert_eq!(c1.messages.len(), 1);
    assert_eq!(c1.last_activity, Some(at(10)));
}

#[test]
fn upsert_inserts_unknown_conversation_in_order() {
    let state = loaded(vec![conversation("c1", 1), conversation("c2", 5)]);
    let state = reduce_list(
        state,
        ListAction::Upserted {
            conversation: conversation("c3", 3),
        },
    );
    assert_eq!(ids(&state), vec!["c2", "c3", "c1"]);
}

#[test]
fn removed_conversation_leaves_the_list() {
    let state = reduce_list(
        loaded(vec![conversation("c1", 1), conversation("c2", 5)]),
        ListAction::Removed {
            conversation_id: ConversationId::from("c2"),
        },
    );
    assert_eq!(ids(&state), vec!["c1"]);
}

#[test]
fn cache_load_is_flagged_and_keeps_error() {
    let state = reduce_list(
        ConversationListState::default(),
        ListAction::LoadStarted {
            filters: ConversationFilters::default(),
        },
    );
    assert!(state.loading);
    let state = reduce_list(
        state,
        ListAction::LoadFailed {
            error: "offline".to_string(),
        },
    );
    let state = reduce_list(
        state,
        ListAction::Loaded {
            conversations: vec![conversation("c1", 1)],
            from_cache: true,
        },
    );
    assert!(state.from_cache);
    assert!(!state.loading);
    assert_eq!(state.error.as_deref(), Some("offline"));
}

#[test]
fn selected_messages_are_ordered_by_sequence() {
    let state = selected_with(conversation("c1", 1));
    let state = reduce_selected(
        state,
        SelectedAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![message("c1", "m2", 5, 2), message("c1", "m1", 9, 1)],
            mark_read: true,
        },
    );

    let order: Vec<&str> = state
        .messages()
        .iter()
        .map(|message| message.id.as_str())
        .collect();
    assert_eq!(order, vec!["m1", "m2"]);
}

#[test]
fn stale_load_for_previous_selection_is_ignored() {
    let state = reduce_selected(
        SelectedConversationState::default(),
        SelectedAction::SelectStarted {
            conversation_id: ConversationId::from("c1"),
        },
    );
    let state = reduce_selected(
        state,
        SelectedAction::SelectStarted {
            conversation_id: ConversationId::from("c2"),
        },
    );
    let state = reduce_selected(
        state,
        SelectedAction::Loaded {
            conversation: conversation("c1", 1),
            carried: Vec::new(),
        },
    );

    assert_eq!(state.conversation_id, Some(ConversationId::from("c2")));
    assert!(state.conversation.is_none());
    assert!(state.loading);
}

#[test]
fn reconcile_replaces_temp_entry_in_place() {
    let mut optimistic = message("c1", "temp-1", 10, 3);
    optimistic.temp_id = Some("temp-1".to_string());
    optimistic.sender = Sender::Agent;
    optimistic.status = MessageStatus::Sending;
    let state = reduce_selected(
        selected_with(conversation("c1", 1)),
        SelectedAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![optimistic],
            mark_read: true,
        },
    );

    let mut confirmed = message("c1", "srv-1", 10, 0);
    confirmed.sender = Sender::Agent;
    let state = reduce_selected(
        state,
        SelectedAction::MessageReconciled {
            temp_id: "temp-1".to_string(),
            message: confirmed,
        },
    );

    let messages = state.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "srv-1");
    assert_eq!(messages[0].temp_id.as_deref(), Some("temp-1"));
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[0].sequence, 3);
}

#[test]
fn reconcile_after_echo_leaves_a_single_entry() {
    let mut optimistic = message("c1", "temp-1", 10, 1);
    optimistic.temp_id = Some("temp-1".to_string());
    optimistic.sender = Sender::Agent;
    optimistic.status = MessageStatus::Sending;
    let mut echo = message("c1", "srv-1", 10, 2);
    echo.sender = Sender::Agent;

    let state = reduce_selected(
        selected_with(conversation("c1", 1)),
        SelectedAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![optimistic, echo.clone()],
            mark_read: true,
        },
    );
    assert_eq!(state.messages().len(), 2);

    let state = reduce_selected(
        state,
        SelectedAction::MessageReconciled {
            temp_id: "temp-1".to_string(),
            message: Message {
                sequence: 0,
                ..echo
            },
        },
    );

    let messages = state.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "srv-1");
    assert_eq!(messages[0].sequence, 1);
}

#[test]
fn status_change_finds_message_by_temp_id() {
    let mut optimistic = message("c1", "temp-9", 10, 1);
    optimistic.temp_id = Some("temp-9".to_string());
    optimistic.status = MessageStatus::Sending;
    let state = reduce_selected(
        selected_with(conversation("c1", 1)),
        SelectedAction::MessagesCommitted {
            conversation_id: ConversationId::from("c1"),
            messages: vec![optimistic],
            mark_read: true,
        },
    );
    let state = reduce_selected(
        state,
        SelectedAction::MessageStatusChanged {
            message_id: "temp-9".to_string(),
            status: MessageStatus::Failed,
        },
    );
    assert_eq!(state.messages()[0].status, MessageStatus::Failed);
}

fn counter_from(start: u64) -> impl FnMut() -> u64 {
    let mut next = start;
    move || {
        next += 1;
        next
    }
}

fn message_ids(state: &SelectedConversationState) -> Vec<(&str, u64)> {
    state
        .messages()
        .iter()
        .map(|message| (message.id.as_str(), message.sequence))
        .collect()
}

#[test]
fn reload_stamps_local_messages_after_fetched_history() {
    let store = ConversationStore::new();
    let c1 = ConversationId::from("c1");
    store.dispatch_selected(SelectedAction::SelectStarted {
        conversation_id: c1.clone(),
    });
    store.load_selected(conversation("c1", 1), Vec::new(), counter_from(0));

    let mut pending = message("c1", "temp-2", 30, 2);
    pending.temp_id = Some("temp-2".to_string());
    pending.status = MessageStatus::Pending;
    store.dispatch_selected(SelectedAction::MessagesCommitted {
        conversation_id: c1.clone(),
        messages: vec![pending, message("c1", "m-live", 31, 3)],
        mark_read: true,
    });

    store.dispatch_selected(SelectedAction::SelectStarted {
        conversation_id: c1.clone(),
    });
    let mut fresh = conversation("c1", 1);
    fresh.messages = vec![message("c1", "m1", 5, 10), message("c1", "m3", 6, 11)];
    store.load_selected(fresh, Vec::new(), counter_from(11));

    let state = store.selected();
    assert_eq!(
        message_ids(&state),
        vec![("m1", 10), ("m3", 11), ("temp-2", 12), ("m-live", 13)]
    );
    assert_eq!(state.messages()[2].status, MessageStatus::Pending);
    assert!(!state.loading);
}

#[test]
fn messages_arriving_while_loading_join_the_fetched_view() {
    let store = ConversationStore::new();
    let c1 = ConversationId::from("c1");
    store.dispatch_selected(SelectedAction::SelectStarted {
        conversation_id: c1.clone(),
    });
    assert!(store.is_selected(&c1));
    assert!(!store.is_open(&c1));

    store.dispatch_selected(SelectedAction::MessagesCommitted {
        conversation_id: c1.clone(),
        messages: vec![message("c1", "m-live", 20, 4)],
        mark_read: false,
    });
    assert!(store.selected().messages().is_empty());
    assert_eq!(store.selected().arrived.len(), 1);

    let mut fetched = conversation("c1", 1);
    fetched.messages = vec![message("c1", "m1", 5, 5), message("c1", "m2", 6, 6)];
    store.load_selected(fetched, Vec::new(), counter_from(6));

    let state = store.selected();
    assert_eq!(
        message_ids(&state),
        vec![("m1", 5), ("m2", 6), ("m-live", 7)]
    );
    assert!(state.arrived.is_empty());
    assert!(store.is_open(&c1));
}

#[test]
fn arrival_already_in_fetched_history_is_not_duplicated() {
    let store = ConversationStore::new();
    let c1 = ConversationId::from("c1");
    store.dispatch_selected(SelectedAction::SelectStarted {
        conversation_id: c1.clone(),
    });
    store.dispatch_selected(SelectedAction::MessagesCommitted {
        conversation_id: c1,
        messages: vec![message("c1", "m2", 6, 2)],
        mark_read: false,
    });

    let mut fetched = conversation("c1", 1);
    fetched.messages = vec![message("c1", "m1", 5, 3), message("c1", "m2", 6, 4)];
    store.load_selected(fetched, Vec::new(), counter_from(4));

    assert_eq!(message_ids(&store.selected()), vec![("m1", 3), ("m2", 4)]);
}

#[test]
fn queued_entries_from_a_previous_run_show_as_pending() {
    let store = ConversationStore::new();
    store.dispatch_selected(SelectedAction::SelectStarted {
        conversation_id: ConversationId::from("c1"),
    });
    let mut fetched = conversation("c1", 1);
    fetched.messages = vec![message("c1", "m1", 5, 1)];
    let queued = vec![
        pending("temp-b", "c1", 40).to_message(0),
        pending("temp-a", "c1", 30).to_message(0),
        pending("temp-x", "c2", 10).to_message(0),
    ];

    store.load_selected(fetched, queued, counter_from(1));

    let state = store.selected();
    assert_eq!(
        message_ids(&state),
        vec![("m1", 1), ("temp-a", 2), ("temp-b", 3)]
    );
    assert!(state.messages()[1..]
        .iter()
        .all(|message| message.status == MessageStatus::Pending));
}

#[test]
fn load_for_a_conversation_no_longer_selected_is_ignored() {
    let store = ConversationStore::new();
    store.dispatch_selected(SelectedAction::SelectStarted {
        conversation_id: ConversationId::from("c2"),
    });
    let mut calls = 0;
    store.load_selected(conversation("c1", 1), Vec::new(), || {
        calls += 1;
        calls
    });

    assert_eq!(calls, 0);
    assert!(store.selected().conversation.is_none());
}

#[test]
fn typing_for_other_conversation_is_ignored() {
    let state = selected_with(conversation("c1", 1));
    let state = reduce_selected(
        state,
        SelectedAction::TypingChanged {
            conversation_id: ConversationId::from("c2"),
            users: vec![UserId::from("u1")],
        },
    );
    assert!(state.typing_users.is_empty());
}

#[tokio::test]
async fn store_publishes_to_watchers() {
    let store = ConversationStore::new();
    let mut list = store.watch_list();

    store.dispatch_list(ListAction::Loaded {
        conversations: vec![conversation("c1", 1)],
        from_cache: false,
    });

    list.changed().await.expect("list change");
    assert_eq!(list.borrow().conversations.len(), 1);
    assert!(store.contains(&ConversationId::from("c1")));

    store.reset();
    assert!(store.list().conversations.is_empty());
    assert_eq!(store.selected_id(), None);
}
