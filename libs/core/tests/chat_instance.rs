use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use gcw_core::{
    BroadcastBus, ChatError, ChatInstance, ConnectionDescriptor, Envelope, InstanceId, NoopBus,
    PageEvent, RejectReason, RetryPolicy, SessionKey, SubmitOutcome, TransportKind, TransportState, UiState,
    WidgetInput, WidgetInteractionState,
};
use gcw_testutil::TestBackend;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn quiet(url: impl Into<String>) -> ConnectionDescriptor {
    let mut descriptor = ConnectionDescriptor::new(url);
    descriptor.presentation.greet_on_connect = false;
    descriptor
}

fn texts(instance: &ChatInstance) -> Vec<String> {
    instance.messages().map(|m| m.text.clone()).collect()
}

/// Applies connection events until `done` holds.
async fn wait_until(
    instance: &mut ChatInstance,
    done: impl Fn(&ChatInstance) -> bool,
) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !done(&*instance) {
            if instance.next_event().await.is_none() {
                bail!("connection closed while waiting");
            }
        }
        Ok(())
    })
    .await?
}

fn drain(events: &mut broadcast::Receiver<Envelope>) -> Vec<Envelope> {
    let mut seen = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        seen.push(envelope);
    }
    seen
}

#[tokio::test]
async fn cors_replies_follow_their_messages_in_order() -> Result<()> {
    let backend = TestBackend::start().await?;
    let mut instance = ChatInstance::new(quiet(backend.http_url()), Arc::new(NoopBus))?;
    assert_eq!(instance.transport_kind(), TransportKind::Cors);

    instance.connect().await?;
    assert_eq!(instance.transport_state(), TransportState::Connected);
    assert_eq!(instance.session_key(), SessionKey::parse("abc123"));

    for text in ["one", "two", "three"] {
        instance.send_text(text).await?;
    }
    assert_eq!(
        texts(&instance),
        ["one", "echo: one", "two", "echo: two", "three", "echo: three"]
    );

    let sent = backend.requests_of_type("message");
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|request| request["sessionKey"] == "abc123"));
    assert!(matches!(
        instance.send_text("   ").await,
        Err(ChatError::EmptyMessage)
    ));
    Ok(())
}

#[tokio::test]
async fn greeting_is_requested_once_per_instance() -> Result<()> {
    let backend = TestBackend::start().await?;
    let mut instance =
        ChatInstance::new(ConnectionDescriptor::new(backend.http_url()), Arc::new(NoopBus))?;

    instance.connect().await?;
    instance.reconnect().await?;

    assert_eq!(texts(&instance), ["Hello! How can I help?"]);
    assert_eq!(backend.requests_of_type("connect").len(), 1);
    assert_eq!(backend.requests_of_type("handshake").len(), 2);
    Ok(())
}

#[tokio::test]
async fn failed_greeting_is_requested_again_on_reconnect() -> Result<()> {
    let backend = TestBackend::start().await?;
    backend.outage_from("connect");
    let descriptor = ConnectionDescriptor::new(backend.http_url()).with_retry_policy(RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    });
    let mut instance = ChatInstance::new(descriptor, Arc::new(NoopBus))?;

    assert!(instance.connect().await.is_err());
    assert_eq!(instance.transport_state(), TransportState::Failed);
    assert!(backend.requests_of_type("connect").is_empty());

    backend.fail_next(0);
    instance.reconnect().await?;

    assert_eq!(texts(&instance), ["Hello! How can I help?"]);
    assert_eq!(backend.requests_of_type("connect").len(), 1);
    assert_eq!(backend.requests_of_type("handshake").len(), 2);
    Ok(())
}

#[tokio::test]
async fn handshake_message_is_shown_as_bot_message() -> Result<()> {
    let backend = TestBackend::start().await?;
    backend.handshake_message("Welcome back");
    let mut instance = ChatInstance::new(quiet(backend.http_url()), Arc::new(NoopBus))?
        .with_session_key(SessionKey::parse("kept-key").unwrap());

    instance.connect().await?;

    assert_eq!(texts(&instance), ["Welcome back"]);
    assert_eq!(instance.session_key(), SessionKey::parse("kept-key"));
    assert_eq!(
        backend.requests_of_type("handshake")[0]["sessionKey"],
        "kept-key"
    );
    Ok(())
}

#[tokio::test]
async fn jsonp_can_be_forced_on_a_websocket_url() -> Result<()> {
    let backend = TestBackend::start().await?;
    let descriptor = quiet(format!("ws://{}/chat", backend.addr()))
        .with_forced_transport(TransportKind::Jsonp);
    let mut instance = ChatInstance::new(descriptor, Arc::new(NoopBus))?;
    assert_eq!(instance.transport_kind(), TransportKind::Jsonp);

    instance.connect().await?;
    instance.send_text("hello").await?;

    assert_eq!(texts(&instance), ["hello", "echo: hello"]);
    assert_eq!(backend.upgrades(), 0);
    let sent = backend.requests_of_type("message");
    assert_eq!(sent[0]["text"], "hello");
    assert_eq!(sent[0]["sessionKey"], "abc123");
    Ok(())
}

#[tokio::test]
async fn websocket_replies_arrive_as_events() -> Result<()> {
    let backend = TestBackend::start().await?;
    let mut instance =
        ChatInstance::new(ConnectionDescriptor::new(backend.ws_url()), Arc::new(NoopBus))?;
    assert_eq!(instance.transport_kind(), TransportKind::WebSocket);

    instance.connect().await?;
    wait_until(&mut instance, |i| i.messages().len() == 1).await?;
    instance.send_text("ping").await?;
    wait_until(&mut instance, |i| i.messages().len() == 3).await?;

    assert_eq!(
        texts(&instance),
        ["Hello! How can I help?", "ping", "echo: ping"]
    );
    assert_eq!(backend.upgrades(), 1);
    Ok(())
}

#[tokio::test]
async fn typing_signals_are_not_logged() -> Result<()> {
    let backend = TestBackend::start().await?;
    let mut instance = ChatInstance::new(quiet(backend.http_url()), Arc::new(NoopBus))?;
    assert!(matches!(
        instance.set_typing(true).await,
        Err(ChatError::NotConnected(TransportState::Disconnected))
    ));

    instance.connect().await?;
    instance.set_typing(true).await?;

    assert_eq!(instance.messages().len(), 0);
    let typing = backend.requests_of_type("typing");
    assert_eq!(typing[0]["payload"]["typing"], true);
    Ok(())
}

#[tokio::test]
async fn backend_errors_are_shown_and_warnings_are_not() -> Result<()> {
    let backend = TestBackend::start().await?;
    backend.respond_with(|request| match request["text"].as_str() {
        Some("err") => Some(json!({"type": "error", "message": "Backend busy"})),
        Some("warn") => Some(json!({"type": "error", "message": "slow", "severity": "warning"})),
        _ => None,
    });
    let mut instance = ChatInstance::new(quiet(backend.http_url()), Arc::new(NoopBus))?;
    instance.connect().await?;

    instance.send_text("err").await?;
    instance.send_text("warn").await?;

    assert_eq!(texts(&instance), ["err", "Backend busy", "warn"]);
    Ok(())
}

#[tokio::test]
async fn choice_widget_accepts_one_interaction() -> Result<()> {
    let backend = TestBackend::start().await?;
    backend.respond_with(|request| {
        (request["text"] == "pick").then(|| {
            json!({
                "text": "Pick one",
                "sender": "bot",
                "widget": {"type": "buttons", "options": ["yes", "no"]},
            })
        })
    });
    let bus = BroadcastBus::new();
    let mut page = bus.subscribe();
    let mut instance = ChatInstance::new(quiet(backend.http_url()), Arc::new(bus))?;
    instance.connect().await?;

    instance.send_text("pick").await?;
    let widget_id = instance.latest_widget().cloned().expect("widget rendered");
    assert_eq!(
        instance.widget_state(&widget_id),
        Some(WidgetInteractionState::Pending)
    );
    assert!(widget_id.as_str().starts_with(instance.instance_id().as_str()));

    let outcome = instance
        .submit_widget(&widget_id, WidgetInput::Choice("maybe".into()))
        .await?;
    assert!(matches!(
        outcome,
        SubmitOutcome::Rejected(RejectReason::UnknownOption(_))
    ));

    let SubmitOutcome::Accepted(event) = instance
        .submit_widget(&widget_id, WidgetInput::Choice("yes".into()))
        .await?
    else {
        panic!("interaction not accepted");
    };
    assert_eq!(event.option_value, "yes");
    assert_eq!(
        instance.widget_state(&widget_id),
        Some(WidgetInteractionState::Disabled)
    );
    assert_eq!(
        instance
            .submit_widget(&widget_id, WidgetInput::Choice("no".into()))
            .await?,
        SubmitOutcome::Ignored
    );

    assert_eq!(texts(&instance), ["pick", "Pick one", "yes", "echo: yes"]);
    let sent = backend.requests_of_type("message");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1]["interaction"]["widgetId"], widget_id.as_str());

    let interactions: Vec<_> = drain(&mut page)
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            PageEvent::Interaction(event) => Some((envelope.subject, event)),
            PageEvent::Connectivity(_) => None,
        })
        .collect();
    assert_eq!(interactions.len(), 1);
    assert!(interactions[0].0.is_for(instance.instance_id()));
    assert_eq!(interactions[0].1, event);
    Ok(())
}

#[tokio::test]
async fn input_widget_validates_before_submitting() -> Result<()> {
    let backend = TestBackend::start().await?;
    backend.respond_with(|request| {
        (request["text"] == "email").then(|| {
            json!({
                "text": "Your email?",
                "sender": "bot",
                "widget": {"type": "input", "pattern": r"[^@\s]+@[^@\s]+\.[a-z]+"},
            })
        })
    });
    let mut instance = ChatInstance::new(quiet(backend.http_url()), Arc::new(NoopBus))?;
    instance.connect().await?;
    instance.send_text("email").await?;
    let widget_id = instance.latest_widget().cloned().expect("widget rendered");

    assert_eq!(
        instance.submit_widget(&widget_id, "not an email").await?,
        SubmitOutcome::Rejected(RejectReason::PatternMismatch)
    );
    let SubmitOutcome::Accepted(event) = instance.submit_widget(&widget_id, "test@example.com").await?
    else {
        panic!("interaction not accepted");
    };
    assert_eq!(event.option_id.as_deref(), Some("input-submit"));
    assert_eq!(event.option_value, "test@example.com");
    assert_eq!(
        instance.widget_state(&widget_id),
        Some(WidgetInteractionState::Disabled)
    );
    Ok(())
}

#[tokio::test]
async fn unread_counts_while_closed_and_state_survives_reopen() -> Result<()> {
    let backend = TestBackend::start().await?;
    let mut instance =
        ChatInstance::new(ConnectionDescriptor::new(backend.http_url()), Arc::new(NoopBus))?;
    assert_eq!(instance.ui_state(), UiState::Closed);

    instance.connect().await?;
    assert_eq!(instance.unread(), 1);
    instance.open_ui();
    assert_eq!(instance.unread(), 0);

    instance.send_text("first").await?;
    assert_eq!(instance.unread(), 0);
    assert_eq!(instance.toggle_ui(), UiState::Closed);
    instance.send_text("second").await?;
    assert_eq!(instance.unread(), 1);

    assert_eq!(instance.toggle_ui(), UiState::Open);
    assert_eq!(instance.unread(), 0);
    assert_eq!(instance.messages().len(), 5);
    assert_eq!(instance.transport_state(), TransportState::Connected);
    assert_eq!(instance.transport_kind(), TransportKind::Cors);
    assert_eq!(instance.session_key(), SessionKey::parse("abc123"));
    assert_eq!(backend.requests_of_type("handshake").len(), 1);
    Ok(())
}

#[tokio::test]
async fn history_is_trimmed_with_its_widgets() -> Result<()> {
    let backend = TestBackend::start().await?;
    backend.respond_with(|request| {
        (request["text"] == "pick").then(|| {
            json!({"text": "Pick one", "widget": {"type": "buttons", "options": ["a"]}})
        })
    });
    let mut descriptor = quiet(backend.http_url());
    descriptor.presentation.max_history = 3;
    let mut instance = ChatInstance::new(descriptor, Arc::new(NoopBus))?;
    instance.connect().await?;

    instance.send_text("pick").await?;
    let widget_id = instance.latest_widget().cloned().expect("widget rendered");
    instance.send_text("a").await?;
    instance.send_text("b").await?;

    assert_eq!(texts(&instance), ["echo: a", "b", "echo: b"]);
    assert!(instance.widget(&widget_id).is_none());
    assert!(matches!(
        instance.submit_widget(&widget_id, "a").await,
        Err(ChatError::UnknownWidget(_))
    ));
    Ok(())
}

#[tokio::test]
async fn instances_on_one_bus_stay_isolated() -> Result<()> {
    let backend = TestBackend::start().await?;
    let bus = Arc::new(BroadcastBus::new());
    let mut page = bus.subscribe();

    let mut left = ChatInstance::new(quiet(backend.http_url()), bus.clone())?
        .with_instance_id(InstanceId::from_name("gcw-left"));
    let mut right = ChatInstance::new(quiet(backend.http_url()), bus.clone())?
        .with_instance_id(InstanceId::from_name("gcw-right"))
        .with_session_key(SessionKey::parse("right-key").unwrap());

    left.connect().await?;
    right.connect().await?;
    assert_eq!(left.session_key(), SessionKey::parse("abc123"));
    assert_eq!(right.session_key(), SessionKey::parse("right-key"));

    left.close().await;
    assert_eq!(left.transport_state(), TransportState::Disconnected);
    assert!(matches!(
        left.send_text("anyone?").await,
        Err(ChatError::NotConnected(TransportState::Disconnected))
    ));

    right.send_text("still here").await?;
    assert_eq!(texts(&right), ["still here", "echo: still here"]);
    assert_eq!(left.messages().len(), 0);
    assert_eq!(
        backend.requests_of_type("message")[0]["sessionKey"],
        "right-key"
    );

    let seen = drain(&mut page);
    assert!(!seen.is_empty());
    for envelope in &seen {
        assert!(envelope.subject.is_for(envelope.event.instance_id()));
    }
    assert!(
        seen.iter()
            .any(|envelope| envelope.event.instance_id().as_str() == "gcw-left")
    );
    assert!(
        seen.iter()
            .any(|envelope| envelope.event.instance_id().as_str() == "gcw-right")
    );
    let left_states: Vec<_> = seen
        .iter()
        .filter_map(|envelope| match &envelope.event {
            PageEvent::Connectivity(event) if event.instance_id.as_str() == "gcw-left" => {
                Some(event.state)
            }
            _ => None,
        })
        .collect();
    assert_eq!(left_states.last(), Some(&TransportState::Disconnected));
    Ok(())
}
