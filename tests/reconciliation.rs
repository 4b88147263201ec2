use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_core::{
    is_recoverable, EngineError, EventKind, InboundMessage, Reconciler, ReconcilerSettings,
    ReservationKind, Reservations, SourceRouter, WindowingConfig, WindowingStrategy,
};

const VIDEO: &str = "/plugins/video";
const GATE: &str = "/plugins/gate";
const TTL: Duration = Duration::from_secs(30);

fn engine(reservations: Reservations) -> Reconciler {
    let settings = ReconcilerSettings {
        windowing: WindowingConfig {
            strategy: WindowingStrategy::None,
            window_size: 1,
            defined_min: 0.3,
            defined_max: 0.7,
        },
        event_ttl: TTL,
        static_metadata: json!({"lot": "north"}),
    };
    let router = SourceRouter::new(vec![VIDEO.to_string()], GATE);
    Reconciler::new(settings, router, Arc::new(reservations))
}

fn gate(entered: i64) -> InboundMessage {
    InboundMessage::new(GATE, json!({ "entered": entered }).to_string())
}

fn batch(places: Value) -> InboundMessage {
    InboundMessage::new(
        VIDEO,
        json!({"parking_places": places, "parking": {"name": "north"}}).to_string(),
    )
}

fn handle(engine: &mut Reconciler, message: InboundMessage) -> Value {
    engine
        .handle(&message)
        .expect("handled")
        .expect("engine is active")
}

#[test]
fn gate_events_before_first_batch_are_ledgered_silently() {
    let mut engine = engine(Reservations::new());
    assert!(engine.handle(&gate(0)).unwrap().is_none());
    assert!(engine.handle(&gate(0)).unwrap().is_none());
    assert!(!engine.is_active());
    assert_eq!(engine.ledger().len(), 2);

    let out = handle(&mut engine, batch(json!({"1": [0, 0.1], "2": [0, 0.2]})));
    assert!(engine.is_active());
    assert_eq!(out["parking"]["in_movement"], 2);
    assert_eq!(out["parking"]["free"], 2);
    assert_eq!(out["parking"]["free_to_display"], 0);
    assert_eq!(out["parking"]["name"], "north");
    assert_eq!(out["metadata"]["static_metadata"]["lot"], "north");
}

#[test]
fn slot_transition_is_diffed_against_state_before_the_update() {
    let mut engine = engine(Reservations::new());
    handle(&mut engine, batch(json!({"1": [0, 0.1], "2": [1, 0.9]})));
    handle(&mut engine, gate(0));

    let out = handle(&mut engine, batch(json!({"1": [1, 0.95], "2": [1, 0.9]})));
    let kinds: Vec<EventKind> = engine.ledger().iter().map(|e| e.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![EventKind::PlaceEntered("1".to_string()), EventKind::GateEntered]
    );
    assert_eq!(out["parking"]["occupied"], 2);
    assert_eq!(out["parking"]["in_movement"], 0);

    handle(&mut engine, batch(json!({"1": [0, 0.05], "2": [1, 0.9]})));
    assert_eq!(
        engine.ledger().iter().next().map(|e| e.kind.clone()),
        Some(EventKind::PlaceExited("1".to_string()))
    );
}

#[test]
fn reserved_slots_never_produce_place_events() {
    let mut reservations = Reservations::new();
    reservations.insert("1".to_string(), ReservationKind::Static);
    let mut engine = engine(reservations);

    handle(&mut engine, batch(json!({"1": [0, 0.1], "2": [0, 0.1]})));
    let out = handle(&mut engine, batch(json!({"1": [1, 0.9], "2": [0, 0.1]})));
    assert!(engine.ledger().is_empty());
    assert_eq!(out["parking_places"][0], json!({"id": "1", "status": [1, 1.0, 3]}));
    assert_eq!(out["parking_places"][1], json!({"id": "2", "status": [0, 0.0]}));
}

#[test]
fn free_to_display_subtracts_reserved_free_slots() {
    let mut reservations = Reservations::new();
    reservations.insert("1".to_string(), ReservationKind::Dynamic);
    let mut engine = engine(reservations);

    let out = handle(&mut engine, batch(json!({"1": [0, 0.1], "2": [0, 0.1], "3": [1, 0.8]})));
    assert_eq!(out["parking"]["free"], 2);
    assert_eq!(out["parking"]["occupied"], 1);
    assert_eq!(out["parking"]["free_to_display"], 1);
}

#[test]
fn in_movement_is_never_negative() {
    let mut engine = engine(Reservations::new());
    handle(&mut engine, batch(json!({"1": [0, 0.1], "2": [0, 0.1]})));
    let out = handle(&mut engine, batch(json!({"1": [1, 0.9], "2": [1, 0.9]})));
    assert_eq!(engine.ledger().len(), 2);
    assert_eq!(out["parking"]["in_movement"], 0);
}

#[test]
fn expired_gate_entries_stop_counting() {
    let mut engine = engine(Reservations::new());
    handle(&mut engine, batch(json!({"1": [0, 0.1]})));
    let out = handle(&mut engine, gate(0));
    assert_eq!(out["parking"]["in_movement"], 1);

    let later = Instant::now() + TTL;
    let out = engine
        .handle_at(&batch(json!({"1": [0, 0.1]})), later)
        .unwrap()
        .unwrap();
    assert_eq!(out["parking"]["in_movement"], 0);
    assert!(engine.ledger().is_empty());
}

#[test]
fn unknown_topic_is_fatal() {
    let mut engine = engine(Reservations::new());
    let err = engine
        .handle(&InboundMessage::new("/plugins/audio", "{}"))
        .unwrap_err();
    assert!(!is_recoverable(&err));
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::UnknownSource(topic)) if topic == "/plugins/audio"
    ));
}

#[test]
fn malformed_payloads_are_recoverable_and_leave_state_untouched() {
    let mut engine = engine(Reservations::new());
    handle(&mut engine, batch(json!({"1": [0, 0.1]})));

    for message in [
        InboundMessage::new(VIDEO, "[1, 2, 3]"),
        InboundMessage::new(VIDEO, r#"{"parking_places": {"1": [0, 1.5]}}"#),
        InboundMessage::new(VIDEO, r#"{"parking": {}}"#),
        InboundMessage::new(GATE, r#"{"entered": "yes"}"#),
        InboundMessage::new(GATE, r#"{"entered": 3}"#),
    ] {
        let err = engine.handle(&message).unwrap_err();
        assert!(is_recoverable(&err), "{} should be recoverable", err);
    }
    assert!(engine.ledger().is_empty());
    assert_eq!(engine.store().map(|s| s.len()), Some(1));
}

#[test]
fn refreshed_reservations_apply_to_the_next_batch() {
    let mut engine = engine(Reservations::new());
    handle(&mut engine, batch(json!({"1": [0, 0.1]})));

    let mut reservations = Reservations::new();
    reservations.insert("1".to_string(), ReservationKind::Disabled);
    engine.replace_reservations(Arc::new(reservations));

    let out = handle(&mut engine, batch(json!({"1": [0, 0.1]})));
    assert_eq!(out["parking_places"][0]["status"], json!([0, 0.0, 4]));
    assert_eq!(out["parking"]["free_to_display"], 0);
}
