mod common;

use common::{admin, test_config, Harness, ENTITY_TYPE};
use flowrule_automation::{
    Action, AutomationDraft, ExecutionQuery, ExecutionStatus, FailureReason, TriggerSpec,
};
use flowrule_core::memory::InMemoryCommentService;
use flowrule_core::{EventKind, EventPublisher, Scope};
use flowrule_workflow::TransitionRequest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

async fn wait_for_comments(h: &Harness, expected: usize) {
    for _ in 0..200 {
        if h.comments.count().await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} comments, saw {}", expected, h.comments.count().await);
}

#[tokio::test]
async fn cascades_through_the_event_bus() {
    let (h, bus) = Harness::with_bus(test_config()).await;
    let triage = h
        .enabled(
            AutomationDraft::new(Scope::Project(h.project), "Triage")
                .with_trigger(TriggerSpec::new(EventKind::EntityCreated, ENTITY_TYPE))
                .with_action(Action::set_property("triaged", json!(true))),
        )
        .await;
    let announce = h
        .enabled(
            AutomationDraft::new(Scope::Project(h.project), "Announce")
                .with_trigger(
                    TriggerSpec::new(EventKind::PropertyChanged, ENTITY_TYPE)
                        .on_change("triaged", Some(json!(true))),
                )
                .with_action(Action::comment("{{name}} was triaged")),
        )
        .await;

    let processor = h.engine.start_processor();
    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(processor.run(bus, async {
        let _ = stopped.await;
    }));

    let entity = h.entity(&[("name", json!("Login bug"))]).await;
    h.publisher.publish(h.created_event(&entity)).await.unwrap();

    wait_for_comments(&h, 1).await;
    let _ = stop.send(());
    running.await.unwrap();

    let comments = h.comments.comments_for(entity.entity_id).await;
    assert_eq!(comments[0].body, "Login bug was triaged");

    for automation_id in [triage.id, announce.id] {
        let records = h
            .engine
            .ledger()
            .query(&ExecutionQuery::for_automation(automation_id))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Succeeded);
    }
    let announced = h
        .engine
        .ledger()
        .query(&ExecutionQuery::for_automation(announce.id))
        .await
        .unwrap();
    assert_eq!(announced[0].cascade_depth, 1);
}

#[tokio::test]
async fn transitions_make_progress_on_a_saturated_bus() {
    let config = test_config()
        .with_dispatch_lanes(1)
        .with_event_buffer_size(1);
    let (h, bus) = Harness::with_bus_capacity(config, 1).await;
    let h = Arc::new(h);
    h.engine
        .graphs()
        .add_transition(h.project, h.done, h.todo, vec![admin()], &admin())
        .await
        .unwrap();
    h.enabled(
        AutomationDraft::new(Scope::Project(h.project), "Note moves")
            .with_trigger(TriggerSpec::new(EventKind::StateChanged, ENTITY_TYPE))
            .with_action(Action::comment("moved")),
    )
    .await;

    let processor = h.engine.start_processor();
    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(processor.run(bus, async {
        let _ = stopped.await;
    }));

    let entity_id = h.entity(&[]).await.entity_id;
    let handles: Vec<_> = (0..40)
        .map(|i| {
            let h = Arc::clone(&h);
            let to_state = if i % 2 == 0 { h.done } else { h.todo };
            tokio::spawn(async move {
                h.engine
                    .transition(TransitionRequest {
                        entity_id,
                        to_state,
                        actor: admin(),
                    })
                    .await
            })
        })
        .collect();

    let all_done = tokio::time::timeout(Duration::from_secs(10), async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await;
    assert!(all_done.is_ok(), "transitions stalled behind the event bus");

    let moves = h
        .publisher
        .published()
        .await
        .iter()
        .filter(|event| event.kind == EventKind::StateChanged)
        .count();
    assert!(moves > 0);
    wait_for_comments(&h, moves).await;

    let _ = stop.send(());
    running.await.unwrap();
    assert_eq!(h.comments.comments_for(entity_id).await.len(), moves);
}

#[tokio::test]
async fn stale_deliveries_are_dropped() {
    let h = Harness::new().await;
    let automation = h
        .enabled(
            AutomationDraft::new(Scope::Project(h.project), "Track")
                .with_trigger(TriggerSpec::new(EventKind::PropertyChanged, ENTITY_TYPE))
                .with_action(Action::comment("{{priority}}")),
        )
        .await;

    let entity = h.entity(&[]).await;
    let older = h.user_edit(entity.entity_id, "priority", json!("low")).await;
    let newer = h.user_edit(entity.entity_id, "priority", json!("high")).await;
    assert!(older.sequence < newer.sequence);

    let processor = h.engine.start_processor();
    processor.submit(newer.clone()).await.unwrap();
    processor.submit(older).await.unwrap();
    processor.submit(newer.clone()).await.unwrap();
    processor.shutdown().await;

    let records = h
        .engine
        .ledger()
        .query(&ExecutionQuery::for_automation(automation.id))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_id, newer.event_id);
    assert_eq!(h.comments.count().await, 1);
}

#[tokio::test]
async fn processor_drains_on_shutdown() {
    let h = Harness::new().await;
    let automation = h
        .enabled(
            AutomationDraft::new(Scope::Project(h.project), "Welcome")
                .with_trigger(TriggerSpec::new(EventKind::EntityCreated, ENTITY_TYPE))
                .with_action(Action::comment("welcome"))
                .with_action(Action::set_property("greeted", json!(true))),
        )
        .await;

    let processor = h.engine.start_processor();
    assert_eq!(processor.lanes(), 4);

    let mut entities = Vec::new();
    for _ in 0..20 {
        let entity = h.entity(&[]).await;
        processor.submit(h.created_event(&entity)).await.unwrap();
        entities.push(entity.entity_id);
    }
    processor.shutdown().await;

    assert_eq!(h.comments.count().await, 20);
    for entity_id in entities {
        assert_eq!(h.current(entity_id).await.get("greeted"), Some(&json!(true)));
    }
    let stats = h.engine.ledger().stats(automation.id).await.unwrap();
    assert_eq!(stats.executions, 20);
    assert_eq!(stats.succeeded, 20);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn concurrent_events_on_one_entity_serialize() {
    // Without per-entity serialization the second writer would hit a
    // version conflict, and no conflict retries are allowed here.
    let h = std::sync::Arc::new(
        Harness::with_config(test_config().with_conflict_retries(0)).await,
    );
    h.enabled(
        AutomationDraft::new(Scope::Project(h.project), "Tag")
            .with_trigger(TriggerSpec::new(EventKind::PropertyChanged, ENTITY_TYPE))
            .with_action(flowrule_automation::Action::ChangeProperty {
                property_name: "labels".into(),
                change_type: flowrule_automation::ChangeType::Add,
                value: flowrule_automation::ValueExpr::Template {
                    template: "seen-{{revision}}".into(),
                },
            }),
    )
    .await;

    let entity = h.entity(&[]).await;
    let mut events = Vec::new();
    for revision in 0..8 {
        events.push(h.user_edit(entity.entity_id, "revision", json!(revision)).await);
    }

    let handles: Vec<_> = events
        .into_iter()
        .map(|event| {
            let h = std::sync::Arc::clone(&h);
            tokio::spawn(async move { h.engine.on_event(&event).await.unwrap() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 8);
    for id in ids {
        let record = h.engine.ledger().get(id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded, "{:?}", record.action_outcomes);
    }
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_then_recorded() {
    let config = test_config()
        .with_action_timeout_ms(100)
        .with_max_action_attempts(3);
    let slow = InMemoryCommentService::new().with_latency(Duration::from_secs(5));
    let h = Harness::with_comments(config, slow).await;
    h.enabled(
        AutomationDraft::new(Scope::Project(h.project), "Slow")
            .with_trigger(TriggerSpec::new(EventKind::EntityCreated, ENTITY_TYPE))
            .with_action(Action::comment("too slow")),
    )
    .await;

    let entity = h.entity(&[]).await;
    let ids = h.engine.on_event(&h.created_event(&entity)).await.unwrap();
    let record = h.engine.ledger().get(ids[0]).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let outcome = &record.action_outcomes[0];
    assert_eq!(outcome.outcome.failure_reason(), Some(FailureReason::Timeout));
    assert_eq!(outcome.attempts, 3);
}

#[tokio::test]
async fn purge_respects_retention() {
    let h = Harness::new().await;
    h.enabled(
        AutomationDraft::new(Scope::Project(h.project), "Short lived")
            .with_trigger(TriggerSpec::new(EventKind::EntityCreated, ENTITY_TYPE))
            .with_action(Action::comment("hi")),
    )
    .await;
    let entity = h.entity(&[]).await;
    h.engine.on_event(&h.created_event(&entity)).await.unwrap();

    // Fresh records are inside the retention window.
    assert_eq!(h.engine.purge_expired().await.unwrap(), 0);
    assert_eq!(
        h.engine
            .ledger()
            .query(&ExecutionQuery::default())
            .await
            .unwrap()
            .len(),
        1
    );
}
