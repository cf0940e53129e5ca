mod common;

use common::{committed, flow_at_version, request, store, store_keeping};
use guidedflow::events::FlowEvent;
use guidedflow::flow::{ConflictKind, ConflictStatus, FieldPath, FlowStatus, Resolution, SaveOutcome, VersionOrigin};
use guidedflow::store::{ResolutionStrategy, ResolveOutcome};
use guidedflow::FlowError;
use serde_json::json;

#[tokio::test]
async fn create_starts_in_draft_at_version_zero() {
    let (store, sink) = store().await;
    let created = store.create("owner-1").await.unwrap();

    assert_eq!(created.version, 0);
    assert_eq!(created.flow.status, FlowStatus::Draft);
    assert_eq!(created.flow.current_step, 1);
    assert!(created.flow.step_data.is_empty());

    let versions = store.versions(&created.flow.id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].origin, VersionOrigin::Created);
    assert!(matches!(sink.events()[0], FlowEvent::FlowCreated { .. }));
}

#[tokio::test]
async fn direct_save_round_trips_and_activates_flow() {
    let (store, _) = store().await;
    let flow_id = store.create("owner").await.unwrap().flow.id;

    let outcome = store
        .save(request(&flow_id, 0, "expenses", json!({ "materials": 500, "labor": { "hours": 8 } }), "x"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SaveOutcome::Committed {
            version: 1,
            origin: VersionOrigin::Direct
        }
    );

    let snapshot = store.get(&flow_id).await.unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.flow.status, FlowStatus::Active);
    assert_eq!(snapshot.flow.current_step, 4);
    assert_eq!(snapshot.flow.step_data["expenses"], json!({ "materials": 500, "labor": { "hours": 8 } }));

    let row = store.version(&flow_id, 1).await.unwrap();
    assert_eq!(row.author_id, "x");
    let changed: Vec<&str> = row.change_summary.iter().map(|p| p.as_str()).collect();
    assert_eq!(changed, vec!["expenses.labor", "expenses.materials"]);
    assert_eq!(row.snapshot.unwrap(), snapshot.flow.step_data);
}

#[tokio::test]
async fn disjoint_stale_writes_are_rebased() {
    let (store, _) = store().await;
    let flow_id = flow_at_version(&store, 5).await;

    let x = store
        .save(request(&flow_id, 5, "duration", json!({ "startDate": "2025-03-01" }), "x"))
        .await
        .unwrap();
    assert_eq!(committed(&x), 6);

    let y = store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 750 }), "y"))
        .await
        .unwrap();
    assert_eq!(
        y,
        SaveOutcome::Committed {
            version: 7,
            origin: VersionOrigin::AutoRebased
        }
    );

    let snapshot = store.get(&flow_id).await.unwrap();
    assert_eq!(snapshot.flow.step_data["duration"]["startDate"], json!("2025-03-01"));
    assert_eq!(snapshot.flow.step_data["expenses"]["materials"], json!(750));
    assert!(store.pending_conflicts(&flow_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlapping_stale_write_becomes_pending_conflict() {
    let (store, sink) = store().await;
    let flow_id = flow_at_version(&store, 5).await;

    store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 500 }), "x"))
        .await
        .unwrap();
    let outcome = store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 750, "labor": 40 }), "y"))
        .await
        .unwrap();

    let SaveOutcome::Conflict(conflict) = outcome else {
        panic!("expected a conflict");
    };
    assert_eq!(conflict.kind, ConflictKind::FieldOverlap);
    assert_eq!(conflict.base_version, 5);
    assert_eq!(conflict.current_version_at_detection, 6);
    assert_eq!(conflict.status, ConflictStatus::Pending);
    assert_eq!(conflict.conflicting_fields.len(), 1);
    assert_eq!(conflict.conflicting_fields[0].path.as_str(), "expenses.materials");
    assert_eq!(conflict.conflicting_fields[0].theirs, json!(500));
    assert_eq!(conflict.conflicting_fields[0].mine, json!(750));

    let snapshot = store.get(&flow_id).await.unwrap();
    assert_eq!(snapshot.version, 6);
    assert_eq!(snapshot.flow.step_data["expenses"], json!({ "materials": 500 }));

    let pending = store.pending_conflicts(&flow_id).await.unwrap();
    assert_eq!(pending, vec![conflict.clone()]);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, FlowEvent::ConflictDetected { conflict_id, .. } if *conflict_id == conflict.id)));
}

#[tokio::test]
async fn resubmitting_a_conflicting_write_returns_the_same_conflict() {
    let (store, _) = store().await;
    let flow_id = flow_at_version(&store, 2).await;
    store
        .save(request(&flow_id, 2, "pricing", json!({ "markup": 0.2 }), "x"))
        .await
        .unwrap();

    let first = store
        .save(request(&flow_id, 2, "pricing", json!({ "markup": 0.3 }), "y"))
        .await
        .unwrap();
    let second = store
        .save(request(&flow_id, 2, "pricing", json!({ "markup": 0.3 }), "y"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(store.pending_conflicts(&flow_id).await.unwrap().len(), 1);
    assert_eq!(store.get(&flow_id).await.unwrap().version, 3);
}

#[tokio::test]
async fn keep_mine_commits_the_writers_values_as_one_version() {
    let (store, sink) = store().await;
    let flow_id = flow_at_version(&store, 5).await;
    store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 500 }), "x"))
        .await
        .unwrap();
    let SaveOutcome::Conflict(conflict) = store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 750, "labor": 40 }), "y"))
        .await
        .unwrap()
    else {
        panic!("expected a conflict");
    };

    let outcome = store
        .resolve_all(&conflict.id, ResolutionStrategy::KeepMine, "y")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResolveOutcome::Committed {
            version: conflict.current_version_at_detection + 1
        }
    );

    let snapshot = store.get(&flow_id).await.unwrap();
    assert_eq!(snapshot.flow.step_data["expenses"], json!({ "materials": 750, "labor": 40 }));

    let row = store.version(&flow_id, 7).await.unwrap();
    assert_eq!(row.origin, VersionOrigin::Resolved);
    assert_eq!(row.author_id, "y");

    let closed = store.conflict(&conflict.id).await.unwrap();
    assert_eq!(closed.status, ConflictStatus::Resolved);
    assert_eq!(closed.resolution, Some(Resolution::ManualKeepMine));
    assert_eq!(closed.resolved_by.as_deref(), Some("y"));
    assert!(closed.resolved_at.is_some());
    assert!(store.pending_conflicts(&flow_id).await.unwrap().is_empty());
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, FlowEvent::ConflictResolved { version: 7, .. })));

    let again = store.resolve_all(&conflict.id, ResolutionStrategy::KeepTheirs, "y").await;
    assert!(matches!(again, Err(FlowError::Validation { .. })));
}

#[tokio::test]
async fn commits_after_detection_reset_stale_choices() {
    let (store, sink) = store().await;
    let flow_id = flow_at_version(&store, 5).await;
    store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 500 }), "x"))
        .await
        .unwrap();
    let SaveOutcome::Conflict(conflict) = store
        .save(request(&flow_id, 5, "expenses", json!({ "materials": 750, "labor": 40 }), "y"))
        .await
        .unwrap()
    else {
        panic!("expected a conflict");
    };
    assert_eq!(conflict.current_version_at_detection, 6);

    store
        .save(request(&flow_id, 6, "expenses", json!({ "materials": 600 }), "z"))
        .await
        .unwrap();
    store
        .save(request(&flow_id, 7, "expenses", json!({ "labor": 55 }), "z"))
        .await
        .unwrap();

    let materials = FieldPath::parse("expenses.materials").unwrap();
    let labor = FieldPath::parse("expenses.labor").unwrap();

    let outcome = store
        .resolve_all(&conflict.id, ResolutionStrategy::KeepTheirs, "lead")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResolveOutcome::Pending {
            remaining: vec![labor.clone(), materials.clone()]
        }
    );

    let snapshot = store.get(&flow_id).await.unwrap();
    assert_eq!(snapshot.version, 8);
    assert_eq!(snapshot.flow.step_data["expenses"], json!({ "materials": 600, "labor": 55 }));

    let refreshed = store.conflict(&conflict.id).await.unwrap();
    assert_eq!(refreshed.status, ConflictStatus::Pending);
    assert_eq!(refreshed.current_version_at_detection, 8);
    let sides: Vec<_> = refreshed
        .conflicting_fields
        .iter()
        .map(|f| (f.path.clone(), f.theirs.clone(), f.mine.clone()))
        .collect();
    assert_eq!(
        sides,
        vec![(labor, json!(55), json!(40)), (materials, json!(600), json!(750))]
    );
    assert!(sink.events().iter().any(|e| matches!(
        e,
        FlowEvent::ConflictDetected {
            detected_at_version: 8,
            ..
        }
    )));

    let outcome = store
        .resolve_all(&conflict.id, ResolutionStrategy::KeepTheirs, "lead")
        .await
        .unwrap();
    assert_eq!(outcome, ResolveOutcome::Committed { version: 9 });
    let data = store.get(&flow_id).await.unwrap().flow.step_data;
    assert_eq!(data["expenses"], json!({ "materials": 600, "labor": 55 }));
}

#[tokio::test]
async fn unrelated_commits_after_detection_keep_choices() {
    let (store, _) = store().await;
    let flow_id = flow_at_version(&store, 1).await;
    store
        .save(request(&flow_id, 1, "expenses", json!({ "materials": 500 }), "x"))
        .await
        .unwrap();
    let SaveOutcome::Conflict(conflict) = store
        .save(request(&flow_id, 1, "expenses", json!({ "materials": 750 }), "y"))
        .await
        .unwrap()
    else {
        panic!("expected a conflict");
    };
    store
        .save(request(&flow_id, 2, "duration", json!({ "startDate": "2025-03-01" }), "z"))
        .await
        .unwrap();

    let outcome = store
        .resolve_all(&conflict.id, ResolutionStrategy::KeepMine, "y")
        .await
        .unwrap();
    assert_eq!(outcome, ResolveOutcome::Committed { version: 4 });

    let data = store.get(&flow_id).await.unwrap().flow.step_data;
    assert_eq!(data["expenses"]["materials"], json!(750));
    assert_eq!(data["duration"]["startDate"], json!("2025-03-01"));
}

#[tokio::test]
async fn per_field_resolution_waits_for_every_field() {
    let (store, _) = store().await;
    let flow_id = flow_at_version(&store, 1).await;
    store
        .save(request(&flow_id, 1, "duration", json!({ "startDate": "2025-03-01", "endDate": "2025-03-20" }), "x"))
        .await
        .unwrap();
    let SaveOutcome::Conflict(conflict) = store
        .save(request(&flow_id, 1, "duration", json!({ "startDate": "2025-04-01", "endDate": "2025-04-30" }), "y"))
        .await
        .unwrap()
    else {
        panic!("expected a conflict");
    };
    assert_eq!(conflict.conflicting_fields.len(), 2);

    let start = FieldPath::parse("duration.startDate").unwrap();
    let end = FieldPath::parse("duration.endDate").unwrap();

    let partial = store
        .resolve_field(&conflict.id, &start, json!("2025-04-01"), "lead")
        .await
        .unwrap();
    assert_eq!(partial, ResolveOutcome::Pending { remaining: vec![end.clone()] });
    assert_eq!(store.get(&flow_id).await.unwrap().version, 2);

    let unknown = store
        .resolve_field(&conflict.id, &FieldPath::parse("duration.crewSize").unwrap(), json!(3), "lead")
        .await;
    assert!(matches!(unknown, Err(FlowError::Validation { .. })));

    let done = store
        .resolve_field(&conflict.id, &end, json!("2025-03-20"), "lead")
        .await
        .unwrap();
    assert_eq!(done, ResolveOutcome::Committed { version: 3 });

    let data = store.get(&flow_id).await.unwrap().flow.step_data;
    assert_eq!(data["duration"], json!({ "startDate": "2025-04-01", "endDate": "2025-03-20" }));
    let closed = store.conflict(&conflict.id).await.unwrap();
    assert_eq!(closed.resolution, Some(Resolution::ManualPerField));
}

#[tokio::test]
async fn base_below_retention_floor_is_a_retention_gap_conflict() {
    let (store, _) = store_keeping(3).await;
    let flow_id = flow_at_version(&store, 6).await;

    assert_eq!(store.prune(&flow_id).await.unwrap(), 4);
    assert_eq!(store.retention_floor(&flow_id).await.unwrap(), 4);

    let outcome = store
        .save(request(&flow_id, 2, "scope", json!({ "description": "Deck" }), "late"))
        .await
        .unwrap();
    let SaveOutcome::Conflict(conflict) = outcome else {
        panic!("expected a retention gap conflict");
    };
    assert_eq!(conflict.kind, ConflictKind::RetentionGap);
    assert_eq!(conflict.contested_paths(), vec![FieldPath::parse("scope.description").unwrap()]);

    assert!(matches!(
        store.version(&flow_id, 1).await,
        Err(FlowError::VersionNotFound { version: 1, .. })
    ));
    assert!(matches!(
        store.changed_fields_since(&flow_id, 2, 6).await,
        Err(FlowError::VersionNotFound { .. })
    ));
    assert_eq!(store.changed_fields_since(&flow_id, 4, 6).await.unwrap().len(), 1);
}

#[tokio::test]
async fn prune_keeps_rows_pinned_by_pending_conflicts() {
    let (store, _) = store_keeping(2).await;
    let flow_id = flow_at_version(&store, 3).await;
    store
        .save(request(&flow_id, 3, "client", json!({ "email": "a@example.com" }), "x"))
        .await
        .unwrap();
    let outcome = store
        .save(request(&flow_id, 3, "client", json!({ "email": "b@example.com" }), "y"))
        .await
        .unwrap();
    assert!(matches!(outcome, SaveOutcome::Conflict(_)));

    for v in 4..8 {
        store
            .save(request(&flow_id, v, "scope", json!({ "description": format!("rev {}", v) }), "x"))
            .await
            .unwrap();
    }

    store.prune(&flow_id).await.unwrap();
    assert_eq!(store.retention_floor(&flow_id).await.unwrap(), 3);
    assert!(store.version(&flow_id, 3).await.is_ok());
    assert!(store.version(&flow_id, 2).await.is_err());
}

#[tokio::test]
async fn invalid_writes_are_rejected_before_storage() {
    let (store, _) = store().await;
    let flow_id = flow_at_version(&store, 1).await;

    let unknown_step = store.save(request(&flow_id, 1, "nope", json!({ "a": 1 }), "x")).await;
    assert!(matches!(unknown_step, Err(FlowError::Validation { .. })));

    let empty = store.save(request(&flow_id, 1, "client", json!({}), "x")).await;
    assert!(matches!(empty, Err(FlowError::Validation { .. })));

    let dotted = store.save(request(&flow_id, 1, "client", json!({ "a.b": 1 }), "x")).await;
    assert!(matches!(dotted, Err(FlowError::Validation { .. })));

    let ahead = store.save(request(&flow_id, 9, "client", json!({ "name": "n" }), "x")).await;
    assert!(matches!(ahead, Err(FlowError::Validation { .. })));

    let missing = store.save(request("missing", 0, "client", json!({ "name": "n" }), "x")).await;
    assert!(matches!(missing, Err(FlowError::NotFound { .. })));
    assert!(matches!(store.get("missing").await, Err(FlowError::NotFound { .. })));
}

#[tokio::test]
async fn submit_requires_final_step_latest_version_and_no_conflicts() {
    let (store, sink) = store().await;
    let flow_id = store.create("owner").await.unwrap().flow.id;

    assert!(matches!(
        store.submit(&flow_id, 0, "owner").await,
        Err(FlowError::InvalidTransition { .. })
    ));

    store
        .save(request(&flow_id, 0, "pricing", json!({ "total": 1200 }), "owner"))
        .await
        .unwrap();
    assert!(matches!(
        store.submit(&flow_id, 1, "owner").await,
        Err(FlowError::Validation { .. })
    ));

    store
        .save(request(&flow_id, 1, "review", json!({ "approved": true }), "owner"))
        .await
        .unwrap();
    assert!(matches!(
        store.submit(&flow_id, 1, "owner").await,
        Err(FlowError::StaleVersion { expected: 1, actual: 2, .. })
    ));

    let submitted = store.submit(&flow_id, 2, "owner").await.unwrap();
    assert_eq!(submitted.flow.status, FlowStatus::Completed);
    assert_eq!(submitted.version, 2);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        FlowEvent::StatusChanged {
            to: FlowStatus::Completed,
            ..
        }
    )));

    let late = store
        .save(request(&flow_id, 2, "review", json!({ "notes": "one more" }), "owner"))
        .await;
    assert!(matches!(late, Err(FlowError::InvalidTransition { .. })));
}

#[tokio::test]
async fn abandoned_flows_are_read_only() {
    let (store, _) = store().await;
    let flow_id = flow_at_version(&store, 1).await;

    let abandoned = store.abandon(&flow_id).await.unwrap();
    assert_eq!(abandoned.flow.status, FlowStatus::Abandoned);
    assert!(matches!(store.abandon(&flow_id).await, Err(FlowError::InvalidTransition { .. })));
    assert!(matches!(
        store.save(request(&flow_id, 1, "client", json!({ "name": "n" }), "x")).await,
        Err(FlowError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn unknown_conflict_is_not_found() {
    let (store, _) = store().await;
    assert!(matches!(
        store.resolve_all("nope", ResolutionStrategy::KeepMine, "x").await,
        Err(FlowError::ConflictNotFound { .. })
    ));
    assert!(matches!(store.conflict("nope").await, Err(FlowError::ConflictNotFound { .. })));
}
