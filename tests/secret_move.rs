//! Moving secrets between folders and environments

mod common;

use common::fixtures::{Fixture, RecordingGate, RecordingSideEffects};
use keyplane::domain::{Secret, SecretId, UserId};
use keyplane::errors::KeyplaneError;
use keyplane::services::{
    Actor, ApprovalCommit, Collaborators, FolderContext, MoveSecretsRequest, SecretInput,
};
use keyplane::storage::SecretQuery;
use std::sync::Arc;

fn request(fx: &Fixture, ids: Vec<SecretId>, should_overwrite: bool, actor: Actor) -> MoveSecretsRequest {
    MoveSecretsRequest {
        project_id: fx.project_id.clone(),
        source_environment: "dev".into(),
        source_secret_path: "/app".into(),
        destination_environment: "prod".into(),
        destination_secret_path: "/app".into(),
        secret_ids: ids,
        should_overwrite,
        actor,
    }
}

fn service_actor() -> Actor {
    Actor::Service("deployer".into())
}

async fn contents(fx: &Fixture, ctx: &FolderContext) -> Vec<(String, String)> {
    let store = fx.service.store();
    let mut secrets: Vec<Secret> = store.find_by_folder_id(&ctx.folder_id, &SecretQuery::all()).await.unwrap();
    secrets.sort_by(|a, b| a.key.cmp(&b.key));
    secrets
        .iter()
        .map(|secret| (secret.key.clone(), store.decrypt_value(secret).unwrap()))
        .collect()
}

#[tokio::test]
async fn test_move_creates_destination_and_clears_source() {
    let fx = Fixture::new("move_basic").await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;

    let moved = fx
        .service
        .store()
        .bulk_insert(&source, vec![SecretInput::shared("A", "1"), SecretInput::shared("B", "2")])
        .await
        .unwrap();
    let ids = moved.iter().map(|secret| secret.id.clone()).collect();

    let outcome = fx.orchestrator().move_secrets(request(&fx, ids, false, service_actor())).await.unwrap();
    assert!(outcome.is_source_updated);
    assert!(outcome.is_destination_updated);
    assert!(outcome.approval_requests.is_empty());

    assert!(contents(&fx, &source).await.is_empty());
    assert_eq!(
        contents(&fx, &destination).await,
        vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
    );
}

#[tokio::test]
async fn test_collision_without_overwrite_changes_nothing() {
    let fx = Fixture::new("move_collision").await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;
    let store = fx.service.store();

    let moved = store
        .bulk_insert(&source, vec![SecretInput::shared("A", "new"), SecretInput::shared("C", "3")])
        .await
        .unwrap();
    store.bulk_insert(&destination, vec![SecretInput::shared("A", "old")]).await.unwrap();
    let ids = moved.iter().map(|secret| secret.id.clone()).collect();

    let err = fx.orchestrator().move_secrets(request(&fx, ids, false, service_actor())).await.unwrap_err();
    match err {
        KeyplaneError::BadRequest { message, field } => {
            assert!(message.contains("already exist in the destination"));
            assert!(message.contains('A'));
            assert_eq!(field.as_deref(), Some("should_overwrite"));
        }
        other => panic!("expected BadRequest, got {:?}", other),
    }

    assert_eq!(contents(&fx, &source).await.len(), 2);
    assert_eq!(contents(&fx, &destination).await, vec![("A".to_string(), "old".to_string())]);
}

#[tokio::test]
async fn test_overwrite_replaces_destination_values() {
    let fx = Fixture::new("move_overwrite").await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;
    let store = fx.service.store();

    let moved = store.bulk_insert(&source, vec![SecretInput::shared("A", "new")]).await.unwrap();
    let existing = store.bulk_insert(&destination, vec![SecretInput::shared("A", "old")]).await.unwrap();

    fx.orchestrator()
        .move_secrets(request(&fx, vec![moved[0].id.clone()], true, service_actor()))
        .await
        .unwrap();

    let after = store.find_by_folder_id(&destination.folder_id, &SecretQuery::all()).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, existing[0].id, "overwrite updates the existing row");
    assert_eq!(after[0].version, 2);
    assert_eq!(store.decrypt_value(&after[0]).unwrap(), "new");
    assert!(contents(&fx, &source).await.is_empty());
}

#[tokio::test]
async fn test_identical_destination_value_is_skipped() {
    let fx = Fixture::new("move_identical").await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;
    let store = fx.service.store();

    let moved = store.bulk_insert(&source, vec![SecretInput::shared("SAME", "v")]).await.unwrap();
    store.bulk_insert(&destination, vec![SecretInput::shared("SAME", "v")]).await.unwrap();

    let outcome = fx
        .orchestrator()
        .move_secrets(request(&fx, vec![moved[0].id.clone()], false, service_actor()))
        .await
        .unwrap();
    assert!(!outcome.is_destination_updated);
    assert!(outcome.is_source_updated);

    let after = store.find_by_folder_id(&destination.folder_id, &SecretQuery::all()).await.unwrap();
    assert_eq!(after[0].version, 1);
    assert!(contents(&fx, &source).await.is_empty());
}

#[tokio::test]
async fn test_unknown_or_foreign_secret_is_not_found() {
    let fx = Fixture::new("move_not_found").await;
    let source = fx.folder("dev", "/app").await;
    fx.folder("prod", "/app").await;
    let elsewhere = fx.folder("dev", "/other").await;

    let foreign = fx.service.store().bulk_insert(&elsewhere, vec![SecretInput::shared("X", "x")]).await.unwrap();

    let err = fx
        .orchestrator()
        .move_secrets(request(&fx, vec![foreign[0].id.clone()], false, service_actor()))
        .await
        .unwrap_err();
    assert!(matches!(err, KeyplaneError::NotFound { .. }));

    let err = fx
        .orchestrator()
        .move_secrets(request(&fx, vec![SecretId::new()], false, service_actor()))
        .await
        .unwrap_err();
    assert!(matches!(err, KeyplaneError::NotFound { .. }));
    assert!(contents(&fx, &source).await.is_empty());
}

#[tokio::test]
async fn test_same_folder_is_rejected() {
    let fx = Fixture::new("move_same_folder").await;
    let source = fx.folder("dev", "/app").await;
    let moved = fx.service.store().bulk_insert(&source, vec![SecretInput::shared("A", "1")]).await.unwrap();

    let mut same = request(&fx, vec![moved[0].id.clone()], false, service_actor());
    same.destination_environment = "dev".into();

    let err = fx.orchestrator().move_secrets(same).await.unwrap_err();
    assert!(matches!(err, KeyplaneError::BadRequest { .. }));
}

#[tokio::test]
async fn test_gated_destination_files_request_and_source_is_deleted() {
    let gate = Arc::new(RecordingGate {
        gated: vec![("prod".to_string(), "/app".to_string())],
        ..Default::default()
    });
    let collaborators = Collaborators { approval_gate: gate.clone(), ..Default::default() };
    let fx = Fixture::with_collaborators("move_gated", collaborators).await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;
    let user = UserId::from_str_unchecked("alice");

    let moved = fx
        .service
        .store()
        .bulk_insert(&source, vec![SecretInput::shared("A", "1"), SecretInput::shared("B", "2")])
        .await
        .unwrap();
    let ids = moved.iter().map(|secret| secret.id.clone()).collect();

    let outcome = fx.orchestrator().move_secrets(request(&fx, ids, false, Actor::User(user))).await.unwrap();
    assert!(!outcome.is_destination_updated);
    assert!(outcome.is_source_updated);
    assert_eq!(outcome.approval_requests.len(), 1);
    assert_eq!(outcome.approval_requests[0].commit_count, 2);

    let requests = gate.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].folder_id, destination.folder_id);
    assert!(requests[0].commits.iter().all(|commit| matches!(commit, ApprovalCommit::Create { .. })));

    assert!(contents(&fx, &source).await.is_empty());
    assert!(contents(&fx, &destination).await.is_empty());
}

#[tokio::test]
async fn test_service_actor_bypasses_policies() {
    let gate = Arc::new(RecordingGate::default());
    let collaborators = Collaborators { approval_gate: gate.clone(), ..Default::default() };
    let fx = Fixture::with_collaborators("move_service_actor", collaborators).await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;

    let moved = fx.service.store().bulk_insert(&source, vec![SecretInput::shared("A", "1")]).await.unwrap();

    let outcome = fx
        .orchestrator()
        .move_secrets(request(&fx, vec![moved[0].id.clone()], false, service_actor()))
        .await
        .unwrap();
    assert!(outcome.approval_requests.is_empty());
    assert!(gate.requests.lock().unwrap().is_empty());
    assert_eq!(contents(&fx, &destination).await, vec![("A".to_string(), "1".to_string())]);
}

fn pair(environment: &str, path: &str) -> Vec<(String, String)> {
    vec![(environment.to_string(), path.to_string())]
}

#[tokio::test]
async fn test_failing_source_policy_lookup_writes_nothing() {
    let gate = Arc::new(RecordingGate {
        gated: pair("none", "/"),
        failing_lookups: pair("dev", "/app"),
        ..Default::default()
    });
    let effects = Arc::new(RecordingSideEffects::default());
    let collaborators =
        Collaborators { approval_gate: gate.clone(), side_effects: effects.clone(), ..Default::default() };
    let fx = Fixture::with_collaborators("move_source_lookup_fails", collaborators).await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;

    let moved = fx.service.store().bulk_insert(&source, vec![SecretInput::shared("X", "x")]).await.unwrap();

    let err = fx
        .orchestrator()
        .move_secrets(request(&fx, vec![moved[0].id.clone()], false, Actor::User(UserId::from_str_unchecked("u1"))))
        .await
        .unwrap_err();
    assert!(matches!(err, KeyplaneError::Internal { .. }));

    assert!(contents(&fx, &destination).await.is_empty());
    assert_eq!(contents(&fx, &source).await.len(), 1);
    assert!(effects.snapshots.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_source_failure_after_destination_write_is_reported() {
    let gate = Arc::new(RecordingGate {
        gated: pair("dev", "/app"),
        failing_requests: pair("dev", "/app"),
        ..Default::default()
    });
    let effects = Arc::new(RecordingSideEffects::default());
    let collaborators =
        Collaborators { approval_gate: gate.clone(), side_effects: effects.clone(), ..Default::default() };
    let fx = Fixture::with_collaborators("move_source_request_fails", collaborators).await;
    let source = fx.folder("dev", "/app").await;
    let destination = fx.folder("prod", "/app").await;

    let moved = fx.service.store().bulk_insert(&source, vec![SecretInput::shared("X", "x")]).await.unwrap();

    let outcome = fx
        .orchestrator()
        .move_secrets(request(&fx, vec![moved[0].id.clone()], false, Actor::User(UserId::from_str_unchecked("u1"))))
        .await
        .unwrap();
    assert!(outcome.is_destination_updated);
    assert!(!outcome.is_source_updated);
    assert!(outcome.approval_requests.is_empty());
    assert!(outcome.source_error.as_deref().is_some_and(|message| message.contains("approval store unavailable")));

    assert_eq!(contents(&fx, &destination).await, vec![("X".to_string(), "x".to_string())]);
    assert_eq!(contents(&fx, &source).await.len(), 1);
    assert_eq!(*effects.snapshots.lock().unwrap(), vec![destination.folder_id.clone()]);
}
