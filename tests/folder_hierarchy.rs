//! Folder tree resolution and environment bookkeeping

mod common;

use common::fixtures::Fixture;
use keyplane::errors::KeyplaneError;
use keyplane::services::SecretInput;
use keyplane::storage::SecretQuery;

#[tokio::test]
async fn test_ensure_path_is_idempotent_and_resolvable() {
    let fx = Fixture::new("folders_ensure").await;
    let resolver = fx.service.resolver();

    let created = resolver.ensure_path(&fx.dev.id, "/services/api/").await.unwrap();
    assert_eq!(created.name, "api");
    let again = resolver.ensure_path(&fx.dev.id, "services//api").await.unwrap();
    assert_eq!(again.id, created.id);

    assert_eq!(resolver.resolve_path(&fx.dev.id, "/services/api").await.unwrap(), created.id);

    let root = resolver.resolve_path(&fx.dev.id, "/").await.unwrap();
    assert_ne!(root, created.id);
    assert_eq!(resolver.resolve_path(&fx.dev.id, "").await.unwrap(), root);
}

#[tokio::test]
async fn test_missing_path_is_not_found() {
    let fx = Fixture::new("folders_missing").await;
    fx.service.resolver().ensure_path(&fx.dev.id, "/app").await.unwrap();

    let err = fx.service.resolver().resolve_path(&fx.dev.id, "/app/missing").await.unwrap_err();
    match err {
        KeyplaneError::NotFound { resource_type, id } => {
            assert_eq!(resource_type, "Folder");
            assert_eq!(id, "/app/missing");
        }
        other => panic!("expected NotFound, got {:?}", other),
    }

    let other_env = fx.service.resolver().resolve_path(&fx.prod.id, "/app").await.unwrap_err();
    assert!(matches!(other_env, KeyplaneError::NotFound { .. }));
}

#[tokio::test]
async fn test_list_paths_under_is_segment_aware_and_ordered() {
    let fx = Fixture::new("folders_listing").await;
    let resolver = fx.service.resolver();
    for path in ["/app/web", "/app/api", "/apple", "/zeta"] {
        resolver.ensure_path(&fx.dev.id, path).await.unwrap();
    }

    let under_app: Vec<String> = resolver
        .list_paths_under(&fx.dev.id, "/app")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.path)
        .collect();
    assert_eq!(under_app, vec!["/app", "/app/api", "/app/web"]);

    let everything: Vec<String> = resolver
        .list_paths_under(&fx.dev.id, "/")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.path)
        .collect();
    assert_eq!(everything, vec!["/", "/app", "/app/api", "/app/web", "/apple", "/zeta"]);
}

#[tokio::test]
async fn test_find_by_secret_path_uses_environment_slug() {
    let fx = Fixture::new("folders_by_path").await;
    let created = fx.service.resolver().ensure_path(&fx.prod.id, "/db/replica").await.unwrap();

    let found = fx
        .service
        .resolver()
        .find_by_secret_path(&fx.project_id, "prod", "/db/replica")
        .await
        .unwrap()
        .expect("folder exists");
    assert_eq!(found.id, created.id);

    assert!(fx
        .service
        .resolver()
        .find_by_secret_path(&fx.project_id, "dev", "/db/replica")
        .await
        .unwrap()
        .is_none());

    let err = fx
        .service
        .resolver()
        .require_by_secret_path(&fx.project_id, "prod", "/db/primary")
        .await
        .unwrap_err();
    assert!(matches!(err, KeyplaneError::NotFound { .. }));
}

#[tokio::test]
async fn test_deleting_folder_cascades_but_root_is_protected() {
    let fx = Fixture::new("folders_delete").await;
    let app = fx.folder("dev", "/app").await;
    let nested = fx.folder("dev", "/app/nested").await;
    fx.service.store().bulk_insert(&nested, vec![SecretInput::shared("K", "v")]).await.unwrap();

    fx.folders.delete(&app.folder_id).await.unwrap();
    assert!(fx.folders.find_by_id(&nested.folder_id).await.unwrap().is_none());
    assert!(fx
        .service
        .store()
        .find_by_folder_id(&nested.folder_id, &SecretQuery::all())
        .await
        .unwrap()
        .is_empty());

    let root = fx.service.resolver().resolve_path(&fx.dev.id, "/").await.unwrap();
    let err = fx.folders.delete(&root).await.unwrap_err();
    assert!(matches!(err, KeyplaneError::BadRequest { .. }));
}

#[tokio::test]
async fn test_environment_slugs_and_tags_are_validated() {
    let fx = Fixture::new("folders_env_slugs").await;

    for slug in ["bad.slug", "bad/slug", " "] {
        let err = fx.environments.create_environment(&fx.project_id, "Bad", slug).await.unwrap_err();
        assert!(matches!(err, KeyplaneError::BadRequest { .. }), "slug {:?} should be rejected", slug);
    }

    let staging = fx.environments.create_environment(&fx.project_id, "Staging", "staging").await.unwrap();
    assert!(fx.service.resolver().resolve_path(&staging.id, "/").await.is_ok());

    let duplicate = fx.environments.create_environment(&fx.project_id, "Dev again", "dev").await;
    assert!(duplicate.is_err());

    fx.tags.create(&fx.project_id, "infra", None).await.unwrap();
    let err = fx.tags.create(&fx.project_id, "infra", None).await.unwrap_err();
    assert!(matches!(err, KeyplaneError::BadRequest { .. }));

    let tags = fx.tags.list_by_project(&fx.project_id).await.unwrap();
    assert_eq!(tags.len(), 1);
}
