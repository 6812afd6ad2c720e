mod common;

use common::TestContext;
use mock_server::{MockServer, Route};
use pagescripts::AppError;
use pagescripts::diagnostics::Diagnostic;
use std::time::Duration;

#[tokio::test]
async fn test_refresh_replaces_code_and_keeps_identity() {
    let server = MockServer::start().await.unwrap();
    server.set_script("/a.user.js", "// @name A\n// @version 1\n1;");
    let context = TestContext::new().await;
    let added = context
        .manager
        .add_script_from_url(&server.url("/a.user.js"))
        .await
        .unwrap();
    let id = &added.id;
    context.manager.toggle_script(id, false).await.unwrap();
    context.manager.reorder_script(id, 7).await.unwrap();

    server.set_script("/a.user.js", "// @name A\n// @version 2\n2;");
    let refreshed = context.manager.refresh_script(id).await.unwrap();

    assert_eq!(refreshed.id, added.id);
    assert!(!refreshed.enabled);
    assert_eq!(refreshed.order, 7);
    assert_eq!(refreshed.code, "// @name A\n// @version 2\n2;");
    let first_updated = added.origin.as_ref().unwrap().last_updated;
    let origin = refreshed.origin.as_ref().unwrap();
    assert_eq!(origin.version.as_deref(), Some("2"));
    assert!(origin.last_updated >= first_updated);

    let reopened = context.reopen().await;
    assert_eq!(reopened.get_scripts().unwrap(), vec![refreshed]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_code_and_records_error() {
    let server = MockServer::start().await.unwrap();
    server.set_script("/a.user.js", "// @name A\n// @version 1\n1;");
    let context = TestContext::new().await;
    let mut diagnostics = context.manager.subscribe_diagnostics();
    let added = context
        .manager
        .add_script_from_url(&server.url("/a.user.js"))
        .await
        .unwrap();
    let before = added.origin.clone().unwrap();

    server.set_status("/a.user.js", 503);
    let failed = context.manager.refresh_script(&added.id).await.unwrap();

    assert_eq!(failed.code, added.code);
    let origin = failed.origin.as_ref().unwrap();
    assert_eq!(origin.version, before.version);
    assert_eq!(origin.last_updated, before.last_updated);
    assert!(origin.last_fetch_error.as_deref().unwrap().contains("503"));
    assert!(origin.last_checked >= before.last_checked);

    let event = diagnostics.try_recv().unwrap();
    assert!(matches!(
        event.diagnostic,
        Diagnostic::RefreshFailed { ref id, .. } if *id == added.id
    ));

    // The error is cleared by the next successful fetch.
    server.set_script("/a.user.js", "// @name A\n// @version 1\n1;");
    let recovered = context.manager.refresh_script(&added.id).await.unwrap();
    assert!(recovered.origin.unwrap().last_fetch_error.is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn test_refresh_local_script_is_not_remote() {
    let context = TestContext::new().await;
    let local = context
        .manager
        .add_local_script(Some("Local".into()), "1;".into())
        .await
        .unwrap();

    let err = context.manager.refresh_script(&local.id).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::NotRemote { ref id } if *id == local.id
    ));
}

#[tokio::test]
async fn test_refresh_header_name_change_renames_script() {
    let server = MockServer::start().await.unwrap();
    server.set_script("/a.user.js", "// @name Before\n1;");
    let context = TestContext::new().await;
    let added = context
        .manager
        .add_script_from_url(&server.url("/a.user.js"))
        .await
        .unwrap();

    server.set_script("/a.user.js", "// @name After\n1;");
    let refreshed = context.manager.refresh_script(&added.id).await.unwrap();
    assert_eq!(refreshed.name, "After");
    assert_eq!(refreshed.url(), added.url());
    server.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_refreshes_apply_in_issue_order() {
    let server = MockServer::start().await.unwrap();
    server.set_script("/a.user.js", "// @name A\n// @version 0\n0;");
    let context = TestContext::new().await;
    let added = context
        .manager
        .add_script_from_url(&server.url("/a.user.js"))
        .await
        .unwrap();

    server.set_route(
        "/a.user.js",
        Route {
            delay_ms: 400,
            ..Route::script("// @name A\n// @version 1\n1;")
        },
    );

    let (first, second) = tokio::join!(context.manager.refresh_script(&added.id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.set_script("/a.user.js", "// @name A\n// @version 2\n2;");
        context.manager.refresh_script(&added.id).await
    });
    first.unwrap();
    second.unwrap();

    let stored = context.manager.store().get(&added.id).unwrap();
    let origin = stored.origin.as_ref().unwrap();
    assert_eq!(origin.version.as_deref(), Some("2"));
    assert_eq!(stored.code, "// @name A\n// @version 2\n2;");
    server.shutdown().await;
}
