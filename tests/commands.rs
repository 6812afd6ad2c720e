mod common;

use common::TestContext;
use pagescripts::commands::execute_json;
use serde_json::{Value, json};

async fn send(context: &TestContext, raw: &str) -> Value {
    execute_json(&context.manager, raw).await
}

#[tokio::test]
async fn test_add_then_list_over_json() {
    let context = TestContext::new().await;

    let added = send(
        &context,
        r#"{"command":"add_local_script","args":{"name":"Hello","code":"window.hello = 1;"}}"#,
    )
    .await;
    assert_eq!(added["result"], "script");
    assert_eq!(added["value"]["name"], "Hello");
    assert_eq!(added["value"]["enabled"], true);
    assert!(added["value"].get("origin").is_none());
    let id = added["value"]["id"].as_str().unwrap().to_string();

    let listed = send(&context, r#"{"command":"get_scripts"}"#).await;
    assert_eq!(listed["result"], "scripts");
    assert_eq!(listed["value"].as_array().unwrap().len(), 1);
    assert_eq!(listed["value"][0]["id"], json!(id));

    let raw = json!({"command": "toggle_script", "args": {"id": id, "enabled": false}});
    let toggled = send(&context, &raw.to_string()).await;
    assert_eq!(toggled, json!({"result": "ok"}));
    assert!(!context.manager.get_scripts().unwrap()[0].enabled);
}

#[tokio::test]
async fn test_errors_carry_codes() {
    let context = TestContext::new().await;

    let response = send(
        &context,
        r#"{"command":"toggle_script","args":{"id":"nope","enabled":true}}"#,
    )
    .await;
    assert_eq!(response["error"]["code"], "NOT_FOUND");
    assert_eq!(response["error"]["command"], "toggle_script");
    assert_eq!(response["error"]["context"]["id"], "nope");

    let response = send(
        &context,
        r#"{"command":"delete_script","args":{"id":"x","force":true}}"#,
    )
    .await;
    assert_eq!(response["error"]["code"], "VALIDATION_ERROR");

    let response = send(&context, r#"{"command":"launch_rockets"}"#).await;
    assert_eq!(response["error"]["code"], "UNKNOWN_COMMAND");

    let response = send(
        &context,
        r#"{"command":"add_local_script","args":{"code":"  "}}"#,
    )
    .await;
    assert_eq!(response["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_data_dir_and_syntax_check() {
    let context = TestContext::new().await;

    let response = send(&context, r#"{"command":"get_data_dir"}"#).await;
    assert_eq!(response["result"], "data_dir");
    assert_eq!(
        response["value"].as_str().unwrap(),
        context.dir.path().to_str().unwrap()
    );

    let broken = context
        .manager
        .add_local_script(Some("Broken".into()), "if (".into())
        .await
        .unwrap();
    let raw = json!({"command": "check_script", "args": {"id": broken.id}});
    let response = send(&context, &raw.to_string()).await;
    assert_eq!(response["result"], "syntax_check");
    assert_eq!(response["value"]["valid"], false);
    assert!(
        response["value"]["message"]
            .as_str()
            .unwrap()
            .contains("SyntaxError")
    );
}

#[tokio::test]
async fn test_reload_over_json_reports_injection() {
    let context = TestContext::new().await;
    context
        .manager
        .add_local_script(Some("A".into()), "window.a = 1;".into())
        .await
        .unwrap();

    let response = send(&context, r#"{"command":"reload_scripts"}"#).await;
    assert_eq!(response["result"], "injection");
    assert_eq!(response["value"]["injected"].as_array().unwrap().len(), 1);
    assert!(response["value"].get("failed").is_none());
}
