//! End-to-end chat runs against a mock agent server.


use assert_cmd::cargo::cargo_bin_cmd;
use fixtures::{mount_extensions, mount_healthy_config, session_snapshot, sse_response};
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

fn reply_bodies(requests: &[wiremock::Request]) -> Vec<Value> {
    requests
        .iter()
        .filter(|r| r.url.path() == "/reply")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_chat_streams_reply_to_stdout() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let server = MockServer::start().await;

    mount_healthy_config(&server, json!("openai"), json!("gpt-4o")).await;
    mount_extensions(
        &server,
        json!([
            {"enabled": true, "name": "developer", "type": "builtin"},
            {"enabled": false, "name": "memory", "type": "builtin"}
        ]),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/agent/start"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_snapshot("s1", work.path().to_str().unwrap())),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reply"))
        .and(body_partial_json(json!({"session_id": "s1"})))
        .respond_with(sse_response(&fixtures::text_reply_sse(
            "m1",
            &["Hi ", "there"],
        )))
        .expect(1)
        .mount(&server)
        .await;

    cargo_bin_cmd!("relay")
        .env("RELAY_HOME", home.path())
        .env("RELAY_SERVER_URL", server.uri())
        .args(["chat", "--working-dir"])
        .arg(work.path())
        .write_stdin("hello\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hi there"))
        .stderr(predicate::str::contains("Agent is ready (session s1)"));

    let requests = server.received_requests().await.unwrap();
    let added: Vec<Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/agent/add_extension")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["config"]["name"], "developer");

    let replies = reply_bodies(&requests);
    assert_eq!(replies.len(), 1);
    let messages = replies[0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"][0]["text"], "hello");
}

#[tokio::test]
async fn test_chat_without_provider_exits_with_hint() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let server = MockServer::start().await;

    mount_healthy_config(&server, Value::Null, json!("gpt-4o")).await;
    Mock::given(method("POST"))
        .and(path("/agent/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(session_snapshot("s1", "/tmp")))
        .expect(0)
        .mount(&server)
        .await;

    cargo_bin_cmd!("relay")
        .env("RELAY_HOME", home.path())
        .env("RELAY_SERVER_URL", server.uri())
        .arg("chat")
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("GOOSE_PROVIDER"));
}

#[tokio::test]
async fn test_chat_runs_recipe_prompt_with_parameters() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let server = MockServer::start().await;

    let recipe_path = work.path().join("translator.yaml");
    std::fs::write(
        &recipe_path,
        "title: Translator\ndescription: d\nprompt: \"Write in {{ language }}\"\n\
parameters:\n  - key: language\n    input_type: string\n    requirement: required\n    description: Language\n",
    )
    .unwrap();

    mount_healthy_config(&server, json!("openai"), json!("gpt-4o")).await;
    mount_extensions(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/recipes/scan"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"has_security_warnings": false, "warnings": []})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent/start"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_snapshot("s2", work.path().to_str().unwrap())),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reply"))
        .respond_with(sse_response(&fixtures::text_reply_sse("m1", &["Hola"])))
        .expect(1)
        .mount(&server)
        .await;

    cargo_bin_cmd!("relay")
        .env("RELAY_HOME", home.path())
        .env("RELAY_SERVER_URL", server.uri())
        .args(["chat", "--yes", "--recipe"])
        .arg(&recipe_path)
        .args(["--param", "language=Spanish", "--working-dir"])
        .arg(work.path())
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hola"));

    let requests = server.received_requests().await.unwrap();
    let start: Value = requests
        .iter()
        .find(|r| r.url.path() == "/agent/start")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .unwrap();
    assert_eq!(start["recipe"]["title"], "Translator");

    let replies = reply_bodies(&requests);
    assert_eq!(replies[0]["messages"][0]["content"][0]["text"], "Write in Spanish");
    assert_eq!(replies[0]["recipe_name"], "Translator");

    let hashes = home.path().join("recipe_hashes");
    assert_eq!(std::fs::read_dir(hashes).unwrap().count(), 1);
}

#[tokio::test]
async fn test_resume_with_local_recipe_still_asks_for_acceptance() {
    if !can_bind_localhost() {
        eprintln!("Skipping: cannot bind localhost TCP port in this environment.");
        return;
    }
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let server = MockServer::start().await;

    let recipe_path = work.path().join("cleanup.yaml");
    std::fs::write(
        &recipe_path,
        "title: Cleanup\ndescription: d\nprompt: \"Delete the build directory\"\n",
    )
    .unwrap();

    mount_healthy_config(&server, json!("openai"), json!("gpt-4o")).await;
    mount_extensions(&server, json!([])).await;
    // The server's record of the old session carries no recipe.
    Mock::given(method("POST"))
        .and(path("/agent/resume"))
        .and(body_partial_json(json!({"session_id": "old"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(session_snapshot("old", work.path().to_str().unwrap())),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/recipes/scan"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "has_security_warnings": true,
            "warnings": [{"type": "hidden_text", "message": "Hidden instructions found"}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reply"))
        .respond_with(sse_response(&fixtures::text_reply_sse("m1", &["done"])))
        .expect(0)
        .mount(&server)
        .await;

    cargo_bin_cmd!("relay")
        .env("RELAY_HOME", home.path())
        .env("RELAY_SERVER_URL", server.uri())
        .args(["chat", "--resume", "old", "--recipe"])
        .arg(&recipe_path)
        .arg("--working-dir")
        .arg(work.path())
        .write_stdin("n\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Warning: Hidden instructions found"))
        .stderr(predicate::str::contains("Recipe 'Cleanup' was not accepted"));

    let hashes = home.path().join("recipe_hashes");
    let recorded = std::fs::read_dir(hashes).map_or(0, Iterator::count);
    assert_eq!(recorded, 0);
}
