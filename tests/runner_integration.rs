// End-to-end tests for the isolated runner: load, invoke, time out, relay

use connector_sandbox::protocol::LogLevel;
use connector_sandbox::{
    NetworkRequestEnvelope, NetworkResponseEnvelope, OperationData, RelayError, RunOptions,
    RunnerError, SandboxConfig, SandboxRunner,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONNECTOR: &str = r#"
interface Ctx {
    auth: Record<string, unknown>;
    payload: { data: any };
    config: any;
    appId: string;
    operationKey: string;
    fetch: (url: string, init?: any) => Promise<any>;
    logger: { info: (...args: unknown[]) => void };
}

const connector = {
    connection: 42,
    test: async (ctx: Ctx) => ({ ok: true, user: ctx.auth.user }),
    actions: {
        create_item: {
            execute: async (_ctx: Ctx) => ({ success: true, data: { id: "x" } }),
            fields: () => [
                { name: "title", type: "string" },
                { name: "board", type: "select", pick_list: async () => [{ label: "Main", value: "b1" }] }
            ]
        }
    },
    methods: {
        slow: () => new Promise((resolve) => setTimeout(() => resolve("slow"), 100)),
        fast: () => "fast",
        hang: () => new Promise(() => {}),
        boom: () => { throw new Error("boom"); },
        remote: async (ctx: Ctx) => {
            const response = await ctx.fetch("https://api.example.com/items?limit=1", {
                headers: { Authorization: "Bearer t" }
            });
            return response.json();
        },
        chatty: (ctx: Ctx) => {
            console.log("hello", { n: 1 });
            ctx.logger.info("scoped");
            return { appId: ctx.appId, key: ctx.operationKey, config: ctx.config };
        }
    }
};

export default connector;
"#;

async fn loaded_runner() -> SandboxRunner {
    let runner = SandboxRunner::new(SandboxConfig::default());
    runner.load_connector(CONNECTOR).await.unwrap();
    runner
}

async fn call(runner: &SandboxRunner, path: &str, context: Value) -> Result<Value, RunnerError> {
    runner.run(path, context, RunOptions::default(), false)?.await
}

#[tokio::test]
async fn non_callable_values_are_described() {
    let runner = loaded_runner().await;
    let result = call(&runner, "connection", json!({})).await.unwrap();
    assert_eq!(result["value"], 42);
    assert_eq!(result["type"], "number");
    assert!(result["note"].as_str().unwrap().contains("not a function"));
}

#[tokio::test]
async fn callable_values_receive_the_context() {
    let runner = loaded_runner().await;
    let result = call(&runner, "test", json!({ "auth": { "user": "ada" } }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "ok": true, "user": "ada" }));
}

#[tokio::test]
async fn create_item_returns_the_exact_object() {
    let runner = loaded_runner().await;
    let result = runner
        .run(
            "actions.create_item.execute",
            json!({ "auth": {}, "payload": { "data": {} } }),
            RunOptions::default().with_timeout_ms(5000),
            false,
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, json!({ "success": true, "data": { "id": "x" } }));
}

#[tokio::test]
async fn missing_paths_name_the_path() {
    let runner = loaded_runner().await;
    let err = call(&runner, "triggers.new_item.poll", json!({}))
        .await
        .unwrap_err();
    match err {
        RunnerError::MethodNotFound { message } => {
            assert!(message.contains("triggers.new_item.poll"));
        }
        other => panic!("expected MethodNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn thrown_errors_reject_the_call() {
    let runner = loaded_runner().await;
    let err = call(&runner, "methods.boom", json!({})).await.unwrap_err();
    assert!(matches!(err, RunnerError::Invocation { .. }));
    assert!(err.to_string().contains("boom"));

    // The boundary survives an ordinary failure.
    assert_eq!(call(&runner, "methods.fast", json!({})).await.unwrap(), "fast");
}

#[tokio::test]
async fn pick_lists_are_resolved_for_field_calls() {
    let runner = loaded_runner().await;
    let fields = runner
        .run("actions.create_item.fields", json!({}), RunOptions::default(), true)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        fields,
        json!([
            { "name": "title", "type": "string" },
            { "name": "board", "type": "select", "pick_list": [{ "label": "Main", "value": "b1" }] }
        ])
    );
}

#[tokio::test]
async fn calls_settle_independently() {
    let runner = loaded_runner().await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let slow = runner
        .run("methods.slow", json!({}), RunOptions::default(), false)
        .unwrap();
    let fast = runner
        .run("methods.fast", json!({}), RunOptions::default(), false)
        .unwrap();
    assert_ne!(slow.request_id(), fast.request_id());

    let (slow_result, fast_result) = tokio::join!(
        async {
            let result = slow.await;
            order.lock().push("slow");
            result
        },
        async {
            let result = fast.await;
            order.lock().push("fast");
            result
        }
    );
    assert_eq!(slow_result.unwrap(), "slow");
    assert_eq!(fast_result.unwrap(), "fast");
    assert_eq!(*order.lock(), vec!["fast", "slow"]);
    assert_eq!(runner.pending_calls(), 0);
}

#[tokio::test]
async fn timeouts_tear_the_boundary_down() {
    let runner = loaded_runner().await;
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        runner
            .run("methods.hang", json!({}), RunOptions::default().with_timeout_ms(1), false)
            .unwrap(),
    )
    .await
    .expect("timed-out call must settle");
    assert!(matches!(outcome, Err(RunnerError::Timeout { timeout_ms: 1 })));
    assert!(started.elapsed() <= Duration::from_millis(50));

    assert!(!runner.is_ready());
    assert!(matches!(
        runner.run("methods.fast", json!({}), RunOptions::default(), false),
        Err(RunnerError::NotReady)
    ));

    // A fresh load brings up a new boundary.
    runner.load_connector(CONNECTOR).await.unwrap();
    assert_eq!(call(&runner, "methods.fast", json!({})).await.unwrap(), "fast");
}

#[tokio::test]
async fn proxied_fetch_goes_through_the_relay() {
    let runner = loaded_runner().await;
    let seen: Arc<Mutex<Vec<NetworkRequestEnvelope>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    runner.on_network_request(move |request: NetworkRequestEnvelope| {
        captured.lock().push(request);
        async move { Ok::<_, RelayError>(NetworkResponseEnvelope::ok(r#"{"a":1}"#)) }
    });

    let result = runner
        .run(
            "methods.remote",
            json!({}),
            RunOptions::default().with_proxy_fetch(true),
            false,
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, json!({ "a": 1 }));

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, "https://api.example.com/items?limit=1");
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].headers["Authorization"], "Bearer t");
}

#[tokio::test]
async fn relay_errors_reject_fetch() {
    let runner = loaded_runner().await;
    runner.on_network_request(|_request: NetworkRequestEnvelope| async move {
        Err::<NetworkResponseEnvelope, _>(RelayError::HostBlocked {
            host: "api.example.com".into(),
        })
    });

    let err = runner
        .run(
            "methods.remote",
            json!({}),
            RunOptions::default().with_proxy_fetch(true),
            false,
        )
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Network relay error"));
    assert!(err.to_string().contains("api.example.com"));
}

#[tokio::test]
async fn console_output_and_operation_data_reach_the_host() {
    let runner = loaded_runner().await;
    let lines: Arc<Mutex<Vec<(LogLevel, Vec<Value>, Option<String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    runner.on_console(move |level: LogLevel, args: &[Value], logger: Option<&str>| {
        sink.lock()
            .push((level, args.to_vec(), logger.map(str::to_string)));
    });

    let operation_data = OperationData::default()
        .with_app_id("app-1")
        .with_operation_key("op-7")
        .with_config(json!({ "region": "eu" }));
    let result = runner
        .run(
            "methods.chatty",
            json!({ "appId": "from-context" }),
            RunOptions::default().with_operation_data(operation_data),
            false,
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        result,
        json!({ "appId": "app-1", "key": "op-7", "config": { "region": "eu" } })
    );

    let lines = lines.lock();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].0, LogLevel::Info);
    assert_eq!(lines[0].1, vec![json!("hello"), json!({ "n": 1 })]);
    assert_eq!(lines[0].2, None);
    assert_eq!(lines[1].1, vec![json!("scoped")]);
    assert_eq!(lines[1].2.as_deref(), Some("methods.chatty"));
}

#[tokio::test]
async fn runs_before_load_are_not_ready() {
    let runner = SandboxRunner::new(SandboxConfig::default());
    assert!(matches!(
        runner.run("test", json!({}), RunOptions::default(), false),
        Err(RunnerError::NotReady)
    ));
}
