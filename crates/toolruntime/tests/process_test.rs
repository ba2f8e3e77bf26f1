#![cfg(unix)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use toolcore::{
    EventPayload, Graph, InvocationMode, NodeError, NodeSpec, NodeStatus, OutputSink, OutputStream, RunStatus,
    Strategy, ToolDescriptor, Value,
};
use toolruntime::{
    FlowRuntime, InMemoryHistory, ModuleRegistry, ProcessSpec, ProcessSupervisor, RuntimeConfig,
    SupervisorError, ToolRegistry,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct CollectSink {
    lines: Mutex<Vec<(OutputStream, String)>>,
}

impl OutputSink for CollectSink {
    fn line(&self, stream: OutputStream, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((stream, line.to_string()));
        }
    }
}

fn runtime_with(config: RuntimeConfig, descriptors: Vec<ToolDescriptor>) -> FlowRuntime {
    let mut tools = ToolRegistry::new();
    for descriptor in descriptors {
        tools.register(descriptor).unwrap();
    }
    FlowRuntime::new(
        config,
        tools,
        ModuleRegistry::new(),
        Arc::new(InMemoryHistory::new()),
    )
}

#[tokio::test]
async fn test_supervisor_streams_both_pipes() {
    init_tracing();
    let supervisor = ProcessSupervisor::new(Duration::from_secs(2));
    let sink = Arc::new(CollectSink::default());
    let spec = ProcessSpec::new("sh").args(["-c", "echo one; echo oops >&2; echo two; exit 3"]);

    let outcome = supervisor
        .run(&spec, sink.clone(), &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, Some(3));
    assert!(!outcome.success());
    assert_eq!(outcome.stdout, "one\ntwo\n");
    assert_eq!(outcome.stderr, "oops\n");

    let lines = sink.lines.lock().unwrap().clone();
    let stdout: Vec<&str> = lines
        .iter()
        .filter(|(s, _)| *s == OutputStream::Stdout)
        .map(|(_, l)| l.as_str())
        .collect();
    assert_eq!(stdout, vec!["one", "two"]);
    assert!(lines.contains(&(OutputStream::Stderr, "oops".to_string())));
}

#[tokio::test]
async fn test_supervisor_cancel_resolves_within_grace() {
    init_tracing();
    let grace = Duration::from_millis(500);
    let supervisor = ProcessSupervisor::new(grace);
    let cancel = CancellationToken::new();
    let spec = ProcessSpec::new("sleep").args(["30"]);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = supervisor
        .run(&spec, Arc::new(CollectSink::default()), &cancel, None)
        .await;

    assert!(matches!(result, Err(SupervisorError::Cancelled)));
    // cancel delay + one grace period, with a little scheduling slack.
    assert!(started.elapsed() < Duration::from_millis(200) + grace + Duration::from_millis(300));
}

/// Cancels after `delay` and returns how long `run` took from the cancel.
async fn time_cancel(supervisor: &ProcessSupervisor, spec: &ProcessSpec, delay: Duration) -> Duration {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = supervisor
        .run(spec, Arc::new(CollectSink::default()), &cancel, None)
        .await;
    assert!(matches!(result, Err(SupervisorError::Cancelled)));
    started.elapsed().saturating_sub(delay)
}

#[tokio::test]
async fn test_child_ignoring_sigterm_is_killed_within_grace() {
    init_tracing();
    let grace = Duration::from_millis(500);
    let supervisor = ProcessSupervisor::new(grace);
    let spec = ProcessSpec::new("sh").args(["-c", "trap '' TERM; sleep 30"]);

    let stop = time_cancel(&supervisor, &spec, Duration::from_millis(200)).await;
    assert!(stop < grace + Duration::from_millis(300), "stop took {:?}", stop);
}

#[tokio::test]
async fn test_grandchild_holding_pipes_is_stopped_with_group() {
    init_tracing();
    let grace = Duration::from_millis(500);
    let supervisor = ProcessSupervisor::new(grace);
    // The background sleep inherits stdout and would keep the reader open.
    let spec = ProcessSpec::new("sh").args(["-c", "sleep 30 & echo started; wait"]);

    let stop = time_cancel(&supervisor, &spec, Duration::from_millis(200)).await;
    assert!(stop < grace + Duration::from_millis(300), "stop took {:?}", stop);
}

#[tokio::test]
async fn test_supervisor_timeout_uses_stop_path() {
    init_tracing();
    let supervisor = ProcessSupervisor::new(Duration::from_millis(300));
    let spec = ProcessSpec::new("sleep").args(["30"]);

    let started = Instant::now();
    let result = supervisor
        .run(
            &spec,
            Arc::new(CollectSink::default()),
            &CancellationToken::new(),
            Some(Duration::from_millis(150)),
        )
        .await;

    assert!(matches!(result, Err(SupervisorError::Timeout { ms: 150 })));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    init_tracing();
    let supervisor = ProcessSupervisor::default();
    let spec = ProcessSpec::new("/nonexistent/bin/tool");
    let result = supervisor
        .run(&spec, Arc::new(CollectSink::default()), &CancellationToken::new(), None)
        .await;
    assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
}

#[tokio::test]
async fn test_auto_falls_back_to_global_cli() {
    init_tracing();
    let rt = runtime_with(
        RuntimeConfig::default(),
        vec![ToolDescriptor::new("say")
            .with_module("say-module-not-registered")
            .with_isolated_env("/nonexistent/venv/bin/python", ["-m", "say"])
            .with_cli("echo", ["say:"])],
    );

    let mut inputs = HashMap::new();
    inputs.insert("msg".to_string(), Value::from("hi"));
    inputs.insert("loud".to_string(), Value::Bool(true));
    inputs.insert("quiet".to_string(), Value::Bool(false));
    let ctx = rt.run_tool("say", inputs).await.unwrap();

    assert_eq!(ctx.status(), RunStatus::Completed);
    let node = ctx.node("say").unwrap();
    assert_eq!(node.strategy, Some(Strategy::GlobalCli));
    assert_eq!(node.output["output"], Value::from("say: --loud --msg hi"));
    assert_eq!(node.output["exit_code"], Value::from(0));
}

#[tokio::test]
async fn test_scan_filter_migrate_through_global_cli() {
    init_tracing();
    let stage = |name: &str| {
        ToolDescriptor::new(name)
            .with_mode(InvocationMode::GlobalCli)
            .with_cli("echo", [format!("{}:", name)])
    };
    let rt = runtime_with(
        RuntimeConfig::default(),
        vec![stage("scan"), stage("filter"), stage("migrate")],
    );
    let mut g = Graph::new("scan-filter-migrate");
    g.add_node(NodeSpec::new("scan", "scan").with_config("path", "/srv/photos"));
    g.add_node(NodeSpec::new("filter", "filter").with_input("found", true));
    g.add_node(NodeSpec::new("migrate", "migrate").with_input("kept", true));
    g.connect("scan", "output", "filter", "found");
    g.connect("filter", "output", "migrate", "kept");

    let (run_id, mut sub) = rt.submit_and_subscribe(g, HashMap::new()).await.unwrap();
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("event stream did not close");

    let completed: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::NodeStatusChanged { status: NodeStatus::Completed, .. } => e.node_id.as_deref(),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["scan", "filter", "migrate"]);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::NodeOutput { stream: OutputStream::Stdout, line } if line == "scan: --path /srv/photos"
    )));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(EventPayload::RunCompleted { status: RunStatus::Completed, .. })
    ));

    let ctx = rt.wait(run_id).await.unwrap();
    let migrate = ctx.node("migrate").unwrap();
    assert_eq!(migrate.strategy, Some(Strategy::GlobalCli));
    assert_eq!(
        migrate.output["output"],
        Value::from("migrate: --kept filter: --found scan: --path /srv/photos")
    );
}

#[tokio::test]
async fn test_json_stdout_feeds_downstream_slot() {
    init_tracing();
    let rt = runtime_with(
        RuntimeConfig::default(),
        vec![
            ToolDescriptor::new("scan").with_cli("sh", ["-c", r#"echo '{"output_path": "/tmp/scanned"}'"#]),
            ToolDescriptor::new("show").with_cli("echo", Vec::<String>::new()),
        ],
    );
    let mut g = Graph::new("json");
    g.add_node(NodeSpec::new("scan", "scan"));
    g.add_node(NodeSpec::new("show", "show").with_input("path", true));
    g.connect("scan", "output_path", "show", "path");

    let ctx = rt.run(g, HashMap::new()).await.unwrap();
    assert_eq!(ctx.status(), RunStatus::Completed);
    assert_eq!(
        ctx.node("show").unwrap().output["output"],
        Value::from("--path /tmp/scanned")
    );
}

#[tokio::test]
async fn test_non_zero_exit_carries_stderr_tail() {
    init_tracing();
    let rt = runtime_with(
        RuntimeConfig::default(),
        vec![ToolDescriptor::new("broken")
            .with_mode(InvocationMode::GlobalCli)
            .with_cli("sh", ["-c", "for i in $(seq 1 25); do echo err$i >&2; done; exit 2", "sh"])],
    );

    let ctx = rt.run_tool("broken", HashMap::new()).await.unwrap();
    match &ctx.node("broken").unwrap().error {
        Some(NodeError::NonZeroExit { code, stderr_tail }) => {
            assert_eq!(*code, Some(2));
            assert_eq!(stderr_tail.lines().count(), 20);
            assert!(stderr_tail.starts_with("err6"));
            assert!(stderr_tail.ends_with("err25"));
        }
        other => panic!("expected NonZeroExit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_cli_run_within_grace() {
    init_tracing();
    let config = RuntimeConfig {
        grace_period_ms: 500,
        ..RuntimeConfig::default()
    };
    let rt = runtime_with(
        config,
        vec![ToolDescriptor::new("nap").with_cli("sleep", ["30"])],
    );
    let mut g = Graph::new("nap");
    g.add_node(NodeSpec::new("nap", "nap"));

    let run_id = rt.submit(g, HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let started = Instant::now();
    assert!(rt.cancel(run_id).await.unwrap());

    let ctx = tokio::time::timeout(Duration::from_secs(5), rt.wait(run_id))
        .await
        .expect("run did not stop")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(ctx.status(), RunStatus::Cancelled);
    assert_eq!(ctx.node_status("nap"), Some(NodeStatus::Cancelled));
}

#[tokio::test]
async fn test_default_node_timeout_applies() {
    init_tracing();
    let config = RuntimeConfig {
        grace_period_ms: 300,
        default_node_timeout_ms: Some(200),
        ..RuntimeConfig::default()
    };
    let rt = runtime_with(
        config,
        vec![ToolDescriptor::new("nap").with_cli("sleep", ["30"])],
    );

    let ctx = rt.run_tool("nap", HashMap::new()).await.unwrap();
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert_eq!(
        ctx.node("nap").unwrap().error,
        Some(NodeError::Timeout { ms: 200 })
    );
}
