use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use toolcore::{Graph, NodeError, NodeSpec, NodeStatus, RunStatus, Strategy, Value};
use toolruntime::{FlowRuntime, InMemoryHistory, ModuleRegistry, RuntimeConfig, ToolRegistry};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn runtime() -> FlowRuntime {
    let mut tools = ToolRegistry::new();
    let mut modules = ModuleRegistry::new();
    toolmodules::register_all(&mut tools, &mut modules);
    FlowRuntime::new(
        RuntimeConfig::default(),
        tools,
        modules,
        Arc::new(InMemoryHistory::new()),
    )
}

#[test]
fn test_register_all_exposes_every_module() {
    let mut tools = ToolRegistry::new();
    let mut modules = ModuleRegistry::new();
    toolmodules::register_all(&mut tools, &mut modules);

    assert_eq!(tools.len(), toolmodules::descriptors().len());
    for descriptor in tools.list() {
        let module = descriptor.module.as_deref().unwrap();
        assert!(modules.contains(module), "{} has no module", descriptor.name);
    }
}

#[tokio::test]
async fn test_scan_stringify_parse_chain() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.log"), "x").unwrap();
    std::fs::write(dir.path().join("a.log"), "x").unwrap();
    std::fs::write(dir.path().join("skip.txt"), "x").unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    std::fs::write(dir.path().join("nested").join("c.LOG"), "x").unwrap();

    let mut g = Graph::new("chain");
    g.add_node(
        NodeSpec::new("scan", "fs.scan")
            .with_config("ext", ".log")
            .with_config("recursive", true)
            .with_input("path", true),
    );
    g.add_node(NodeSpec::new("stringify", "transform.json_stringify").with_input("value", true));
    g.add_node(NodeSpec::new("parse", "transform.json_parse").with_input("json", true));
    g.connect("scan", "files", "stringify", "value");
    g.connect("stringify", "json", "parse", "json");

    let mut inputs = HashMap::new();
    inputs.insert(
        "scan.path".to_string(),
        Value::from(dir.path().display().to_string()),
    );

    let ctx = runtime().run(g, inputs).await.unwrap();
    assert_eq!(ctx.status(), RunStatus::Completed);

    let scan = ctx.node("scan").unwrap();
    assert_eq!(scan.strategy, Some(Strategy::Module));
    assert_eq!(scan.output["total_count"], Value::from(3));

    let parsed = match &ctx.node("parse").unwrap().output["parsed"] {
        Value::Array(items) => items.clone(),
        other => panic!("expected array, got {:?}", other),
    };
    let names: Vec<String> = parsed
        .iter()
        .filter_map(|v| v.as_str())
        .map(|p| {
            std::path::Path::new(p)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert_eq!(names, vec!["a.log", "b.log", "c.LOG"]);
}

#[tokio::test]
async fn test_scan_of_missing_directory_fails_node() {
    init_tracing();
    let mut inputs = HashMap::new();
    inputs.insert("path".to_string(), Value::from("/nonexistent/scan/root"));

    let ctx = runtime().run_tool("fs.scan", inputs).await.unwrap();
    assert_eq!(ctx.status(), RunStatus::Failed);
    assert!(matches!(
        ctx.node("fs.scan").unwrap().error,
        Some(NodeError::ToolFailed { .. })
    ));
}

#[tokio::test]
async fn test_cancel_interrupts_delay() {
    init_tracing();
    let rt = runtime();
    let mut g = Graph::new("wait");
    g.add_node(NodeSpec::new("wait", "time.delay").with_config("delay_ms", 60_000));
    g.add_node(NodeSpec::new("after", "echo"));
    g.depend("wait", "after");

    let run_id = rt.submit(g, HashMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rt.cancel(run_id).await.unwrap());

    let ctx = tokio::time::timeout(Duration::from_secs(2), rt.wait(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ctx.status(), RunStatus::Cancelled);
    assert_eq!(ctx.node_status("wait"), Some(NodeStatus::Cancelled));
    assert_eq!(ctx.node_status("after"), Some(NodeStatus::Cancelled));
}

#[tokio::test]
async fn test_debug_log_reports_message() {
    init_tracing();
    let mut inputs = HashMap::new();
    inputs.insert("message".to_string(), Value::from("hello"));

    let ctx = runtime().run_tool("debug.log", inputs).await.unwrap();
    let node = ctx.node("debug.log").unwrap();
    assert_eq!(node.output["message"], Value::from("hello"));
}
