use async_trait::async_trait;
use toolcore::{ModuleContext, ModuleError, ToolDescriptor, ToolModule, ToolResult, Value};

/// Returns its inputs unchanged, as one object.
pub struct EchoModule;

impl EchoModule {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new("echo")
            .with_module("echo")
            .with_description("Return the node inputs as its output")
            .with_category("debug")
    }
}

#[async_trait]
impl ToolModule for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError> {
        let data: Value = Value::Object(ctx.inputs.clone().into_iter().collect());
        Ok(ToolResult::ok(data))
    }
}

/// Simple debug module that logs its inputs
pub struct DebugModule;

impl DebugModule {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new("debug.log")
            .with_module("debug.log")
            .with_description("Logs input values for debugging")
            .with_category("debug")
    }
}

#[async_trait]
impl ToolModule for DebugModule {
    fn name(&self) -> &str {
        "debug.log"
    }

    async fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError> {
        let message = ctx
            .inputs
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)")
            .to_string();

        tracing::debug!(node = %ctx.node_id, "DEBUG: {}", message);
        ctx.log(format!("DEBUG: {}", message));

        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        for key in keys {
            ctx.log(format!("  {}: {}", key, ctx.inputs[key].to_arg_string()));
        }

        let mut data = std::collections::BTreeMap::new();
        data.insert("message".to_string(), Value::from(message.clone()));
        Ok(ToolResult::ok(Value::Object(data)).with_message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[tokio::test]
    async fn echo_returns_inputs() {
        let mut inputs = HashMap::new();
        inputs.insert("path".to_string(), Value::from("/tmp"));
        let ctx = ModuleContext::new(Uuid::new_v4(), "e", inputs);

        let result = EchoModule.run(ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data.as_object().unwrap()["path"], Value::from("/tmp"));
    }

    #[tokio::test]
    async fn debug_defaults_message() {
        let ctx = ModuleContext::new(Uuid::new_v4(), "d", HashMap::new());
        let result = DebugModule.run(ctx).await.unwrap();
        assert_eq!(result.message, "(no message)");
    }
}
