use async_trait::async_trait;
use toolcore::{ModuleContext, ModuleError, ToolDescriptor, ToolModule, ToolResult, Value};
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Waits `delay_ms`, then passes its inputs through. Stops early on cancel.
pub struct DelayModule;

impl DelayModule {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new("time.delay")
            .with_module("time.delay")
            .with_description("Delay execution for specified milliseconds")
            .with_category("time")
    }
}

#[async_trait]
impl ToolModule for DelayModule {
    fn name(&self) -> &str {
        "time.delay"
    }

    async fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError> {
        let delay_ms = match ctx.inputs.get("delay_ms") {
            None | Some(Value::Null) => DEFAULT_DELAY_MS,
            Some(v) => v
                .as_f64()
                .filter(|ms| *ms >= 0.0)
                .ok_or_else(|| ModuleError::new("delay_ms must be a non-negative number"))?
                as u64,
        };

        ctx.log(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => {
                return Err(ModuleError::new("Delay cancelled"));
            }
        }

        let outputs: Value = Value::Object(ctx.inputs.into_iter().collect());
        Ok(ToolResult::ok(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[tokio::test]
    async fn passes_inputs_through() {
        let mut inputs = HashMap::new();
        inputs.insert("delay_ms".to_string(), Value::from(5));
        inputs.insert("tag".to_string(), Value::from("x"));
        let ctx = ModuleContext::new(Uuid::new_v4(), "wait", inputs);

        let result = DelayModule.run(ctx).await.unwrap();
        assert_eq!(result.data.as_object().unwrap()["tag"], Value::from("x"));
    }

    #[tokio::test]
    async fn rejects_negative_delay() {
        let mut inputs = HashMap::new();
        inputs.insert("delay_ms".to_string(), Value::from(-1));
        let ctx = ModuleContext::new(Uuid::new_v4(), "wait", inputs);
        assert!(DelayModule.run(ctx).await.is_err());
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let mut inputs = HashMap::new();
        inputs.insert("delay_ms".to_string(), Value::from(60_000));
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ModuleContext::new(Uuid::new_v4(), "wait", inputs).with_cancellation(token);

        let result = tokio::time::timeout(Duration::from_secs(1), DelayModule.run(ctx)).await;
        assert!(matches!(result, Ok(Err(_))));
    }
}
