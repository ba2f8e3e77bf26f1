use std::collections::BTreeMap;
use toolcore::{BlockingToolModule, ModuleContext, ModuleError, ToolDescriptor, ToolResult, Value};

fn single(key: &str, value: Value) -> Value {
    let mut map = BTreeMap::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// Parse JSON string to Value
pub struct JsonParseModule;

impl JsonParseModule {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new("transform.json_parse")
            .with_module("transform.json_parse")
            .with_description("Parse JSON string")
            .with_category("transform")
    }
}

impl BlockingToolModule for JsonParseModule {
    fn name(&self) -> &str {
        "transform.json_parse"
    }

    fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError> {
        let input = ctx
            .require_input("json")?
            .as_str()
            .ok_or_else(|| ModuleError::new("Input 'json' must be a string"))?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| ModuleError::new(format!("JSON parse error: {}", e)))?;

        Ok(ToolResult::ok(single("parsed", Value::from(parsed))))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyModule;

impl JsonStringifyModule {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new("transform.json_stringify")
            .with_module("transform.json_stringify")
            .with_description("Convert value to JSON string")
            .with_category("transform")
    }
}

impl BlockingToolModule for JsonStringifyModule {
    fn name(&self) -> &str {
        "transform.json_stringify"
    }

    fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError> {
        let value = ctx.require_input("value")?.to_json();
        let pretty = ctx.input_or("pretty", Value::Bool(false)).as_bool().unwrap_or(false);

        let json_str = if pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| ModuleError::new(format!("JSON stringify error: {}", e)))?;

        Ok(ToolResult::ok(single("json", Value::from(json_str))))
    }
}
