//! Standard tool library
//!
//! Built-in in-process modules for common operations, each with the
//! descriptor that exposes it through the `module` strategy.

mod debug;
mod fs;
mod time;
mod transform;

pub use debug::{DebugModule, EchoModule};
pub use fs::ScanModule;
pub use time::DelayModule;
pub use transform::{JsonParseModule, JsonStringifyModule};

use std::sync::Arc;
use toolruntime::{ModuleRegistry, ToolRegistry};

/// Descriptors of every built-in module.
pub fn descriptors() -> Vec<toolcore::ToolDescriptor> {
    vec![
        EchoModule::descriptor(),
        DebugModule::descriptor(),
        DelayModule::descriptor(),
        JsonParseModule::descriptor(),
        JsonStringifyModule::descriptor(),
        ScanModule::descriptor(),
    ]
}

/// Register all standard modules and their descriptors
pub fn register_all(tools: &mut ToolRegistry, modules: &mut ModuleRegistry) {
    modules.register(Arc::new(EchoModule));
    modules.register(Arc::new(DebugModule));
    modules.register(Arc::new(DelayModule));
    modules.register_blocking(Arc::new(JsonParseModule));
    modules.register_blocking(Arc::new(JsonStringifyModule));
    modules.register_blocking(Arc::new(ScanModule));

    for descriptor in descriptors() {
        if let Err(e) = tools.register(descriptor) {
            tracing::error!("Built-in descriptor rejected: {}", e);
        }
    }
}
