use std::collections::HashMap;
use std::sync::Arc;
use toolcore::{
    BlockingToolModule, DescriptorError, Graph, GraphError, NodeId, ToolDescriptor, ToolModule,
};

/// Tool name to descriptor. Resolution happens once, when a graph is submitted.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one with the same name.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), DescriptorError> {
        descriptor.validate()?;
        tracing::info!("Registering tool: {} ({:?})", descriptor.name, descriptor.mode);
        self.tools
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All descriptors, sorted by name.
    pub fn list(&self) -> Vec<Arc<ToolDescriptor>> {
        let mut tools: Vec<_> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up the descriptor of every node in the graph.
    pub fn resolve(&self, graph: &Graph) -> Result<HashMap<NodeId, Arc<ToolDescriptor>>, GraphError> {
        graph
            .nodes
            .iter()
            .map(|node| {
                self.get(&node.tool)
                    .map(|desc| (node.id.clone(), desc))
                    .ok_or_else(|| GraphError::UnknownTool {
                        node: node.id.clone(),
                        tool: node.tool.clone(),
                    })
            })
            .collect()
    }
}

/// A registered in-process module.
#[derive(Clone)]
pub enum ModuleEntry {
    Async(Arc<dyn ToolModule>),
    Blocking(Arc<dyn BlockingToolModule>),
}

/// Registry of in-process modules available to the `module` strategy
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Arc<dyn ToolModule>) {
        let name = module.name().to_string();
        tracing::info!("Registering module: {}", name);
        self.modules.insert(name, ModuleEntry::Async(module));
    }

    pub fn register_blocking(&mut self, module: Arc<dyn BlockingToolModule>) {
        let name = module.name().to_string();
        tracing::info!("Registering blocking module: {}", name);
        self.modules.insert(name, ModuleEntry::Blocking(module));
    }

    pub fn get(&self, name: &str) -> Option<ModuleEntry> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn list_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}
