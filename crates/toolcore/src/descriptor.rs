use crate::DescriptorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How a tool should be invoked. `Auto` walks the strategies in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    Module,
    IsolatedEnv,
    GlobalCli,
    #[default]
    Auto,
}

impl InvocationMode {
    /// The single strategy this mode pins, if any.
    pub fn forced(&self) -> Option<Strategy> {
        match self {
            InvocationMode::Module => Some(Strategy::Module),
            InvocationMode::IsolatedEnv => Some(Strategy::IsolatedEnv),
            InvocationMode::GlobalCli => Some(Strategy::GlobalCli),
            InvocationMode::Auto => None,
        }
    }
}

/// A concrete way of running a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Module,
    IsolatedEnv,
    GlobalCli,
}

impl Strategy {
    /// Fallback order used by [`InvocationMode::Auto`].
    pub const AUTO_ORDER: [Strategy; 3] =
        [Strategy::Module, Strategy::IsolatedEnv, Strategy::GlobalCli];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Module => "module",
            Strategy::IsolatedEnv => "isolated_env",
            Strategy::GlobalCli => "global_cli",
        };
        f.write_str(name)
    }
}

/// Executable inside an isolated environment (e.g. a venv interpreter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvEntry {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Program resolved on the search path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliEntry {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Everything the engine knows about one tool adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub mode: InvocationMode,
    /// Name the tool is registered under in the module registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated_env: Option<EnvEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<CliEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "general".to_string()
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: InvocationMode::Auto,
            module: None,
            isolated_env: None,
            cli: None,
            timeout_ms: None,
            description: String::new(),
            category: default_category(),
        }
    }

    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_isolated_env<I, S>(mut self, executable: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.isolated_env = Some(EnvEntry {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_cli<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli = Some(CliEntry {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn configures(&self, strategy: Strategy) -> bool {
        match strategy {
            Strategy::Module => self.module.is_some(),
            Strategy::IsolatedEnv => self.isolated_env.is_some(),
            Strategy::GlobalCli => self.cli.is_some(),
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        if !Strategy::AUTO_ORDER.iter().any(|s| self.configures(*s)) {
            return Err(DescriptorError::NoInvocationPath(self.name.clone()));
        }
        if let Some(strategy) = self.mode.forced() {
            if !self.configures(strategy) {
                return Err(DescriptorError::MissingStrategy {
                    tool: self.name.clone(),
                    strategy,
                });
            }
        }
        Ok(())
    }

    /// Strategies worth probing, in the order they should be tried.
    pub fn candidates(&self) -> Vec<Strategy> {
        match self.mode.forced() {
            Some(strategy) => vec![strategy],
            None => Strategy::AUTO_ORDER
                .into_iter()
                .filter(|s| self.configures(*s))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_without_paths_is_invalid() {
        let err = ToolDescriptor::new("scan").validate().unwrap_err();
        assert_eq!(err, DescriptorError::NoInvocationPath("scan".into()));
    }

    #[test]
    fn forced_mode_must_be_configured() {
        let desc = ToolDescriptor::new("scan")
            .with_cli("scan", Vec::<String>::new())
            .with_mode(InvocationMode::Module);
        assert!(matches!(
            desc.validate(),
            Err(DescriptorError::MissingStrategy { strategy: Strategy::Module, .. })
        ));
    }

    #[test]
    fn auto_candidates_follow_fallback_order() {
        let desc = ToolDescriptor::new("scan")
            .with_cli("scan", ["--quiet"])
            .with_module("scan");
        assert_eq!(desc.candidates(), vec![Strategy::Module, Strategy::GlobalCli]);
    }

    #[test]
    fn catalog_json_uses_snake_case_modes() {
        let desc: ToolDescriptor = serde_json::from_str(
            r#"{"name": "migrate", "mode": "global_cli", "cli": {"program": "migratef"}}"#,
        )
        .unwrap();
        assert_eq!(desc.mode, InvocationMode::GlobalCli);
        assert_eq!(desc.candidates(), vec![Strategy::GlobalCli]);
        assert!(desc.validate().is_ok());
    }
}
