use crate::registry::ToolRegistry;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toolcore::{DescriptorError, ToolDescriptor};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid descriptor in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Rejected descriptor in {}: {source}", .path.display())]
    Descriptor {
        path: PathBuf,
        source: DescriptorError,
    },
}

/// Loads `*.json` tool descriptors from a catalog directory.
pub struct ToolCatalogLoader {
    catalog_dir: PathBuf,
}

impl ToolCatalogLoader {
    pub fn new(catalog_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog_dir: catalog_dir.into(),
        }
    }

    pub fn catalog_dir(&self) -> &Path {
        &self.catalog_dir
    }

    /// Read every descriptor file. A file holds one descriptor or an array of them.
    pub fn read_descriptors(&self) -> Result<Vec<ToolDescriptor>, CatalogError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CatalogError::Io { path, source }
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.catalog_dir).map_err(io_err(self.catalog_dir.as_path()))? {
            let path = entry.map_err(io_err(self.catalog_dir.as_path()))?.path();
            if path.extension() == Some("json".as_ref()) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut descriptors = Vec::new();
        for path in paths {
            let text = std::fs::read_to_string(&path).map_err(io_err(path.as_path()))?;
            let parsed: DescriptorFile =
                serde_json::from_str(&text).map_err(|source| CatalogError::Parse {
                    path: path.clone(),
                    source,
                })?;
            for descriptor in parsed.into_vec() {
                descriptor.validate().map_err(|source| CatalogError::Descriptor {
                    path: path.clone(),
                    source,
                })?;
                descriptors.push(descriptor);
            }
        }
        Ok(descriptors)
    }

    /// Load the catalog into a registry. Returns how many tools were added.
    pub fn load_into(&self, registry: &mut ToolRegistry) -> Result<usize, CatalogError> {
        let descriptors = self.read_descriptors()?;
        let count = descriptors.len();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            registry
                .register(descriptor)
                .map_err(|source| CatalogError::Descriptor {
                    path: self.catalog_dir.join(format!("{}.json", name)),
                    source,
                })?;
        }
        tracing::info!(
            "Loaded {} tool descriptors from {}",
            count,
            self.catalog_dir.display()
        );
        Ok(count)
    }
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    One(ToolDescriptor),
    Many(Vec<ToolDescriptor>),
}

impl DescriptorFile {
    fn into_vec(self) -> Vec<ToolDescriptor> {
        match self {
            DescriptorFile::One(d) => vec![d],
            DescriptorFile::Many(ds) => ds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_single_and_array_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("scan.json"),
            r#"{"name": "scan", "cli": {"program": "scanner", "args": ["run"]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("pair.json"),
            r#"[{"name": "filter", "module": "filter"},
                {"name": "migrate", "mode": "global_cli", "cli": {"program": "migrator"}}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = ToolRegistry::new();
        let count = ToolCatalogLoader::new(dir.path())
            .load_into(&mut registry)
            .unwrap();
        assert_eq!(count, 3);
        assert!(registry.contains("scan") && registry.contains("filter") && registry.contains("migrate"));
    }

    #[test]
    fn descriptor_without_invocation_path_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), r#"{"name": "bad"}"#).unwrap();
        let err = ToolCatalogLoader::new(dir.path())
            .read_descriptors()
            .unwrap_err();
        assert!(matches!(err, CatalogError::Descriptor { .. }));
    }
}
