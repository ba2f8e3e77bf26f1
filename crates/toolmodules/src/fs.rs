use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use toolcore::{BlockingToolModule, ModuleContext, ModuleError, ToolDescriptor, ToolResult, Value};
use walkdir::WalkDir;

/// Lists files under a directory.
///
/// Inputs: `path` (required), `ext` (extension filter, with or without the
/// dot), `recursive` (default false), `max_results` (0 means no limit).
/// Symlinks are reported as entries but never followed. Unreadable entries
/// are collected under `errors` rather than failing the scan. The file list
/// is sorted so downstream nodes see a stable order.
pub struct ScanModule;

impl ScanModule {
    pub fn descriptor() -> ToolDescriptor {
        ToolDescriptor::new("fs.scan")
            .with_module("fs.scan")
            .with_description("List files in a directory, optionally filtered by extension")
            .with_category("fs")
    }
}

struct ScanOptions {
    ext: Option<String>,
    recursive: bool,
    max_results: usize,
}

impl ScanOptions {
    fn wants(&self, path: &Path) -> bool {
        match &self.ext {
            None => true,
            Some(ext) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(ext))
                .unwrap_or(false),
        }
    }
}

#[derive(Default)]
struct ScanState {
    files: Vec<PathBuf>,
    errors: Vec<String>,
}

fn walk(root: &Path, opts: &ScanOptions, ctx: &ModuleContext) -> Result<ScanState, ModuleError> {
    let mut state = ScanState::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .max_depth(if opts.recursive { usize::MAX } else { 1 })
        .sort_by_file_name();

    for entry in walker {
        if ctx.cancellation.is_cancelled() {
            return Err(ModuleError::new("Scan cancelled"));
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                state.errors.push(e.to_string());
                continue;
            }
        };
        if entry.file_type().is_file() && opts.wants(entry.path()) {
            state.files.push(entry.into_path());
        }
    }
    Ok(state)
}

fn count_extensions(files: &[PathBuf]) -> BTreeMap<String, Value> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for file in files {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        *counts.entry(ext).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(ext, n)| (ext, Value::from(n as i64)))
        .collect()
}

impl BlockingToolModule for ScanModule {
    fn name(&self) -> &str {
        "fs.scan"
    }

    fn run(&self, ctx: ModuleContext) -> Result<ToolResult, ModuleError> {
        let root = PathBuf::from(
            ctx.require_input("path")?
                .as_str()
                .ok_or_else(|| ModuleError::new("Input 'path' must be a string"))?,
        );
        if !root.is_dir() {
            return Ok(ToolResult::failed(format!(
                "Not a directory: {}",
                root.display()
            )));
        }

        let opts = ScanOptions {
            ext: ctx
                .inputs
                .get("ext")
                .and_then(|v| v.as_str())
                .map(|e| e.trim_start_matches('.').to_string())
                .filter(|e| !e.is_empty()),
            recursive: ctx.input_or("recursive", Value::Bool(false)).as_bool().unwrap_or(false),
            max_results: ctx
                .input_or("max_results", Value::Number(0.0))
                .as_f64()
                .filter(|n| *n > 0.0)
                .map(|n| n as usize)
                .unwrap_or(0),
        };

        ctx.log(format!("Scanning {}", root.display()));
        let mut state = walk(&root, &opts, &ctx)?;

        state.files.sort();
        let total = state.files.len();
        // Counts describe the whole scan; only the listed paths are capped.
        let by_extension = count_extensions(&state.files);
        if opts.max_results > 0 {
            state.files.truncate(opts.max_results);
        }

        let mut data = BTreeMap::new();
        data.insert(
            "files".to_string(),
            Value::Array(
                state
                    .files
                    .iter()
                    .map(|p| Value::from(p.display().to_string()))
                    .collect(),
            ),
        );
        data.insert("total_count".to_string(), Value::from(total as i64));
        data.insert("by_extension".to_string(), Value::Object(by_extension));
        data.insert(
            "errors".to_string(),
            Value::Array(state.errors.into_iter().map(Value::from).collect()),
        );
        data.insert(
            "output_path".to_string(),
            Value::from(root.display().to_string()),
        );

        Ok(ToolResult::ok(Value::Object(data)).with_message(format!("Found {} files", total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn scan(inputs: &[(&str, Value)]) -> ToolResult {
        let inputs: HashMap<String, Value> = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ScanModule
            .run(ModuleContext::new(Uuid::new_v4(), "scan", inputs))
            .unwrap()
    }

    #[test]
    fn extension_counts_cover_the_whole_scan() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.log", "b.log", "c.txt"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }

        let result = scan(&[
            ("path", Value::from(dir.path().display().to_string())),
            ("max_results", Value::from(1)),
        ]);
        let data = result.data.as_object().unwrap();

        assert_eq!(data["total_count"], Value::from(3));
        assert_eq!(data["files"], Value::Array(vec![Value::from(
            dir.path().join("a.log").display().to_string()
        )]));
        let by_ext = data["by_extension"].as_object().unwrap();
        assert_eq!(by_ext["log"], Value::from(2));
        assert_eq!(by_ext["txt"], Value::from(1));
    }

    #[test]
    fn non_recursive_scan_stays_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("top.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("deep.txt"), "x").unwrap();

        let result = scan(&[("path", Value::from(dir.path().display().to_string()))]);
        assert_eq!(result.data.as_object().unwrap()["total_count"], Value::from(1));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::os::unix::fs::symlink(".", dir.path().join("loop")).unwrap();

        let result = scan(&[
            ("path", Value::from(dir.path().display().to_string())),
            ("recursive", Value::Bool(true)),
        ]);
        let data = result.data.as_object().unwrap();
        assert!(result.success);
        assert_eq!(data["total_count"], Value::from(1));
        assert_eq!(data["errors"], Value::Array(Vec::new()));
    }
}
