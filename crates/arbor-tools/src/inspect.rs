use ignore::WalkBuilder;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use arbor_types::{ActionRecord, ActionStatus};
use arbor_workspace::Workspace;

use crate::{ActionOutcome, ToolError};

const MAX_READ_BYTES: usize = 200 * 1024;
const DEFAULT_READ_CHARS: usize = 120_000;
const DEFAULT_SCAN_FILES: usize = 200;
const DEFAULT_MAX_MATCHES: usize = 50;
const MATCH_TEXT_CAP: usize = 240;

const IGNORED_DIRS: [&str; 7] = [
    ".git",
    "node_modules",
    "dist",
    "build",
    "__pycache__",
    ".idea",
    "target",
];
const BINARY_EXTS: [&str; 9] = [
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "lock", "mp4", "zip",
];

#[derive(Debug, Deserialize)]
pub(crate) struct ScanInput {
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    max_files: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadFilesInput {
    #[serde(alias = "file_paths", alias = "files", default)]
    paths: Vec<String>,
    #[serde(default)]
    max_chars: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchInput {
    #[serde(default)]
    query: String,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    max_matches: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PathInput {
    path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ValidateInput {
    #[serde(default)]
    criteria: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    evidence: Option<Value>,
}

pub(crate) async fn scan_workspace(
    ws: &Workspace,
    input: ScanInput,
) -> Result<ActionOutcome, ToolError> {
    let rel_root = input.root.unwrap_or_default();
    let root = ws.resolve(&rel_root)?;
    let max_files = input.max_files.unwrap_or(DEFAULT_SCAN_FILES).max(1);

    let mut files = Vec::new();
    let mut dir_count = 0usize;
    for entry in WalkBuilder::new(&root).hidden(false).build().flatten() {
        let Ok(rel) = entry.path().strip_prefix(ws.root()) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel.is_empty() || is_ignored(&rel) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dir_count += 1;
            continue;
        }
        if !input.include.is_empty() && !input.include.iter().any(|p| rel.contains(p.as_str())) {
            continue;
        }
        if input.exclude.iter().any(|p| rel.contains(p.as_str())) {
            continue;
        }
        files.push(rel);
        if files.len() >= max_files {
            break;
        }
    }
    files.sort();

    Ok(ActionOutcome::data(json!({
        "root": ws.root().display().to_string(),
        "files": files,
        "file_count": files.len(),
        "dir_count": dir_count,
    })))
}

pub(crate) async fn read_files(
    ws: &Workspace,
    input: ReadFilesInput,
) -> Result<ActionOutcome, ToolError> {
    if input.paths.is_empty() {
        return Err(ToolError::InvalidInput(
            "read_files requires a non-empty `paths` list".to_string(),
        ));
    }
    let max_chars = input.max_chars.unwrap_or(DEFAULT_READ_CHARS).max(1);

    // Resolve everything first so a path escape fails before any I/O.
    for path in &input.paths {
        ws.resolve(path)?;
    }

    let mut results = Vec::new();
    for path in input.paths.iter().take(50) {
        match ws.read_to_string(path).await {
            Ok(content) => {
                let chars = content.chars().count();
                let (text, truncated) = truncate_content(&content, max_chars);
                results.push(json!({
                    "path": path,
                    "chars": chars,
                    "content": text,
                    "content_truncated": truncated,
                    "returned_chars": text.chars().count(),
                }));
            }
            Err(err) => results.push(json!({"path": path, "error": err.to_string()})),
        }
    }
    Ok(ActionOutcome::data(json!({"files": results})))
}

pub(crate) async fn search_code(
    ws: &Workspace,
    input: SearchInput,
) -> Result<ActionOutcome, ToolError> {
    let query = input.query.trim().to_string();
    if query.is_empty() {
        return Err(ToolError::InvalidInput(
            "search_code requires a non-empty `query`".to_string(),
        ));
    }
    let rel_root = input.root.unwrap_or_default();
    let root = ws.resolve(&rel_root)?;
    let max_matches = input.max_matches.unwrap_or(DEFAULT_MAX_MATCHES).max(1);

    let pattern = Regex::new(&format!("(?i){}", regex::escape(&query)))
        .map_err(|err| ToolError::InvalidInput(err.to_string()))?;

    let mut matches = Vec::new();
    'walk: for entry in WalkBuilder::new(&root).build().flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(ws.root()) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if is_ignored(&rel) {
            continue;
        }
        let Ok(content) = tokio::fs::read_to_string(entry.path()).await else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if pattern.is_match(line) {
                let text: String = line.trim().chars().take(MATCH_TEXT_CAP).collect();
                matches.push(json!({"path": rel, "line": idx + 1, "text": text}));
                if matches.len() >= max_matches {
                    break 'walk;
                }
            }
        }
    }

    Ok(ActionOutcome::data(json!({
        "query": query,
        "matches": matches,
    })))
}

pub(crate) async fn extract_symbols(
    ws: &Workspace,
    input: PathInput,
) -> Result<ActionOutcome, ToolError> {
    let content = ws.read_to_string(&input.path).await?;
    let patterns = symbol_patterns(&input.path);

    let mut symbols = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for (regex, group) in &patterns {
            if let Some(captures) = regex.captures(line) {
                let kind = captures.get(1).map(|m| m.as_str()).unwrap_or("symbol");
                let name = captures.get(*group).map(|m| m.as_str()).unwrap_or("");
                if !name.is_empty() {
                    symbols.push(json!({
                        "name": name,
                        "kind": normalize_kind(kind),
                        "line": idx + 1,
                    }));
                }
                break;
            }
        }
    }

    Ok(ActionOutcome::data(json!({"symbols": symbols})))
}

pub(crate) async fn analyze_dependencies(
    ws: &Workspace,
    input: PathInput,
) -> Result<ActionOutcome, ToolError> {
    let content = ws.read_to_string(&input.path).await?;
    let patterns = [
        Regex::new(r#"^\s*import\s+.*?\s+from\s+["'](.+?)["']"#).expect("import-from pattern"),
        Regex::new(r"^\s*from\s+([A-Za-z0-9_.]+)\s+import\s").expect("from-import pattern"),
        Regex::new(r#"require\(["'](.+?)["']\)"#).expect("require pattern"),
        Regex::new(r"^\s*use\s+([A-Za-z0-9_:]+)").expect("use pattern"),
        Regex::new(r"^\s*import\s+([A-Za-z0-9_.]+)\s*$").expect("plain import pattern"),
    ];

    let mut dependencies = Vec::new();
    for line in content.lines() {
        for pattern in &patterns {
            if let Some(captures) = pattern.captures(line) {
                if let Some(dep) = captures.get(1) {
                    dependencies.push(dep.as_str().to_string());
                }
                break;
            }
        }
        if dependencies.len() >= 80 {
            break;
        }
    }

    Ok(ActionOutcome::data(json!({
        "path": input.path,
        "dependencies": dependencies,
        "dependency_count": dependencies.len(),
    })))
}

pub(crate) fn summarize_context(history: &[ActionRecord]) -> ActionOutcome {
    let completed = history
        .iter()
        .filter(|r| r.status == ActionStatus::Completed)
        .count();
    let failed = history
        .iter()
        .filter(|r| matches!(r.status, ActionStatus::Failed | ActionStatus::Blocked))
        .count();
    let recent: Vec<String> = history
        .iter()
        .rev()
        .take(10)
        .rev()
        .map(|r| format!("{}={:?}", r.action_type.as_str(), r.status))
        .collect();
    let summary = format!(
        "{} actions executed ({completed} completed, {failed} failed); recent: {}",
        history.len(),
        recent.join(", ")
    );
    ActionOutcome::data(json!({
        "summary": summary,
        "history_count": history.len(),
    }))
}

pub(crate) fn propose_subplan(input: &Value) -> ActionOutcome {
    let plan = input
        .get("plan")
        .cloned()
        .or_else(|| input.get("steps").cloned())
        .unwrap_or_else(|| json!([]));
    ActionOutcome::data(json!({"plan": plan}))
}

pub(crate) fn validate_result(input: ValidateInput, history: &[ActionRecord]) -> ActionOutcome {
    let failures: Vec<String> = history
        .iter()
        .filter(|r| matches!(r.status, ActionStatus::Failed | ActionStatus::Blocked))
        .rev()
        .take(10)
        .map(|r| {
            format!(
                "{}:{}: {}",
                r.action_id,
                r.action_type.as_str(),
                r.error.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    ActionOutcome::data(json!({
        "passed": failures.is_empty(),
        "failures": failures,
        "criteria": input.criteria,
    }))
}

fn is_ignored(rel_path: &str) -> bool {
    if rel_path
        .split('/')
        .any(|part| IGNORED_DIRS.contains(&part))
    {
        return true;
    }
    let ext = rel_path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    BINARY_EXTS.contains(&ext.as_str())
}

fn truncate_content(content: &str, max_chars: usize) -> (String, bool) {
    let mut out = String::new();
    let mut truncated = false;
    for (count, ch) in content.chars().enumerate() {
        if count >= max_chars || out.len() + ch.len_utf8() > MAX_READ_BYTES {
            truncated = true;
            break;
        }
        out.push(ch);
    }
    (out, truncated)
}

fn symbol_patterns(path: &str) -> Vec<(Regex, usize)> {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "rs" => vec![(
            Regex::new(
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(fn|struct|enum|trait)\s+([A-Za-z_][A-Za-z0-9_]*)",
            )
            .expect("rust symbol pattern"),
            2,
        )],
        "py" => vec![(
            Regex::new(r"^\s*(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)").expect("python symbol pattern"),
            2,
        )],
        "js" | "jsx" | "ts" | "tsx" => vec![(
            Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(function|class)\s+([A-Za-z_$][\w$]*)")
                .expect("js symbol pattern"),
            2,
        )],
        _ => vec![(
            Regex::new(r"^\s*(def|class|function|fn)\s+([A-Za-z_][\w]*)")
                .expect("generic symbol pattern"),
            2,
        )],
    }
}

fn normalize_kind(raw: &str) -> &'static str {
    match raw {
        "def" | "fn" | "function" => "function",
        "class" => "class",
        "struct" => "struct",
        "enum" => "enum",
        "trait" => "trait",
        _ => "symbol",
    }
}
