/// Editor language id for a file name, keyed by extension.
pub fn language_for(path: &str) -> &'static str {
    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "jsx" => "javascriptreact",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        "json" => "json",
        "md" => "markdown",
        "yaml" | "yml" => "yaml",
        "xml" => "xml",
        "sql" => "sql",
        "sh" | "bash" => "shell",
        "go" => "go",
        "rs" => "rust",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "dart" => "dart",
        "vue" => "vue",
        "svelte" => "svelte",
        "toml" => "toml",
        "ini" => "ini",
        "env" => "dotenv",
        "txt" => "plaintext",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::language_for;

    #[test]
    fn maps_common_extensions() {
        assert_eq!(language_for("src/main.rs"), "rust");
        assert_eq!(language_for("app.tsx"), "typescriptreact");
        assert_eq!(language_for("notes.md"), "markdown");
        assert_eq!(language_for("Makefile"), "plaintext");
    }
}
