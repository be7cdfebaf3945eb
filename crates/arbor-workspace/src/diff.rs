use similar::{ChangeTag, TextDiff};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    Malformed(String),
    #[error("hunk does not apply at line {line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line: usize,
        expected: String,
        found: String,
    },
}

/// Unified diff between two versions of a file, `a/{path}` → `b/{path}`,
/// three lines of context per hunk.
pub fn unified_diff(old_content: &str, new_content: &str, path: &str) -> String {
    let diff = TextDiff::from_lines(old_content, new_content);

    let mut output = format!("--- a/{}\n+++ b/{}\n", path, path);

    for (idx, group) in diff.grouped_ops(3).iter().enumerate() {
        if idx > 0 {
            output.push('\n');
        }

        let (old_start, old_count, new_start, new_count) = group.iter().fold(
            (usize::MAX, 0usize, usize::MAX, 0usize),
            |(os, oc, ns, nc), op| {
                let old_range = op.old_range();
                let new_range = op.new_range();
                (
                    os.min(old_range.start),
                    oc + old_range.len(),
                    ns.min(new_range.start),
                    nc + new_range.len(),
                )
            },
        );

        output.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            if old_count == 0 { old_start } else { old_start + 1 },
            old_count,
            if new_count == 0 { new_start } else { new_start + 1 },
            new_count
        ));

        for op in group {
            for change in diff.iter_changes(op) {
                let prefix = match change.tag() {
                    ChangeTag::Delete => "-",
                    ChangeTag::Insert => "+",
                    ChangeTag::Equal => " ",
                };
                output.push_str(prefix);
                output.push_str(change.value());
                if !change.value().ends_with('\n') {
                    output.push('\n');
                }
            }
        }
    }

    output
}

struct Hunk {
    old_start: usize,
    old_count: usize,
    lines: Vec<(char, String)>,
}

/// Apply a unified diff to the original content. Context and deletion lines
/// must match the original exactly.
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    if hunks.is_empty() {
        return Err(PatchError::Malformed("no hunks found".to_string()));
    }

    let src: Vec<&str> = if original.is_empty() {
        Vec::new()
    } else {
        original.lines().collect()
    };

    let mut out: Vec<String> = Vec::new();
    let mut src_idx = 0usize;

    for hunk in &hunks {
        // An empty old side (`-N,0`) inserts after line N.
        let anchor = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if anchor < src_idx || anchor > src.len() {
            return Err(PatchError::Malformed(format!(
                "hunk start {} out of order",
                hunk.old_start
            )));
        }
        while src_idx < anchor {
            out.push(src[src_idx].to_string());
            src_idx += 1;
        }

        for (tag, text) in &hunk.lines {
            match tag {
                ' ' | '-' => {
                    let found = src.get(src_idx).copied().unwrap_or("<eof>");
                    if found != text {
                        return Err(PatchError::ContextMismatch {
                            line: src_idx + 1,
                            expected: text.clone(),
                            found: found.to_string(),
                        });
                    }
                    if *tag == ' ' {
                        out.push(text.clone());
                    }
                    src_idx += 1;
                }
                '+' => out.push(text.clone()),
                _ => {}
            }
        }
    }

    while src_idx < src.len() {
        out.push(src[src_idx].to_string());
        src_idx += 1;
    }

    let mut result = out.join("\n");
    let keep_trailing_newline =
        original.ends_with('\n') || (original.is_empty() && !result.is_empty());
    if keep_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("@@ ") {
            let header = rest
                .split(" @@")
                .next()
                .ok_or_else(|| PatchError::Malformed(format!("bad hunk header: {line}")))?;
            let mut parts = header.split_whitespace();
            let old = parts
                .next()
                .and_then(|p| p.strip_prefix('-'))
                .ok_or_else(|| PatchError::Malformed(format!("bad hunk header: {line}")))?;
            let (old_start, old_count) = parse_range(old)
                .ok_or_else(|| PatchError::Malformed(format!("bad hunk range: {line}")))?;
            hunks.push(Hunk {
                old_start,
                old_count,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            return Err(PatchError::Malformed(format!(
                "content before first hunk: {line}"
            )));
        };
        let mut chars = line.chars();
        match chars.next() {
            Some(tag @ (' ' | '-' | '+')) => hunk.lines.push((tag, chars.collect())),
            // "\ No newline at end of file"
            Some('\\') => {}
            Some(_) | None => {
                return Err(PatchError::Malformed(format!("bad hunk line: {line}")))
            }
        }
    }
    Ok(hunks)
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
