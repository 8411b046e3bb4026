//! Strict unified-diff parsing and application.
//!
//! Accepts the usual `git diff` / `diff -u` output, possibly spanning several
//! files:
//!
//! ```text
//! diff --git a/configure.ac b/configure.ac
//! --- a/configure.ac
//! +++ b/configure.ac
//! @@ -41,3 +41,4 @@
//!  case "$host_cpu" in
//! +  riscv64*) arch=riscv64 ;;
//!    x86_64*) arch=x86_64 ;;
//! ```
//!
//! Hunks must match the current content exactly; there is no fuzz. A diff
//! with bare `@@` hunks and no `---`/`+++` header is treated as a single block
//! for whatever file the caller names.

use thiserror::Error;

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("patch parse error: {0}")]
    ParseError(String),
    #[error("hunk apply error at line {line}: {message}")]
    HunkApplyError { line: usize, message: String },
    #[error("patch contains no hunks")]
    Empty,
}

/// One `---`/`+++` block of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` when the old side is `/dev/null` (file creation).
    pub old_path: Option<String>,
    /// `None` when the new side is `/dev/null` (file deletion).
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    /// Path the block edits, preferring the new side.
    pub fn target(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub orig_start: usize,
    pub orig_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Lines with their diff prefix: ' ' (context), '-' (remove), '+' (add).
    pub lines: Vec<(char, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    pub patched: String,
    pub hunks_applied: usize,
    pub lines_changed: i64,
}

/// Split a patch into per-file blocks.
///
/// Headerless input yields a single block with both paths unset to `Some("")`
/// so callers can bind it to their own target.
pub fn parse_patch(diff: &str) -> Result<Vec<FilePatch>, DiffError> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    let has_headers = lines.iter().any(|l| l.starts_with("--- "));
    if !has_headers {
        let hunks = parse_hunks(&lines)?;
        if hunks.is_empty() {
            return Err(DiffError::Empty);
        }
        return Ok(vec![FilePatch {
            old_path: Some(String::new()),
            new_path: Some(String::new()),
            hunks,
        }]);
    }

    while i < lines.len() {
        if !lines[i].starts_with("--- ") {
            i += 1;
            continue;
        }
        let old_tok = header_path(&lines[i][4..]);
        i += 1;
        let new_line = lines
            .get(i)
            .filter(|l| l.starts_with("+++ "))
            .ok_or_else(|| {
                DiffError::ParseError(format!("line {}: expected '+++' after '---'", i + 1))
            })?;
        let new_tok = header_path(&new_line[4..]);
        i += 1;

        let start = i;
        while i < lines.len() && !lines[i].starts_with("--- ") && !lines[i].starts_with("diff --git")
        {
            i += 1;
        }
        let hunks = parse_hunks(&lines[start..i]).map_err(|e| match e {
            DiffError::ParseError(msg) => DiffError::ParseError(format!("{msg} (block {new_tok})")),
            other => other,
        })?;

        blocks.push(FilePatch {
            old_path: strip_side(&old_tok, "a/"),
            new_path: strip_side(&new_tok, "b/"),
            hunks,
        });
    }

    if blocks.iter().all(|b| b.hunks.is_empty()) {
        return Err(DiffError::Empty);
    }
    Ok(blocks)
}

/// Drop a trailing `\t<timestamp>` that `diff -u` appends.
fn header_path(raw: &str) -> String {
    raw.split('\t').next().unwrap_or(raw).trim().to_string()
}

fn strip_side(tok: &str, prefix: &str) -> Option<String> {
    if tok == DEV_NULL {
        return None;
    }
    Some(tok.strip_prefix(prefix).unwrap_or(tok).to_string())
}

fn parse_hunks(lines: &[&str]) -> Result<Vec<Hunk>, DiffError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for (lineno, line) in lines.iter().enumerate() {
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            let ((orig_start, orig_count), (new_start, new_count)) = parse_hunk_header(line)
                .map_err(|e| DiffError::ParseError(format!("line {}: {}", lineno + 1, e)))?;
            current = Some(Hunk {
                orig_start,
                orig_count,
                new_start,
                new_count,
                lines: Vec::new(),
            });
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
            continue;
        } else if let Some(ref mut hunk) = current {
            if let Some(stripped) = line.strip_prefix('-') {
                hunk.lines.push(('-', stripped.to_string()));
            } else if let Some(stripped) = line.strip_prefix('+') {
                hunk.lines.push(('+', stripped.to_string()));
            } else {
                let stripped = line.strip_prefix(' ').unwrap_or(line);
                hunk.lines.push((' ', stripped.to_string()));
            }
        }
    }

    if let Some(h) = current {
        hunks.push(h);
    }
    Ok(hunks)
}

type Range = (usize, usize);

fn parse_hunk_header(header: &str) -> Result<(Range, Range), String> {
    // @@ -L[,N] +L[,N] @@[ label]
    let inner = header
        .split("@@")
        .nth(1)
        .ok_or_else(|| "malformed hunk header".to_string())?
        .trim();

    let parts: Vec<&str> = inner.split_whitespace().collect();
    if parts.len() < 2 || !parts[0].starts_with('-') || !parts[1].starts_with('+') {
        return Err(format!("bad hunk header: {header}"));
    }

    Ok((parse_range(&parts[0][1..])?, parse_range(&parts[1][1..])?))
}

fn parse_range(s: &str) -> Result<Range, String> {
    match s.split_once(',') {
        Some((start, count)) => Ok((
            start
                .parse()
                .map_err(|e| format!("bad line number '{start}': {e}"))?,
            count.parse().map_err(|e| format!("bad count '{count}': {e}"))?,
        )),
        None => Ok((
            s.parse().map_err(|e| format!("bad line number '{s}': {e}"))?,
            1,
        )),
    }
}

/// Apply `hunks` to `original`, in order, with exact context matching.
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<PatchResult, DiffError> {
    let mut result: Vec<String> = original.lines().map(str::to_string).collect();
    let mut offset: i64 = 0;
    let mut total_changed: i64 = 0;

    for hunk in hunks {
        // A zero-length original range addresses the line *after* orig_start.
        let anchor = if hunk.orig_count == 0 {
            hunk.orig_start as i64
        } else {
            hunk.orig_start as i64 - 1
        };
        let start = (anchor + offset).max(0) as usize;

        let expected: Vec<&str> = hunk
            .lines
            .iter()
            .filter(|(op, _)| *op == ' ' || *op == '-')
            .map(|(_, c)| c.as_str())
            .collect();

        for (i, &want) in expected.iter().enumerate() {
            let idx = start + i;
            match result.get(idx) {
                None => {
                    return Err(DiffError::HunkApplyError {
                        line: idx + 1,
                        message: format!(
                            "file has {} lines but hunk expects line {}",
                            result.len(),
                            idx + 1
                        ),
                    })
                }
                Some(found) if found != want => {
                    return Err(DiffError::HunkApplyError {
                        line: idx + 1,
                        message: format!("context mismatch: expected {want:?}, found {found:?}"),
                    })
                }
                Some(_) => {}
            }
        }

        let replacement: Vec<String> = hunk
            .lines
            .iter()
            .filter(|(op, _)| *op == ' ' || *op == '+')
            .map(|(_, c)| c.clone())
            .collect();

        if start > result.len() {
            return Err(DiffError::HunkApplyError {
                line: start + 1,
                message: format!("hunk starts past end of file ({} lines)", result.len()),
            });
        }
        let span = expected.len();
        let delta = replacement.len() as i64 - span as i64;
        result.splice(start..start + span, replacement);

        offset += delta;
        total_changed += hunk.lines.iter().filter(|(op, _)| *op != ' ').count() as i64;
    }

    let mut patched = result.join("\n");
    if (original.ends_with('\n') || original.is_empty()) && !patched.is_empty() {
        patched.push('\n');
    }

    Ok(PatchResult {
        patched,
        hunks_applied: hunks.len(),
        lines_changed: total_changed,
    })
}
