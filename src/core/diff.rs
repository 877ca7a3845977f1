//! Line diff engine.
//!
//! Computes line-level diffs between two text blobs, grouped into hunks
//! with bounded unchanged context, plus the synthesized whole-file forms
//! used for creations and deletions. Content for assistant code blocks is
//! resolved here too (complete-file replacement or line-range splice).
//!
//! Inputs are always normalized to LF before comparison; the proposed text
//! carried on a [`DiffResult`] is the normalized form, and the apply layer
//! re-styles line endings when it writes.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};

use crate::infra::fsx::Filesystem;
use crate::infra::io::normalize_newlines;

/// Diff generation options.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Unchanged lines kept on each side of a hunk.
    pub context_lines: usize,
    /// A run of unchanged lines at least this long closes the open hunk.
    /// Zero derives `2 * context_lines` (minimum 1).
    pub separation_threshold: usize,
    /// Trim trailing whitespace per line before comparing.
    pub trim_trailing_whitespace: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context_lines: 3,
            separation_threshold: 0,
            trim_trailing_whitespace: false,
        }
    }
}

impl DiffOptions {
    fn separation(&self) -> usize {
        if self.separation_threshold > 0 {
            self.separation_threshold
        } else {
            (self.context_lines * 2).max(1)
        }
    }
}

/// Classification of one line within a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffLineKind {
    Added,
    Removed,
    /// Reserved for hosts that post-process Removed/Added pairs; the line
    /// alignment itself never emits this.
    Modified,
    Unchanged,
}

/// One line of a hunk with its position on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    /// 1-based line number in the original, when the line exists there.
    pub old_line: Option<usize>,
    /// 1-based line number in the proposed text, when the line exists there.
    pub new_line: Option<usize>,
    pub text: String,
}

/// A contiguous run of changes plus bounded context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Zero-based position of this hunk within the diff.
    pub index: usize,
    pub lines: Vec<DiffLine>,
}

/// Aggregate line tallies over the whole diff (not just hunk-covered lines).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

/// Immutable result of a diff computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub path: PathBuf,
    /// Original content, LF-normalized ("" for new files).
    pub original: String,
    /// Proposed content, LF-normalized ("" for deletions).
    pub proposed: String,
    pub hunks: Vec<DiffHunk>,
    pub stats: DiffStats,
    pub is_new_file: bool,
    pub is_delete_file: bool,
    pub is_binary: bool,
    /// Id of the source code block, when one produced this diff.
    pub block_id: Option<String>,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !self.hunks.is_empty()
    }
}

/// Assistant-proposed content for one target path. Produced by the host's
/// block classifier; the engine only consumes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBlock {
    pub id: Option<String>,
    /// Workspace-relative target path.
    pub target_path: PathBuf,
    pub content: String,
    /// The producer marked this block as a full replacement of the file.
    pub complete_file: bool,
    /// Inclusive 1-based line range this block replaces, when explicit.
    pub line_range: Option<(usize, usize)>,
}

/// Diff engine failures. Range errors are programming errors on the
/// producer side and are signaled, not clamped (except the end bound).
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("invalid line range {start}-{end} for file with {file_lines} lines")]
    InvalidRange {
        start: usize,
        end: usize,
        file_lines: usize,
    },

    #[error("no code blocks to merge")]
    NoBlocks,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Normalize a blob for comparison: CRLF/CR to LF, optional per-line
/// trailing-whitespace trim.
fn normalize(text: &str, opts: &DiffOptions) -> String {
    let lf = normalize_newlines(text);
    if !opts.trim_trailing_whitespace {
        return lf;
    }

    let had_final_nl = lf.ends_with('\n');
    let mut out = lf
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    if had_final_nl {
        out.push('\n');
    }
    out
}

/// Compute a line-level diff between two blobs.
pub fn compute_diff(original: &str, proposed: &str, path: &Path, opts: &DiffOptions) -> DiffResult {
    // Binary inputs are flagged, never diffed line-wise.
    if original.contains('\0') || proposed.contains('\0') {
        return DiffResult {
            path: path.to_path_buf(),
            original: original.to_string(),
            proposed: proposed.to_string(),
            hunks: Vec::new(),
            stats: DiffStats::default(),
            is_new_file: false,
            is_delete_file: false,
            is_binary: true,
            block_id: None,
        };
    }

    let original = normalize(original, opts);
    let proposed = normalize(proposed, opts);

    // Identity short-circuit: equal after normalization means no hunks.
    if original == proposed {
        let unchanged = original.lines().count();
        return DiffResult {
            path: path.to_path_buf(),
            original,
            proposed,
            hunks: Vec::new(),
            stats: DiffStats {
                unchanged,
                ..DiffStats::default()
            },
            is_new_file: false,
            is_delete_file: false,
            is_binary: false,
            block_id: None,
        };
    }

    let diff = TextDiff::from_lines(original.as_str(), proposed.as_str());

    let mut stats = DiffStats::default();
    let mut all_lines = Vec::new();

    for change in diff.iter_all_changes() {
        let kind = match change.tag() {
            ChangeTag::Equal => DiffLineKind::Unchanged,
            ChangeTag::Delete => DiffLineKind::Removed,
            ChangeTag::Insert => DiffLineKind::Added,
        };

        match kind {
            DiffLineKind::Added => stats.added += 1,
            DiffLineKind::Removed => stats.removed += 1,
            DiffLineKind::Modified => stats.modified += 1,
            DiffLineKind::Unchanged => stats.unchanged += 1,
        }

        all_lines.push(DiffLine {
            kind,
            old_line: change.old_index().map(|i| i + 1),
            new_line: change.new_index().map(|i| i + 1),
            text: change.value().trim_end_matches('\n').to_string(),
        });
    }

    let hunks = group_into_hunks(all_lines, opts);

    DiffResult {
        path: path.to_path_buf(),
        original,
        proposed,
        hunks,
        stats,
        is_new_file: false,
        is_delete_file: false,
        is_binary: false,
        block_id: None,
    }
}

/// Group the full interleaved line stream into hunks.
///
/// A hunk opens on the first changed line, keeps up to `context_lines`
/// unchanged lines on each side, and closes once an unchanged run reaches
/// the separation threshold.
fn group_into_hunks(all_lines: Vec<DiffLine>, opts: &DiffOptions) -> Vec<DiffHunk> {
    let ctx = opts.context_lines;
    let sep = opts.separation();

    let mut hunks: Vec<DiffHunk> = Vec::new();
    let mut current: Vec<DiffLine> = Vec::new();
    // Unchanged lines seen since the last changed line. While no hunk is
    // open only the trailing `ctx` are worth keeping.
    let mut pending: Vec<DiffLine> = Vec::new();

    for line in all_lines {
        if line.kind == DiffLineKind::Unchanged {
            pending.push(line);

            if current.is_empty() {
                if pending.len() > ctx {
                    pending.remove(0);
                }
            } else if pending.len() >= sep {
                // Close the open hunk with trailing context trimmed to ctx.
                current.extend(pending.drain(..ctx.min(sep)));
                push_hunk(&mut hunks, std::mem::take(&mut current));
                // The leftover run only matters as leading context now.
                if pending.len() > ctx {
                    pending.drain(..pending.len() - ctx);
                }
            }
        } else {
            // Changed line: everything pending becomes interior/leading
            // context of the (possibly new) hunk.
            current.append(&mut pending);
            current.push(line);
        }
    }

    if !current.is_empty() {
        let trailing = ctx.min(pending.len());
        current.extend(pending.drain(..trailing));
        push_hunk(&mut hunks, current);
    }

    hunks
}

fn push_hunk(hunks: &mut Vec<DiffHunk>, lines: Vec<DiffLine>) {
    let old_start = lines.iter().find_map(|l| l.old_line).unwrap_or(0);
    let new_start = lines.iter().find_map(|l| l.new_line).unwrap_or(0);
    let old_count = lines.iter().filter(|l| l.old_line.is_some()).count();
    let new_count = lines.iter().filter(|l| l.new_line.is_some()).count();

    let index = hunks.len();
    hunks.push(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        index,
        lines,
    });
}

/// Synthesize the diff for a file that does not exist yet: one hunk of
/// all-Added lines.
pub fn new_file_diff(proposed: &str, path: &Path, opts: &DiffOptions) -> DiffResult {
    let proposed = normalize(proposed, opts);

    let lines: Vec<DiffLine> = proposed
        .lines()
        .enumerate()
        .map(|(i, text)| DiffLine {
            kind: DiffLineKind::Added,
            old_line: None,
            new_line: Some(i + 1),
            text: text.to_string(),
        })
        .collect();

    let added = lines.len();
    let hunks = if lines.is_empty() {
        Vec::new()
    } else {
        vec![DiffHunk {
            old_start: 0,
            old_count: 0,
            new_start: 1,
            new_count: added,
            index: 0,
            lines,
        }]
    };

    DiffResult {
        path: path.to_path_buf(),
        original: String::new(),
        proposed,
        hunks,
        stats: DiffStats {
            added,
            ..DiffStats::default()
        },
        is_new_file: true,
        is_delete_file: false,
        is_binary: false,
        block_id: None,
    }
}

/// Synthesize the diff for a file removal: one hunk of all-Removed lines.
pub fn delete_file_diff(original: &str, path: &Path, opts: &DiffOptions) -> DiffResult {
    let original = normalize(original, opts);

    let lines: Vec<DiffLine> = original
        .lines()
        .enumerate()
        .map(|(i, text)| DiffLine {
            kind: DiffLineKind::Removed,
            old_line: Some(i + 1),
            new_line: None,
            text: text.to_string(),
        })
        .collect();

    let removed = lines.len();
    let hunks = if lines.is_empty() {
        Vec::new()
    } else {
        vec![DiffHunk {
            old_start: 1,
            old_count: removed,
            new_start: 0,
            new_count: 0,
            index: 0,
            lines,
        }]
    };

    DiffResult {
        path: path.to_path_buf(),
        original,
        proposed: String::new(),
        hunks,
        stats: DiffStats {
            removed,
            ..DiffStats::default()
        },
        is_new_file: false,
        is_delete_file: true,
        is_binary: false,
        block_id: None,
    }
}

/// Replace lines `[start, end]` (1-based, inclusive) of `original` with
/// `replacement`. `start` may be `len + 1` to append; `end` is clamped to
/// the file length. Any other out-of-range request is an error.
pub fn splice_lines(
    original: &str,
    start: usize,
    end: usize,
    replacement: &str,
) -> Result<String, DiffError> {
    let normalized = normalize_newlines(original);
    let had_final_nl = normalized.ends_with('\n');
    let lines: Vec<&str> = normalized.lines().collect();

    if start < 1 || start > lines.len() + 1 || end < start {
        return Err(DiffError::InvalidRange {
            start,
            end,
            file_lines: lines.len(),
        });
    }
    let end = end.min(lines.len());

    let replacement = normalize_newlines(replacement);
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend(&lines[..start - 1]);
    out.extend(replacement.lines());
    if end < lines.len() {
        out.extend(&lines[end..]);
    }

    let mut joined = out.join("\n");
    if had_final_nl && !joined.is_empty() {
        joined.push('\n');
    }
    Ok(joined)
}

/// Resolve a code block against the workspace and diff it.
///
/// Missing targets produce a new-file diff. For existing targets the
/// proposed content is a full replacement, unless the block carries an
/// explicit line range, in which case the block is spliced over that range.
pub fn diff_for_block(
    block: &CodeBlock,
    workspace_root: &Path,
    fs: &dyn Filesystem,
    opts: &DiffOptions,
) -> Result<DiffResult, DiffError> {
    let abs = workspace_root.join(&block.target_path);

    if !fs.exists(&abs) {
        let mut result = new_file_diff(&block.content, &block.target_path, opts);
        result.block_id = block.id.clone();
        return Ok(result);
    }

    let original = fs.read_to_string(&abs)?;

    let proposed = match (block.complete_file, block.line_range) {
        // Complete-file blocks always replace, range or not.
        (true, _) | (false, None) => normalize_newlines(&block.content),
        (false, Some((start, end))) => splice_lines(&original, start, end, &block.content)?,
    };

    let mut result = compute_diff(&original, &proposed, &block.target_path, opts);
    result.block_id = block.id.clone();
    Ok(result)
}

/// Diff several blocks that target the same path, using the documented
/// tie-break: the last complete-file block wins; otherwise the first block
/// is used. This is a deliberate simplification, not a merge.
pub fn merged_diff(
    blocks: &[CodeBlock],
    workspace_root: &Path,
    fs: &dyn Filesystem,
    opts: &DiffOptions,
) -> Result<DiffResult, DiffError> {
    let chosen = blocks
        .iter()
        .rev()
        .find(|b| b.complete_file)
        .or_else(|| blocks.first())
        .ok_or(DiffError::NoBlocks)?;

    diff_for_block(chosen, workspace_root, fs, opts)
}

/// Render a diff as unified-diff text for host display.
pub fn render_unified(result: &DiffResult) -> String {
    let mut out = String::new();
    let path = result.path.display();

    if result.is_binary {
        out.push_str(&format!("Binary file {path} differs\n"));
        return out;
    }

    if result.is_new_file {
        out.push_str("--- /dev/null\n");
        out.push_str(&format!("+++ b/{path}\n"));
    } else if result.is_delete_file {
        out.push_str(&format!("--- a/{path}\n"));
        out.push_str("+++ /dev/null\n");
    } else {
        out.push_str(&format!("--- a/{path}\n"));
        out.push_str(&format!("+++ b/{path}\n"));
    }

    for hunk in &result.hunks {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
        ));
        for line in &hunk.lines {
            let prefix = match line.kind {
                DiffLineKind::Unchanged => ' ',
                DiffLineKind::Removed => '-',
                DiffLineKind::Added | DiffLineKind::Modified => '+',
            };
            out.push(prefix);
            out.push_str(&line.text);
            out.push('\n');
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::fsx::LocalFs;
    use tempfile::TempDir;

    fn opts() -> DiffOptions {
        DiffOptions::default()
    }

    #[test]
    fn single_line_replacement() {
        let result = compute_diff("a\nb\nc", "a\nX\nc", Path::new("f.txt"), &opts());

        assert_eq!(result.hunks.len(), 1);
        assert_eq!(
            result.stats,
            DiffStats {
                added: 1,
                removed: 1,
                modified: 0,
                unchanged: 2,
            }
        );

        let kinds: Vec<(DiffLineKind, &str)> = result.hunks[0]
            .lines
            .iter()
            .map(|l| (l.kind, l.text.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DiffLineKind::Unchanged, "a"),
                (DiffLineKind::Removed, "b"),
                (DiffLineKind::Added, "X"),
                (DiffLineKind::Unchanged, "c"),
            ]
        );
    }

    #[test]
    fn identity_short_circuit() {
        let result = compute_diff("a\r\nb\r\n", "a\nb\n", Path::new("f.txt"), &opts());
        assert!(!result.has_changes());
        assert_eq!(result.stats.unchanged, 2);
    }

    #[test]
    fn trailing_whitespace_option() {
        let with_trim = DiffOptions {
            trim_trailing_whitespace: true,
            ..opts()
        };
        let result = compute_diff("a  \nb\t\n", "a\nb\n", Path::new("f.txt"), &with_trim);
        assert!(!result.has_changes());

        let strict = compute_diff("a  \nb\t\n", "a\nb\n", Path::new("f.txt"), &opts());
        assert!(strict.has_changes());
    }

    #[test]
    fn distant_changes_split_into_two_hunks() {
        let original: String = (1..=30).map(|i| format!("line{i}\n")).collect();
        let proposed = original.replace("line2\n", "LINE2\n").replace("line25\n", "LINE25\n");

        let result = compute_diff(&original, &proposed, Path::new("f.txt"), &opts());
        assert_eq!(result.hunks.len(), 2);
        assert_eq!(result.hunks[0].index, 0);
        assert_eq!(result.hunks[1].index, 1);

        // Context is bounded on both sides of each hunk.
        let first = &result.hunks[0];
        let leading = first
            .lines
            .iter()
            .take_while(|l| l.kind == DiffLineKind::Unchanged)
            .count();
        let trailing = first
            .lines
            .iter()
            .rev()
            .take_while(|l| l.kind == DiffLineKind::Unchanged)
            .count();
        assert!(leading <= 3);
        assert!(trailing <= 3);
    }

    #[test]
    fn close_changes_stay_in_one_hunk() {
        let original = "a\nb\nc\nd\ne\nf\n";
        let proposed = "a\nB\nc\nd\nE\nf\n";

        let result = compute_diff(original, proposed, Path::new("f.txt"), &opts());
        assert_eq!(result.hunks.len(), 1);
    }

    #[test]
    fn new_file_has_single_added_hunk() {
        let result = new_file_diff("line1\nline2", Path::new("new.txt"), &opts());

        assert!(result.is_new_file);
        assert_eq!(result.original, "");
        assert_eq!(result.hunks.len(), 1);
        assert_eq!(result.hunks[0].new_count, 2);
        assert_eq!(result.hunks[0].old_count, 0);
        assert!(result
            .hunks[0]
            .lines
            .iter()
            .all(|l| l.kind == DiffLineKind::Added));
        assert_eq!(result.stats.added, 2);
    }

    #[test]
    fn delete_file_has_single_removed_hunk() {
        let result = delete_file_diff("one\ntwo\nthree", Path::new("gone.txt"), &opts());

        assert!(result.is_delete_file);
        assert_eq!(result.proposed, "");
        assert_eq!(result.hunks.len(), 1);
        assert_eq!(result.stats.removed, 3);
    }

    #[test]
    fn binary_content_is_flagged_not_diffed() {
        let result = compute_diff("a\0b", "c", Path::new("blob.bin"), &opts());
        assert!(result.is_binary);
        assert!(result.hunks.is_empty());
    }

    #[test]
    fn splice_replaces_inclusive_range() {
        let out = splice_lines("a\nb\nc\nd", 2, 3, "X\nY\nZ").unwrap();
        assert_eq!(out, "a\nX\nY\nZ\nd");
    }

    #[test]
    fn splice_appends_at_len_plus_one() {
        let out = splice_lines("a\nb", 3, 3, "c").unwrap();
        assert_eq!(out, "a\nb\nc");
    }

    #[test]
    fn splice_clamps_end_to_file_length() {
        let out = splice_lines("a\nb\nc", 2, 99, "X").unwrap();
        assert_eq!(out, "a\nX");
    }

    #[test]
    fn splice_rejects_bad_start_and_inverted_range() {
        assert!(matches!(
            splice_lines("a\nb", 0, 1, "X"),
            Err(DiffError::InvalidRange { .. })
        ));
        assert!(matches!(
            splice_lines("a\nb", 4, 4, "X"),
            Err(DiffError::InvalidRange { .. })
        ));
        assert!(matches!(
            splice_lines("a\nb", 2, 1, "X"),
            Err(DiffError::InvalidRange { .. })
        ));
    }

    #[test]
    fn block_against_missing_target_is_new_file() {
        let tmp = TempDir::new().unwrap();
        let fs = LocalFs;
        let block = CodeBlock {
            id: Some("blk-1".into()),
            target_path: PathBuf::from("src/new.rs"),
            content: "line1\nline2".into(),
            complete_file: false,
            line_range: None,
        };

        let result = diff_for_block(&block, tmp.path(), &fs, &opts()).unwrap();
        assert!(result.is_new_file);
        assert_eq!(result.block_id.as_deref(), Some("blk-1"));
        assert_eq!(result.stats.added, 2);
    }

    #[test]
    fn block_with_line_range_splices() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "a\nb\nc\n").unwrap();
        let fs = LocalFs;

        let block = CodeBlock {
            id: None,
            target_path: PathBuf::from("f.txt"),
            content: "B1\nB2".into(),
            complete_file: false,
            line_range: Some((2, 2)),
        };

        let result = diff_for_block(&block, tmp.path(), &fs, &opts()).unwrap();
        assert_eq!(result.proposed, "a\nB1\nB2\nc\n");
        assert_eq!(result.stats.added, 2);
        assert_eq!(result.stats.removed, 1);
    }

    #[test]
    fn merged_diff_prefers_last_complete_file_block() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "old\n").unwrap();
        let fs = LocalFs;

        let blocks = vec![
            CodeBlock {
                id: Some("first".into()),
                target_path: PathBuf::from("f.txt"),
                content: "first\n".into(),
                complete_file: true,
                line_range: None,
            },
            CodeBlock {
                id: Some("partial".into()),
                target_path: PathBuf::from("f.txt"),
                content: "partial\n".into(),
                complete_file: false,
                line_range: Some((1, 1)),
            },
            CodeBlock {
                id: Some("last-full".into()),
                target_path: PathBuf::from("f.txt"),
                content: "winner\n".into(),
                complete_file: true,
                line_range: None,
            },
        ];

        let result = merged_diff(&blocks, tmp.path(), &fs, &opts()).unwrap();
        assert_eq!(result.block_id.as_deref(), Some("last-full"));
        assert_eq!(result.proposed, "winner\n");
    }

    #[test]
    fn merged_diff_falls_back_to_first_block() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "a\nb\n").unwrap();
        let fs = LocalFs;

        let blocks = vec![
            CodeBlock {
                id: Some("one".into()),
                target_path: PathBuf::from("f.txt"),
                content: "X".into(),
                complete_file: false,
                line_range: Some((1, 1)),
            },
            CodeBlock {
                id: Some("two".into()),
                target_path: PathBuf::from("f.txt"),
                content: "Y".into(),
                complete_file: false,
                line_range: Some((2, 2)),
            },
        ];

        let result = merged_diff(&blocks, tmp.path(), &fs, &opts()).unwrap();
        assert_eq!(result.block_id.as_deref(), Some("one"));
    }

    #[test]
    fn round_trip_yields_no_changes() {
        let original = "fn main() {\n    old();\n}\n";
        let proposed = "fn main() {\n    new();\n}\n";

        let first = compute_diff(original, proposed, Path::new("m.rs"), &opts());
        let second = compute_diff(&first.proposed, proposed, Path::new("m.rs"), &opts());
        assert!(!second.has_changes());
    }

    #[test]
    fn unified_rendering_has_headers_and_markers() {
        let result = compute_diff("a\nb\nc", "a\nX\nc", Path::new("f.txt"), &opts());
        let text = render_unified(&result);

        assert!(text.contains("--- a/f.txt"));
        assert!(text.contains("+++ b/f.txt"));
        assert!(text.contains("@@ -1,3 +1,3 @@"));
        assert!(text.contains("-b"));
        assert!(text.contains("+X"));
    }
}
