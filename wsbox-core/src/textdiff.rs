//! Line-oriented unified diffs for text files.

use std::fmt::Write;

use hashbrown::HashMap;
use serde::Serialize;

/// Beyond this many edits the middle of the file is reported as one
/// replacement instead of a minimal edit script.
const MAX_EDIT_DISTANCE: usize = 2_000;

/// Options for diff generation.
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Number of context lines around changes.
    pub context_lines: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { context_lines: 3 }
    }
}

/// A diff hunk with metadata for old/new ranges.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiffHunk {
    /// Starting line (1-based) in the original content.
    pub old_start: usize,
    pub old_lines: usize,
    /// Starting line (1-based) in the new content.
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineKind {
    Context,
    Addition,
    Deletion,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    pub old_line: Option<usize>,
    pub new_line: Option<usize>,
    /// The line text, including its trailing newline when present.
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TextDiff {
    pub hunks: Vec<DiffHunk>,
    pub additions: usize,
    pub deletions: usize,
}

impl TextDiff {
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Render as unified diff text with `--- old_label` / `+++ new_label` headers.
    pub fn unified(&self, old_label: &str, new_label: &str) -> String {
        if self.hunks.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "--- {old_label}");
        let _ = writeln!(out, "+++ {new_label}");
        for hunk in &self.hunks {
            let _ = writeln!(
                out,
                "@@ -{} +{} @@",
                range(hunk.old_start, hunk.old_lines),
                range(hunk.new_start, hunk.new_lines)
            );
            for line in &hunk.lines {
                out.push(match line.kind {
                    DiffLineKind::Addition => '+',
                    DiffLineKind::Deletion => '-',
                    DiffLineKind::Context => ' ',
                });
                out.push_str(&line.text);
                if !line.text.ends_with('\n') {
                    out.push_str("\n\\ No newline at end of file\n");
                }
            }
        }
        out
    }
}

fn range(start: usize, len: usize) -> String {
    if len == 1 {
        start.to_string()
    } else {
        format!("{start},{len}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal,
    Delete,
    Insert,
}

/// Compute the line diff between `old` and `new`.
pub fn diff_lines(old: &str, new: &str, options: DiffOptions) -> TextDiff {
    let old_lines: Vec<&str> = old.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new.split_inclusive('\n').collect();
    let (old_ids, new_ids) = intern(&old_lines, &new_lines);

    let edits = edit_script(&old_ids, &new_ids);
    let records = line_records(&edits, &old_lines, &new_lines);
    let additions = records
        .iter()
        .filter(|r| r.kind == DiffLineKind::Addition)
        .count();
    let deletions = records
        .iter()
        .filter(|r| r.kind == DiffLineKind::Deletion)
        .count();
    let hunks = if additions + deletions == 0 {
        Vec::new()
    } else {
        build_hunks(&records, options.context_lines)
    };

    TextDiff {
        hunks,
        additions,
        deletions,
    }
}

fn intern<'a>(old: &[&'a str], new: &[&'a str]) -> (Vec<u32>, Vec<u32>) {
    fn ids<'a>(lines: &[&'a str], table: &mut HashMap<&'a str, u32>) -> Vec<u32> {
        lines
            .iter()
            .map(|line| {
                let next = table.len() as u32;
                *table.entry(*line).or_insert(next)
            })
            .collect()
    }
    let mut table = HashMap::new();
    let old_ids = ids(old, &mut table);
    let new_ids = ids(new, &mut table);
    (old_ids, new_ids)
}

/// Trim the common prefix and suffix, then run Myers on what is left.
fn edit_script(old: &[u32], new: &[u32]) -> Vec<Edit> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut edits = vec![Edit::Equal; prefix];
    match myers(old_mid, new_mid) {
        Some(middle) => edits.extend(middle),
        None => {
            edits.extend(std::iter::repeat_n(Edit::Delete, old_mid.len()));
            edits.extend(std::iter::repeat_n(Edit::Insert, new_mid.len()));
        }
    }
    edits.extend(std::iter::repeat_n(Edit::Equal, suffix));
    edits
}

/// Myers' O((N+M)D) shortest edit script. Returns `None` when the edit
/// distance exceeds [`MAX_EDIT_DISTANCE`].
fn myers(old: &[u32], new: &[u32]) -> Option<Vec<Edit>> {
    let n = old.len() as isize;
    let m = new.len() as isize;
    if n == 0 || m == 0 {
        let mut edits = vec![Edit::Delete; old.len()];
        edits.extend(std::iter::repeat_n(Edit::Insert, new.len()));
        return Some(edits);
    }

    let max = (n + m) as usize;
    let limit = max.min(MAX_EDIT_DISTANCE) as isize;
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    // trace[d] holds v (for diagonals -(d+1)..=d+1) as it was before round d.
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let at = |k: isize| (k + offset) as usize;

    let mut found = false;
    'rounds: for d in 0..=limit {
        trace.push(v[at(-d - 1)..=at(d + 1)].to_vec());
        let mut k = -d;
        while k <= d {
            let mut x = if k == -d || (k != d && v[at(k - 1)] < v[at(k + 1)]) {
                v[at(k + 1)]
            } else {
                v[at(k - 1)] + 1
            };
            let mut y = x - k;
            while x < n && y < m && old[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            v[at(k)] = x;
            if x >= n && y >= m {
                found = true;
                break 'rounds;
            }
            k += 2;
        }
    }
    if !found {
        return None;
    }

    let mut edits = Vec::with_capacity(max);
    let (mut x, mut y) = (n, m);
    for (d, row) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let get = |k: isize| row[(k + d + 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && get(k - 1) < get(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = get(prev_k);
        let prev_y = prev_x - prev_k;
        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal);
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit::Insert);
                y -= 1;
            } else {
                edits.push(Edit::Delete);
                x -= 1;
            }
        }
    }
    edits.reverse();
    Some(edits)
}

#[derive(Debug)]
struct LineRecord<'a> {
    kind: DiffLineKind,
    old_line: Option<usize>,
    new_line: Option<usize>,
    text: &'a str,
    /// Line numbers on both sides just before this record.
    anchor_old: usize,
    anchor_new: usize,
}

fn line_records<'a>(edits: &[Edit], old: &[&'a str], new: &[&'a str]) -> Vec<LineRecord<'a>> {
    let mut records = Vec::with_capacity(edits.len());
    let (mut oi, mut ni) = (0usize, 0usize);
    for edit in edits {
        let (anchor_old, anchor_new) = (oi, ni);
        let record = match edit {
            Edit::Equal => {
                oi += 1;
                ni += 1;
                LineRecord {
                    kind: DiffLineKind::Context,
                    old_line: Some(oi),
                    new_line: Some(ni),
                    text: old[oi - 1],
                    anchor_old,
                    anchor_new,
                }
            }
            Edit::Delete => {
                oi += 1;
                LineRecord {
                    kind: DiffLineKind::Deletion,
                    old_line: Some(oi),
                    new_line: None,
                    text: old[oi - 1],
                    anchor_old,
                    anchor_new,
                }
            }
            Edit::Insert => {
                ni += 1;
                LineRecord {
                    kind: DiffLineKind::Addition,
                    old_line: None,
                    new_line: Some(ni),
                    text: new[ni - 1],
                    anchor_old,
                    anchor_new,
                }
            }
        };
        records.push(record);
    }
    records
}

fn compute_hunk_ranges(records: &[LineRecord<'_>], context: usize) -> Vec<(usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if record.kind == DiffLineKind::Context {
            continue;
        }
        let start = index.saturating_sub(context);
        let end = (index + context).min(records.len() - 1);
        match ranges.last_mut() {
            Some(last) if start <= last.1 + 1 => last.1 = last.1.max(end),
            _ => ranges.push((start, end)),
        }
    }
    ranges
}

fn build_hunks(records: &[LineRecord<'_>], context: usize) -> Vec<DiffHunk> {
    compute_hunk_ranges(records, context)
        .into_iter()
        .map(|(start, end)| {
            let slice = &records[start..=end];
            let old_lines = slice
                .iter()
                .filter(|r| r.kind != DiffLineKind::Addition)
                .count();
            let new_lines = slice
                .iter()
                .filter(|r| r.kind != DiffLineKind::Deletion)
                .count();
            // An empty side points at the line before the hunk, as `diff -u` does.
            let old_start = if old_lines == 0 {
                slice[0].anchor_old
            } else {
                slice[0].anchor_old + 1
            };
            let new_start = if new_lines == 0 {
                slice[0].anchor_new
            } else {
                slice[0].anchor_new + 1
            };
            DiffHunk {
                old_start,
                old_lines,
                new_start,
                new_lines,
                lines: slice
                    .iter()
                    .map(|record| DiffLine {
                        kind: record.kind,
                        old_line: record.old_line,
                        new_line: record.new_line,
                        text: record.text.to_string(),
                    })
                    .collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identical_inputs_have_no_hunks() {
        let diff = diff_lines("a\nb\n", "a\nb\n", DiffOptions::default());
        assert!(diff.is_empty());
        assert_eq!(diff.unified("a/x", "b/x"), "");
    }

    #[test]
    fn single_line_change_renders_unified_text() {
        let old = "one\ntwo\nthree\nfour\nfive\nsix\nseven\n";
        let new = "one\ntwo\nthree\nFOUR\nfive\nsix\nseven\n";
        let diff = diff_lines(old, new, DiffOptions::default());
        assert_eq!((diff.additions, diff.deletions), (1, 1));
        assert_eq!(
            diff.unified("a/f.txt", "b/f.txt"),
            "--- a/f.txt\n+++ b/f.txt\n@@ -1,7 +1,7 @@\n one\n two\n three\n-four\n+FOUR\n five\n six\n seven\n"
        );
    }

    #[test]
    fn new_file_starts_at_zero() {
        let diff = diff_lines("", "hello\nworld\n", DiffOptions::default());
        let hunk = &diff.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines), (0, 0));
        assert_eq!((hunk.new_start, hunk.new_lines), (1, 2));
        assert!(diff.unified("/dev/null", "b/new").contains("@@ -0,0 +1,2 @@"));
    }

    #[test]
    fn distant_changes_split_into_hunks() {
        let old: String = (1..=20).map(|i| format!("line {i}\n")).collect();
        let new = old
            .replace("line 2\n", "line two\n")
            .replace("line 18\n", "line eighteen\n");
        let diff = diff_lines(&old, &new, DiffOptions::default());
        assert_eq!(diff.hunks.len(), 2);
        assert_eq!(diff.hunks[0].old_start, 1);
        assert_eq!(diff.hunks[1].old_start, 15);
        assert_eq!(diff.hunks[1].old_lines, 6);
    }

    #[test]
    fn missing_trailing_newline_is_flagged() {
        let diff = diff_lines("a\n", "a\nb", DiffOptions::default());
        let text = diff.unified("a/f", "b/f");
        assert!(text.ends_with("+b\n\\ No newline at end of file\n"));
    }

    #[test]
    fn myers_finds_minimal_script() {
        let edits = myers(&[1, 2, 3, 1, 2, 2, 1], &[3, 2, 1, 2, 1, 3]).unwrap_or_default();
        let changes = edits.iter().filter(|e| **e != Edit::Equal).count();
        assert_eq!(changes, 5);
    }
}
