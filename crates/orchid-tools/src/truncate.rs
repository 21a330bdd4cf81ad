// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic, content-aware tool-output truncation.
use crate::tool::OutputCategory;

/// Truncate `content` to at most roughly `cap_bytes`, using a
/// category-specific extraction strategy.
///
/// Returns `content` unchanged when it fits (output exactly at the cap is
/// untouched).  Dispatching on [`OutputCategory`] keeps this function
/// independent of the concrete tool list; each tool declares its own
/// category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so
///   both the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches (highest
///   relevance first).
/// - [`OutputCategory::FileContent`]: balanced head + tail window.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line
///   boundary.
///
/// Every truncated result ends with an explicit notice so the model knows
/// that additional content exists and where the full output was spilled.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_bytes: usize) -> String {
    if cap_bytes == 0 || content.len() <= cap_bytes {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_bytes);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_bytes,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_bytes,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                 use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_bytes,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                 use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = floor_char_boundary(content, cap_bytes);
            let cut = content[..cut].rfind('\n').map(|p| p + 1).unwrap_or(cut);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Largest index ≤ `at` that falls on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut i = at;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Keep only the leading lines that fit within `cap_bytes`.
fn head_lines(content: &str, cap_bytes: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_bytes);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if kept.len() + needed > cap_bytes {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..floor_char_boundary(content, cap_bytes)].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them.  Pass `usize::MAX` to split evenly by byte budget.
fn head_tail_lines(
    content: &str,
    cap_bytes: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_bytes / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_len = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = line.len() + 1;
        if tail_len + needed > half_cap {
            break;
        }
        if lines.len() - tail_lines.len() - 1 < head_count {
            // Tail would overlap the head; everything is already kept.
            break;
        }
        tail_lines.push(line);
        tail_len += needed;
    }
    tail_lines.reverse();

    let omitted = lines
        .len()
        .saturating_sub(head_count)
        .saturating_sub(tail_lines.len());
    if omitted == 0 {
        return content.to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    if tail_lines.is_empty() {
        format!("{head}\n{notice}")
    } else {
        format!("{head}\n{notice}\n{}", tail_lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_at_the_cap_is_untouched() {
        let content = "x".repeat(100);
        assert_eq!(
            smart_truncate(&content, OutputCategory::Generic, 100),
            content
        );
    }

    #[test]
    fn one_byte_over_the_cap_truncates() {
        let content = format!("{}\n{}", "a".repeat(60), "b".repeat(41));
        let out = smart_truncate(&content, OutputCategory::Generic, content.len() - 1);
        assert!(out.len() < content.len() + 100);
        assert!(out.contains("omitted"));
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let content = "y".repeat(500);
        assert_eq!(
            smart_truncate(&content, OutputCategory::Generic, 0),
            content
        );
    }

    #[test]
    fn match_list_keeps_leading_lines() {
        let content = (0..100)
            .map(|i| format!("match {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = smart_truncate(&content, OutputCategory::MatchList, 100);
        assert!(out.starts_with("match 0"));
        assert!(out.contains("more matches omitted"));
        assert!(!out.contains("match 99"));
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let content = (0..200)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = smart_truncate(&content, OutputCategory::HeadTail, 300);
        assert!(out.starts_with("line 0"));
        assert!(out.ends_with("line 199"));
        assert!(out.contains("omitted"));
    }

    #[test]
    fn file_content_keeps_head_and_tail() {
        let content = (0..300)
            .map(|i| format!("row{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = smart_truncate(&content, OutputCategory::FileContent, 200);
        assert!(out.starts_with("row0"));
        assert!(out.ends_with("row299"));
    }

    #[test]
    fn generic_cuts_at_line_boundary() {
        let content = "first line\nsecond line\nthird line\n".repeat(10);
        let out = smart_truncate(&content, OutputCategory::Generic, 40);
        let body = out.split("\n[...").next().unwrap();
        assert!(body.ends_with("line\n") || body.ends_with("line"));
    }

    #[test]
    fn multibyte_content_does_not_split_chars() {
        let content = "héllö wörld ".repeat(50);
        let out = smart_truncate(&content, OutputCategory::Generic, 33);
        assert!(out.contains("omitted"));
    }
}
