//! Locates fenced code regions in normalized text so headings and paragraph
//! boundaries inside them can be ignored by the parser and chunker.

use crate::types::FenceRegion;

#[derive(Clone, Copy)]
struct OpenFence {
    ch: u8,
    len: usize,
    start_char: usize,
    lang: Option<String>,
}

/// Scans `text` line by line and returns the half-open fenced regions.
/// Unclosed fences extend to EOF.
pub fn detect_fences(text: &str) -> Vec<FenceRegion> {
    let mut regions = Vec::new();
    let mut open: Option<OpenFence> = None;

    let mut char_offset = 0usize;
    for line in text.split_inclusive('\n') {
        let line_start = char_offset;
        let trimmed_end = line.trim_end_matches(['\n', '\r']);
        let line_chars = line.chars().count();
        char_offset += line_chars;

        match &open {
            None => {
                if let Some((ch, len)) = fence_open(trimmed_end) {
                    let lang = fence_lang(trimmed_end, len);
                    open = Some(OpenFence {
                        ch,
                        len,
                        start_char: line_start,
                        lang,
                    });
                }
            }
            Some(fence) => {
                if fence_closes(trimmed_end, fence.ch, fence.len) {
                    regions.push(FenceRegion {
                        start_char: fence.start_char,
                        end_char: char_offset,
                        lang: fence.lang.clone(),
                    });
                    open = None;
                }
            }
        }
    }

    if let Some(fence) = open {
        regions.push(FenceRegion {
            start_char: fence.start_char,
            end_char: text.chars().count(),
            lang: fence.lang,
        });
    }

    regions
}

/// A line opens a fence if, after at most 3 leading spaces, its non-space
/// run is 3+ backticks or 3+ tildes.
fn fence_open(line: &str) -> Option<(u8, usize)> {
    let stripped = strip_leading_spaces(line, 3)?;
    let first = stripped.as_bytes().first().copied()?;
    if first != b'`' && first != b'~' {
        return None;
    }
    let len = stripped.bytes().take_while(|&b| b == first).count();
    if len < 3 {
        return None;
    }
    Some((first, len))
}

/// A line closes an open fence if its trimmed content is a same-character
/// run of equal-or-greater length with no trailing non-space content.
fn fence_closes(line: &str, ch: u8, min_len: usize) -> bool {
    let stripped = match strip_leading_spaces(line, 3) {
        Some(s) => s,
        None => return false,
    };
    let trimmed = stripped.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    let all_matching = trimmed.bytes().all(|b| b == ch);
    all_matching && trimmed.len() >= min_len
}

fn strip_leading_spaces(line: &str, max: usize) -> Option<&str> {
    let mut count = 0;
    let mut idx = 0;
    for ch in line.chars() {
        if ch == ' ' && count < max {
            count += 1;
            idx += ch.len_utf8();
        } else {
            break;
        }
    }
    let rest = &line[idx..];
    if rest.starts_with(' ') {
        // more than `max` leading spaces remain: not a fence opener
        None
    } else {
        Some(rest)
    }
}

fn fence_lang(line: &str, fence_len: usize) -> Option<String> {
    let stripped = strip_leading_spaces(line, 3)?;
    let after_fence = stripped.trim_start_matches(|c| c == '`' || c == '~');
    let consumed = stripped.len() - after_fence.len();
    if consumed < fence_len {
        return None;
    }
    let tag = after_fence.split_whitespace().next()?;
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

/// Binary-search predicate: is `offset` inside any detected region?
pub fn offset_in_any_region(offset: usize, regions: &[FenceRegion]) -> bool {
    match regions.binary_search_by(|r| {
        if offset < r.start_char {
            std::cmp::Ordering::Greater
        } else if offset >= r.end_char {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Equal
        }
    }) {
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_fence_integrity() {
        let text = "# H\n\nPara A.\n\n```\ncode with ## fake heading\n```\n\nPara B.\n";
        let regions = detect_fences(text);
        assert_eq!(regions.len(), 1);
        let fence_text: String = text.chars().skip(regions[0].start_char).take(regions[0].end_char - regions[0].start_char).collect();
        assert!(fence_text.starts_with("```"));
        assert!(fence_text.trim_end().ends_with("```"));
    }

    #[test]
    fn unclosed_fence_extends_to_eof() {
        let text = "```rust\nfn main() {}\n";
        let regions = detect_fences(text);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].end_char, text.chars().count());
        assert_eq!(regions[0].lang.as_deref(), Some("rust"));
    }

    #[test]
    fn tilde_fence_closes_with_longer_run() {
        let text = "~~~\nbody\n~~~~\nafter\n";
        let regions = detect_fences(text);
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn offset_lookup_via_binary_search() {
        let regions = vec![FenceRegion { start_char: 10, end_char: 20, lang: None }];
        assert!(offset_in_any_region(15, &regions));
        assert!(!offset_in_any_region(25, &regions));
    }
}
