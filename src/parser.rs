//! Text normalization and ATX heading tree construction.

use once_line_starts::line_starts;

use crate::fence::{detect_fences, offset_in_any_region};
use crate::hashing::truncated_hash;
use crate::types::{DocUri, HeadingNode};

/// CRLF/CR→LF, strip a leading BOM, ensure a trailing newline.
pub fn normalize(raw: &str) -> String {
    let stripped = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let mut out = stripped.replace("\r\n", "\n").replace('\r', "\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn parse_atx_heading(line: &str) -> Option<(u8, String)> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if rest.is_empty() {
        return None;
    }
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim();
    if title.is_empty() {
        return None;
    }
    Some((hashes as u8, title.to_string()))
}

/// Builds the heading tree for a normalized document. Always returns a
/// virtual level-0 root node spanning the whole document.
pub fn build_heading_tree(normalized: &str, doc_uri: &DocUri) -> HeadingNode {
    let fences = detect_fences(normalized);
    let total_chars = normalized.chars().count();

    let root = HeadingNode {
        node_id: truncated_hash(&[doc_uri, "", "0"]),
        doc_uri: doc_uri.clone(),
        level: 0,
        title: String::new(),
        heading_path: String::new(),
        start_char: 0,
        end_char: total_chars,
        children: Vec::new(),
    };

    // Stack of (node, path-of-titles). Each stack entry owns its children
    // until popped, at which point it is appended to its parent's children.
    struct Frame {
        node: HeadingNode,
        path_titles: Vec<String>,
    }

    let mut stack: Vec<Frame> = vec![Frame {
        node: root,
        path_titles: Vec::new(),
    }];

    for (line_start_char, line) in line_starts(normalized) {
        if offset_in_any_region(line_start_char, &fences) {
            continue;
        }
        let Some((level, title)) = parse_atx_heading(line) else {
            continue;
        };

        // Pop while top's level >= new level, closing each popped node's range.
        while stack.len() > 1 && stack.last().unwrap().node.level >= level {
            let mut popped = stack.pop().unwrap();
            popped.node.end_char = line_start_char;
            let parent = stack.last_mut().unwrap();
            parent.node.children.push(popped.node);
        }

        let mut path_titles = stack.last().unwrap().path_titles.clone();
        path_titles.push(title.clone());
        let heading_path = path_titles.join(" \u{2192} ");
        let node_id = truncated_hash(&[doc_uri, &heading_path, &line_start_char.to_string()]);

        stack.push(Frame {
            node: HeadingNode {
                node_id,
                doc_uri: doc_uri.clone(),
                level,
                title,
                heading_path,
                start_char: line_start_char,
                end_char: total_chars,
                children: Vec::new(),
            },
            path_titles,
        });
    }

    while stack.len() > 1 {
        let mut popped = stack.pop().unwrap();
        popped.node.end_char = total_chars;
        let parent = stack.last_mut().unwrap();
        parent.node.children.push(popped.node);
    }

    stack.pop().unwrap().node
}

/// Small helper module so `build_heading_tree` can iterate `(char_offset, line)`
/// pairs without repeatedly re-scanning from the start of the string.
mod once_line_starts {
    pub fn line_starts(text: &str) -> impl Iterator<Item = (usize, &str)> {
        let mut char_offset = 0usize;
        text.split_inclusive('\n').map(move |line| {
            let start = char_offset;
            char_offset += line.chars().count();
            (start, line.trim_end_matches('\n'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s2_heading_offsets() {
        let raw = "# First\n\nContent 1\n\n# Second\n\nContent 2\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        assert_eq!(tree.children.len(), 2);
        let first = &tree.children[0];
        let second = &tree.children[1];
        assert_eq!(first.start_char, 0);
        let second_start = normalized.find("# Second").unwrap();
        assert_eq!(first.end_char, second_start);
        assert_eq!(second.end_char, normalized.chars().count());
    }

    #[test]
    fn s1_one_child_heading_fence_untouched() {
        let raw = "# H\n\nPara A.\n\n```\ncode with ## fake heading\n```\n\nPara B.\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].title, "H");
    }

    #[test]
    fn nested_headings_form_a_tree() {
        let raw = "# A\n\n## B\n\ntext\n\n## C\n\n# D\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].title, "A");
        assert_eq!(tree.children[0].children.len(), 2);
        assert_eq!(tree.children[1].title, "D");
    }

    #[test]
    fn duplicate_sibling_titles_get_distinct_node_ids() {
        let raw = "# Notes\n\n## Update\n\nfirst\n\n## Update\n\nsecond\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        let notes = &tree.children[0];
        assert_eq!(notes.children.len(), 2);
        assert_eq!(notes.children[0].heading_path, notes.children[1].heading_path);
        assert_ne!(notes.children[0].node_id, notes.children[1].node_id);
    }

    #[test]
    fn empty_title_headings_are_not_headings() {
        let raw = "###\n\nbody\n\n### \n\nmore\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        assert!(tree.children.is_empty());
    }

    #[test]
    fn crlf_and_bom_are_normalized() {
        let raw = "\u{feff}# A\r\n\r\nbody\r\n";
        let normalized = normalize(raw);
        assert!(!normalized.starts_with('\u{feff}'));
        assert!(!normalized.contains('\r'));
        assert!(normalized.ends_with('\n'));
    }
}
