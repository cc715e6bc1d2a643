//! Cuts a heading node's own content into bounded, fence-safe, overlapping chunks.

use crate::config::ChunkingConfig;
use crate::fence::offset_in_any_region;
use crate::hashing::{text_hash, truncated_hash};
use crate::types::{Chunk, FenceRegion, HeadingNode};

struct Atom {
    start: usize,
    end: usize,
}

/// Returns the node's own content range: from the end of its heading line
/// (or 0 for the virtual root) to the start of its first child, or `end_char`.
fn own_content_range(node: &HeadingNode, chars: &[char]) -> (usize, usize) {
    let start = if node.level == 0 {
        node.start_char
    } else {
        // skip past the heading line itself
        let mut i = node.start_char;
        while i < node.end_char && chars[i] != '\n' {
            i += 1;
        }
        (i + 1).min(node.end_char)
    };
    let end = node
        .children
        .first()
        .map(|c| c.start_char)
        .unwrap_or(node.end_char);
    (start, end.max(start))
}

/// Splits `[start, end)` into atoms at blank-line paragraph boundaries,
/// never splitting inside a fenced region.
fn split_atoms(chars: &[char], start: usize, end: usize, fences: &[FenceRegion]) -> Vec<Atom> {
    let mut atoms = Vec::new();
    let mut atom_start = start;
    let mut i = start;
    let mut saw_content = false;

    while i < end {
        let line_start = i;
        while i < end && chars[i] != '\n' {
            i += 1;
        }
        let line_end = i;
        if i < end {
            i += 1; // consume newline
        }

        let inside_fence = offset_in_any_region(line_start, fences);
        let is_blank = (line_start..line_end).all(|j| chars[j] == ' ' || chars[j] == '\t');

        if !inside_fence && is_blank && saw_content {
            atoms.push(Atom {
                start: atom_start,
                end: line_start,
            });
            // skip consecutive blank lines
            let mut k = i;
            while k < end {
                let ls = k;
                let mut le = k;
                while le < end && chars[le] != '\n' {
                    le += 1;
                }
                let blank = (ls..le).all(|j| chars[j] == ' ' || chars[j] == '\t');
                if blank && !offset_in_any_region(ls, fences) {
                    k = (le + 1).min(end);
                } else {
                    break;
                }
            }
            i = k;
            atom_start = i;
            saw_content = false;
        } else if !is_blank {
            saw_content = true;
        }
    }

    if atom_start < end && saw_content {
        atoms.push(Atom {
            start: atom_start,
            end,
        });
    } else if atom_start < end {
        // trailing content was only blank lines after the last real atom; drop it
    }

    atoms
}

fn slice(chars: &[char], start: usize, end: usize) -> String {
    chars[start..end].iter().collect()
}

/// Find an overlap start point within `[window_start, natural_start)` that is
/// ≈`overlap_tokens` tokens back from `natural_start`, preferring a paragraph
/// boundary, then a word boundary, then an exact cut. Never lands inside a
/// fenced region (snaps forward past it).
fn find_overlap_start(
    chars: &[char],
    window_start: usize,
    natural_start: usize,
    overlap_tokens: usize,
    fences: &[FenceRegion],
    count_tokens: &dyn Fn(&str) -> usize,
) -> usize {
    if natural_start <= window_start || overlap_tokens == 0 {
        return natural_start;
    }

    // Binary-search-free linear scan backwards for the earliest position whose
    // tail still has roughly `overlap_tokens`, then refine to a boundary.
    let mut candidate = window_start;
    for pos in (window_start..natural_start).rev() {
        let tail = slice(chars, pos, natural_start);
        if count_tokens(&tail) >= overlap_tokens {
            candidate = pos;
            break;
        }
    }

    // Prefer the nearest paragraph boundary at or after `candidate`.
    let mut best = None;
    for pos in candidate..natural_start {
        if pos + 1 < natural_start && chars[pos] == '\n' && chars[pos + 1] == '\n' {
            best = Some(pos + 2);
        }
    }
    if let Some(p) = best {
        return snap_forward_past_fence(p.min(natural_start), fences);
    }

    // Fall back to the nearest word boundary.
    for pos in candidate..natural_start {
        if chars[pos] == ' ' || chars[pos] == '\n' {
            return snap_forward_past_fence(pos + 1, fences);
        }
    }

    snap_forward_past_fence(candidate, fences)
}

fn snap_forward_past_fence(pos: usize, fences: &[FenceRegion]) -> usize {
    for fence in fences {
        if pos >= fence.start_char && pos < fence.end_char {
            return fence.end_char;
        }
    }
    pos
}

/// Cuts `node`'s own content into an ordered list of `Chunk`s.
pub fn chunk_node(
    node: &HeadingNode,
    normalized: &str,
    shard_id: u32,
    config: &ChunkingConfig,
    fences: &[FenceRegion],
    count_tokens: &dyn Fn(&str) -> usize,
) -> Vec<Chunk> {
    let chars: Vec<char> = normalized.chars().collect();
    let (content_start, content_end) = own_content_range(node, &chars);
    if content_start >= content_end {
        return Vec::new();
    }
    let content_text = slice(&chars, content_start, content_end);
    if content_text.trim().is_empty() {
        return Vec::new();
    }

    let atoms = split_atoms(&chars, content_start, content_end, fences);
    if atoms.is_empty() {
        return Vec::new();
    }

    // Greedy accumulation: group atom indices into chunks by token budget.
    let mut groups: Vec<(usize, usize)> = Vec::new(); // (first_atom_idx, last_atom_idx_inclusive)
    let mut group_start = 0usize;
    let mut running_tokens = 0usize;

    for (idx, atom) in atoms.iter().enumerate() {
        let atom_text = slice(&chars, atom.start, atom.end);
        let atom_tokens = count_tokens(&atom_text);
        if idx > group_start && running_tokens + atom_tokens > config.target_max {
            groups.push((group_start, idx - 1));
            group_start = idx;
            running_tokens = atom_tokens;
        } else {
            running_tokens += atom_tokens;
        }
    }
    groups.push((group_start, atoms.len() - 1));

    // Natural (pre-overlap) char ranges for each group.
    let mut ranges: Vec<(usize, usize)> = groups
        .iter()
        .map(|&(first, last)| (atoms[first].start, atoms[last].end))
        .collect();

    // Seed each chunk after the first with a backward overlap region.
    let overlap_tokens = config.overlap;
    for i in 1..ranges.len() {
        let window_start = ranges[i - 1].0;
        let natural_start = ranges[i].0;
        let overlap_start = find_overlap_start(
            &chars,
            window_start,
            natural_start,
            overlap_tokens,
            fences,
            count_tokens,
        );
        ranges[i].0 = overlap_start;
    }

    // Small-tail merge: fold the final chunk into its predecessor if it is
    // tiny and the merge would not exceed hard_max.
    if ranges.len() >= 2 {
        let last = ranges[ranges.len() - 1];
        let last_text = slice(&chars, last.0, last.1);
        let last_tokens = count_tokens(&last_text);
        if last_tokens < config.min_preferred {
            let prev = ranges[ranges.len() - 2];
            let merged_text = slice(&chars, prev.0, last.1);
            let merged_tokens = count_tokens(&merged_text);
            if merged_tokens <= config.hard_max {
                ranges.pop();
                let new_len = ranges.len();
                ranges[new_len - 1] = (prev.0, last.1);
            }
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            let text = slice(&chars, start, end);
            let leaf_id = truncated_hash(&[&node.doc_uri, &start.to_string(), &end.to_string()]);
            Chunk {
                leaf_id,
                doc_uri: node.doc_uri.clone(),
                node_id: node.node_id.clone(),
                heading_path: node.heading_path.clone(),
                start_char: start,
                end_char: end,
                token_count: count_tokens(&text),
                text_hash: text_hash(&text),
                shard_id,
                text,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::detect_fences;
    use crate::parser::{build_heading_tree, normalize};

    fn approx_tokens(text: &str) -> usize {
        (text.chars().count() + 3) / 4
    }

    #[test]
    fn every_chunk_slice_matches_its_text() {
        let raw = "# H\n\nPara A.\n\nPara B.\n\nPara C.\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        let fences = detect_fences(&normalized);
        let config = ChunkingConfig::default();
        let chunks = chunk_node(&tree.children[0], &normalized, 0, &config, &fences, &approx_tokens);
        let chars: Vec<char> = normalized.chars().collect();
        for chunk in &chunks {
            let slice: String = chars[chunk.start_char..chunk.end_char].iter().collect();
            assert_eq!(slice, chunk.text);
        }
    }

    #[test]
    fn s1_fence_stays_contiguous_in_one_chunk() {
        let raw = "# H\n\nPara A.\n\n```\ncode with ## fake heading\n```\n\nPara B.\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        let fences = detect_fences(&normalized);
        let config = ChunkingConfig::default();
        let chunks = chunk_node(&tree.children[0], &normalized, 0, &config, &fences, &approx_tokens);
        assert!(!chunks.is_empty());
        for fence in &fences {
            let containing = chunks
                .iter()
                .filter(|c| fence.start_char >= c.start_char && fence.end_char <= c.end_char)
                .count();
            assert!(containing >= 1, "fence must be fully contained in at least one chunk");
        }
    }

    #[test]
    fn empty_content_emits_nothing() {
        let raw = "# H\n\n# Next\n\nbody\n";
        let normalized = normalize(raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        let fences = detect_fences(&normalized);
        let config = ChunkingConfig::default();
        let chunks = chunk_node(&tree.children[0], &normalized, 0, &config, &fences, &approx_tokens);
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let raw = "# H\n\n".to_string() + &"Paragraph text here. ".repeat(400) + "\n";
        let normalized = normalize(&raw);
        let tree = build_heading_tree(&normalized, &"t.md".to_string());
        let fences = detect_fences(&normalized);
        let config = ChunkingConfig::default();
        let a = chunk_node(&tree.children[0], &normalized, 3, &config, &fences, &approx_tokens);
        let b = chunk_node(&tree.children[0], &normalized, 3, &config, &fences, &approx_tokens);
        assert_eq!(a.len(), b.len());
        for (ca, cb) in a.iter().zip(b.iter()) {
            assert_eq!(ca.leaf_id, cb.leaf_id);
            assert_eq!(ca.text, cb.text);
        }
    }
}
