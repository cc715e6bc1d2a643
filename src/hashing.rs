use sha2::{Digest, Sha256};

/// `truncatedHash(s) = hex(SHA-256(utf8(s)))[..16]` — used for `nodeId`/`leafId`.
pub fn truncated_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\x00");
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

/// Full SHA-256 hex digest of a chunk's text (`textHash`).
pub fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex_full(&digest)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes[..n].iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_full(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_hash_is_stable() {
        let a = truncated_hash(&["doc.md", "Section"]);
        let b = truncated_hash(&["doc.md", "Section"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn truncated_hash_distinguishes_join_ambiguity() {
        // "ab" + "c" must not collide with "a" + "bc" (the \x00 separator guards this).
        let a = truncated_hash(&["ab", "c"]);
        let b = truncated_hash(&["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn text_hash_is_sha256_hex() {
        let h = text_hash("hello");
        assert_eq!(h.len(), 64);
    }
}
