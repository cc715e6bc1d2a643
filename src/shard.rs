//! Deterministic document→shard assignment via FNV-1a.
//!
//! Hand-implemented rather than pulled from a hashing crate: bit-for-bit
//! reproducibility across platforms is a correctness requirement here, not a
//! performance nicety, and the algorithm is a dozen lines.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn shard_id(doc_uri: &str, shard_count: u32) -> u32 {
    fnv1a32(doc_uri.as_bytes()) % shard_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis.
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
    }

    #[test]
    fn shard_id_is_deterministic_and_bounded() {
        let a = shard_id("notes/a.md", 128);
        let b = shard_id("notes/a.md", 128);
        assert_eq!(a, b);
        assert!(a < 128);
    }

    #[test]
    fn different_docs_can_land_in_different_shards() {
        let a = shard_id("notes/a.md", 128);
        let b = shard_id("notes/completely-different.md", 128);
        assert_ne!(a, b);
    }
}
