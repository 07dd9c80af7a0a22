//! Small shared primitives with no better home.

/// FNV-1a, 64-bit. Used both for the mesh's HMAC-like token (`mesh::token`)
/// and for the tool registry's open-addressed bucket hash, since both want
/// a fast, non-cryptographic, dependency-free hash rather than pulling in
/// `sha2` for a lookup table.
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Renders an FNV-1a hash as the 16-hex-digit lowercase string the mesh
/// token format uses.
pub fn fnv1a_hex(data: &[u8]) -> String {
    format!("{:016x}", fnv1a_hash(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
    }

    #[test]
    fn hex_is_sixteen_chars() {
        assert_eq!(fnv1a_hex(b"anything").len(), 16);
    }
}
