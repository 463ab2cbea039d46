use std::fmt::Write as _;

use sha2::{Digest, Sha256};

pub(crate) const DIGEST_LEN: usize = 32;

pub(crate) fn sha256_bytes(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Folds one committed tick into a running digest.
pub(crate) fn chain_tick(
    previous: &[u8; DIGEST_LEN],
    tick_id: u64,
    encoded_batch: &[u8],
) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update(tick_id.to_le_bytes());
    hasher.update((encoded_batch.len() as u64).to_le_bytes());
    hasher.update(encoded_batch);
    hasher.finalize().into()
}

pub(crate) fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input_matches_known_vector() {
        assert_eq!(
            to_hex_lower(&sha256_bytes(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn chain_depends_on_tick_id_and_batch() {
        let seed = [0u8; DIGEST_LEN];
        let base = chain_tick(&seed, 0, b"n");
        assert_ne!(base, chain_tick(&seed, 1, b"n"));
        assert_ne!(base, chain_tick(&seed, 0, b"i1"));
        assert_eq!(base, chain_tick(&seed, 0, b"n"));
    }
}
