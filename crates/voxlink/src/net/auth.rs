use blake2::{Blake2s256, Digest};

pub const PROOF_SIZE: usize = 32;

/// Proof of password knowledge for a challenge nonce.
///
/// `BLAKE2s-256(nonce_be || username || 0x00 || password)`. The password
/// itself never goes on the wire.
pub fn auth_proof(nonce: u64, username: &str, password: &str) -> [u8; PROOF_SIZE] {
    let mut hasher = Blake2s256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

pub fn verify_proof(nonce: u64, username: &str, password: &str, proof: &[u8; PROOF_SIZE]) -> bool {
    let expected = auth_proof(nonce, username, password);
    // Constant-time comparison.
    expected
        .iter()
        .zip(proof.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
