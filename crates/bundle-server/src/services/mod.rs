pub mod apps;
pub mod diff;
pub mod release;
pub mod resolver;

use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// Random ASCII alphanumeric string of `len` characters.
pub fn random_token(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
