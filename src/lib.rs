pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod link;
pub mod message;
pub mod net;
pub mod routing;

pub use client::{Client, Peer};
pub use config::ClientConfig;
pub use crypto::{Identity, KeyPair};
pub use message::{AgentInformation, RelayBody};

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::OnceLock;

    use crate::crypto::KeyPair;

    /// Deterministically indexed key pairs, generated once per test run;
    /// RSA key generation is too slow to repeat in every test.
    pub fn test_key_pair(index: usize) -> KeyPair {
        static KEY_PAIRS: OnceLock<Vec<KeyPair>> = OnceLock::new();
        KEY_PAIRS
            .get_or_init(|| {
                (0..4)
                    .map(|_| KeyPair::generate(1024).expect("generate test key pair"))
                    .collect()
            })[index]
            .clone()
    }
}
