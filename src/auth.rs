//! Mutual authentication of a freshly connected socket.
//!
//! Both sides swap random seeds in cleartext, then prove possession of
//! their private key by signing a digest of both seeds. The acceptor
//! proves first, the dialer answers; the fixed order keeps one side
//! reading while the other writes. The seed a side receives becomes its
//! outbound rolling-token seed, the seed it sent its inbound one, so the
//! receiver of a direction is the party that chose its protection.

use std::time::Duration;

use bincode::Options;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ClientConfig;
use crate::crypto::{
    identity_of, random_seed, sign_transcript, verify_transcript, Identity, KeyPair,
    RollingToken, SEED_LEN,
};
use crate::link::{read_frame, write_frame, ConnectionInformation, SecurityContext};

fn proof_options() -> impl Options {
    bincode::options().with_fixint_encoding()
}

#[derive(Serialize, Deserialize)]
struct Proof {
    public_key_der: Vec<u8>,
    signature: Vec<u8>,
}

pub struct AuthenticationResult {
    pub information: ConnectionInformation,
    /// Present only when the handshake succeeded in time.
    pub outcome: Option<(TcpStream, SecurityContext)>,
}

pub struct PendingAuthentication {
    handle: JoinHandle<()>,
}

impl PendingAuthentication {
    /// Drive one attempt in the background; exactly one result is pushed,
    /// a timeout producing a failure no matter what the socket is doing.
    pub fn start(
        information: ConnectionInformation,
        mut stream: TcpStream,
        key_pair: KeyPair,
        config: &ClientConfig,
        runtime: &Handle,
        results: flume::Sender<AuthenticationResult>,
    ) -> Self {
        let enable_timeout = config.enable_pending_authentication_timeout;
        let timeout = Duration::from_secs(config.pending_authentication_timeout_in_seconds);
        let handle = runtime.spawn(async move {
            let inbound = information.inbound;
            let handshake = handshake(&mut stream, &key_pair, inbound);
            let security = if enable_timeout {
                match tokio::time::timeout(timeout, handshake).await {
                    Ok(security) => security,
                    Err(_) => Err(anyhow::anyhow!("authentication timed out")),
                }
            } else {
                handshake.await
            };
            let outcome = match security {
                Ok(security) => Some((stream, security)),
                Err(err) => {
                    debug!("<-> {} authentication failed: {err}", information.remote_endpoint);
                    None
                }
            };
            let _ = results.send(AuthenticationResult {
                information,
                outcome,
            });
        });
        Self { handle }
    }

    pub fn finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn handshake(
    stream: &mut TcpStream,
    key_pair: &KeyPair,
    inbound: bool,
) -> anyhow::Result<SecurityContext> {
    let sent_seed = random_seed();
    write_frame(stream, &sent_seed).await?;
    let received = read_frame(stream)
        .await?
        .ok_or_else(|| anyhow::anyhow!("peer closed during seed exchange"))?;
    let received_seed: [u8; SEED_LEN] = received
        .try_into()
        .map_err(|_| anyhow::anyhow!("bad seed length"))?;

    let (remote_public_key, remote_identity) = if inbound {
        send_proof(stream, key_pair, &received_seed, &sent_seed).await?;
        receive_proof(stream, &sent_seed, &received_seed).await?
    } else {
        let remote = receive_proof(stream, &sent_seed, &received_seed).await?;
        send_proof(stream, key_pair, &received_seed, &sent_seed).await?;
        remote
    };

    Ok(SecurityContext {
        local_private_key: key_pair.private_key.clone(),
        local_token: RollingToken::new(received_seed),
        remote_public_key,
        remote_token: RollingToken::new(sent_seed),
        remote_identity,
    })
}

async fn send_proof(
    stream: &mut TcpStream,
    key_pair: &KeyPair,
    received_seed: &[u8],
    sent_seed: &[u8],
) -> anyhow::Result<()> {
    let proof = Proof {
        public_key_der: key_pair.public_key.to_public_key_der()?.into_vec(),
        signature: sign_transcript(&key_pair.private_key, received_seed, sent_seed)?,
    };
    write_frame(stream, &proof_options().serialize(&proof)?).await
}

async fn receive_proof(
    stream: &mut TcpStream,
    sent_seed: &[u8],
    received_seed: &[u8],
) -> anyhow::Result<(rsa::RsaPublicKey, Identity)> {
    let bytes = read_frame(stream)
        .await?
        .ok_or_else(|| anyhow::anyhow!("peer closed during challenge"))?;
    let proof: Proof = proof_options().deserialize(&bytes)?;
    let remote_public_key = rsa::RsaPublicKey::from_public_key_der(&proof.public_key_der)?;
    anyhow::ensure!(
        verify_transcript(&remote_public_key, sent_seed, received_seed, &proof.signature),
        "bad challenge signature"
    );
    // identity is the canonical re-encoding, not the received DER verbatim
    let remote_identity = identity_of(&remote_public_key)?;
    Ok((remote_public_key, remote_identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_key_pair;

    #[tokio::test]
    async fn handshake_agrees_on_tokens_and_identities() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (acceptor_keys, dialer_keys) = (test_key_pair(0), test_key_pair(1));
        let acceptor = tokio::spawn({
            let keys = acceptor_keys.clone();
            async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                handshake(&mut stream, &keys, true).await.unwrap()
            }
        });
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let dialer_side = handshake(&mut stream, &dialer_keys, false).await.unwrap();
        let acceptor_side = acceptor.await.unwrap();

        assert_eq!(
            acceptor_side.remote_identity,
            dialer_keys.identity().unwrap()
        );
        assert_eq!(
            dialer_side.remote_identity,
            acceptor_keys.identity().unwrap()
        );
        // each outbound token matches the peer's inbound token
        assert_eq!(acceptor_side.local_token, dialer_side.remote_token);
        assert_eq!(dialer_side.local_token, acceptor_side.remote_token);
        assert_ne!(acceptor_side.local_token, acceptor_side.remote_token);
    }

    #[tokio::test]
    async fn wrong_key_fails_the_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // sign the transcript with a key that does not match the
            // public key we present
            let sent_seed = random_seed();
            write_frame(&mut stream, &sent_seed).await.unwrap();
            let received_seed = read_frame(&mut stream).await.unwrap().unwrap();
            let forged = Proof {
                public_key_der: test_key_pair(2)
                    .public_key
                    .to_public_key_der()
                    .unwrap()
                    .into_vec(),
                signature: sign_transcript(
                    &test_key_pair(0).private_key,
                    &received_seed,
                    &sent_seed,
                )
                .unwrap(),
            };
            let bytes = proof_options().serialize(&forged).unwrap();
            write_frame(&mut stream, &bytes).await.unwrap();
        });
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let result = handshake(&mut stream, &test_key_pair(1), false).await;
        assert!(result.is_err());
        acceptor.await.unwrap();
    }
}
