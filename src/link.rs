//! One established, mutually-authenticated, encrypted TCP channel.
//!
//! The stream is split into owned halves driven by two spawned tasks: the
//! write task drains an outbox queue, the read task loops on framed reads
//! and posts decrypted messages to the reactor. Each direction is thereby
//! strictly serialized, and each direction advances its rolling token in
//! the same step that commits the frame.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::{
    decrypt_in_chunks, encrypt_in_chunks, Identity, RollingToken, TOKEN_LEN,
};
use crate::message::{Message, MAX_FRAME_LEN};

pub fn utc_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unspecified_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

#[derive(Debug, Clone)]
pub struct ConnectionInformation {
    pub remote_endpoint: SocketAddr,
    pub local_endpoint: SocketAddr,
    pub inbound: bool,
    pub remote_localhost: bool,
}

/// Everything agreed during the handshake. `local_token` protects the
/// outbound direction, `remote_token` the inbound one.
pub struct SecurityContext {
    pub local_private_key: rsa::RsaPrivateKey,
    pub local_token: RollingToken,
    pub remote_public_key: rsa::RsaPublicKey,
    pub remote_token: RollingToken,
    pub remote_identity: Identity,
}

pub async fn write_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    bytes: &[u8],
) -> anyhow::Result<()> {
    anyhow::ensure!(
        (bytes.len() as u64) <= MAX_FRAME_LEN,
        "frame length {} above limit",
        bytes.len()
    );
    stream.write_u64_le(bytes.len() as u64).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `Ok(None)` is a clean end of stream.
pub async fn read_frame(
    stream: &mut (impl AsyncRead + Unpin),
) -> anyhow::Result<Option<Vec<u8>>> {
    let len = match stream.read_u64_le().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame length {len} above limit");
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub struct Link {
    pub information: ConnectionInformation,
    local_private_key: rsa::RsaPrivateKey,
    remote_public_key: rsa::RsaPublicKey,
    remote_identity: Identity,
    local_token: Mutex<RollingToken>,
    remote_token: Mutex<RollingToken>,
    connected: AtomicBool,
    last_interaction_time: AtomicU64,
    send_dispatch_count: AtomicU32,
    receive_dispatch_count: AtomicU32,
    outbox: flume::Sender<Vec<u8>>,
    // kept so the reactor can complete queued sends as failures after close
    outbox_drain: flume::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl Link {
    pub fn spawn(
        information: ConnectionInformation,
        security: SecurityContext,
        stream: TcpStream,
        runtime: &Handle,
        received: flume::Sender<(Arc<Link>, Vec<u8>)>,
    ) -> Arc<Self> {
        let (outbox_sender, outbox_receiver) = flume::unbounded();
        let link = Arc::new(Self {
            information,
            local_private_key: security.local_private_key,
            remote_public_key: security.remote_public_key,
            remote_identity: security.remote_identity,
            local_token: Mutex::new(security.local_token),
            remote_token: Mutex::new(security.remote_token),
            connected: AtomicBool::new(true),
            last_interaction_time: AtomicU64::new(utc_time()),
            send_dispatch_count: AtomicU32::new(0),
            receive_dispatch_count: AtomicU32::new(0),
            outbox: outbox_sender,
            outbox_drain: outbox_receiver.clone(),
            cancel: CancellationToken::new(),
        });
        let (read_half, write_half) = stream.into_split();
        runtime.spawn(write_task(link.clone(), write_half, outbox_receiver));
        runtime.spawn(read_task(link.clone(), read_half, received));
        link
    }

    pub fn remote_identity(&self) -> &str {
        &self.remote_identity
    }

    /// Queue a message for the write task. The frame is sealed and the
    /// outbound token advanced there, in queue order.
    pub fn send(&self, message: &Message) -> anyhow::Result<()> {
        anyhow::ensure!(self.connected(), "link to {} is closed", self.remote_identity);
        let bytes = message.encode()?;
        self.send_dispatch_count.fetch_add(1, Ordering::SeqCst);
        if self.outbox.send(bytes).is_err() {
            self.send_dispatch_count.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("link to {} is closed", self.remote_identity);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel()
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether any send or receive completion is still outstanding.
    pub fn dispatched(&self) -> bool {
        self.send_dispatch_count.load(Ordering::SeqCst) > 0
            || self.receive_dispatch_count.load(Ordering::SeqCst) > 0
    }

    pub fn idletime(&self) -> u64 {
        utc_time().saturating_sub(self.last_interaction_time.load(Ordering::SeqCst))
    }

    /// Complete queued-but-unsent frames as failures once the write task
    /// is gone, so the dispatch counters can drain to zero.
    pub fn fail_pending_sends(&self) {
        for _ in self.outbox_drain.try_iter() {
            self.send_dispatch_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn touch(&self) {
        self.last_interaction_time.store(utc_time(), Ordering::SeqCst)
    }

    fn seal_frame(&self, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut plain = self.local_token.lock().unwrap().value().to_vec();
        plain.extend_from_slice(bytes);
        encrypt_in_chunks(&self.remote_public_key, &plain)
    }

    fn open_frame(&self, frame: &[u8]) -> anyhow::Result<Vec<u8>> {
        let plain = decrypt_in_chunks(&self.local_private_key, frame)?;
        anyhow::ensure!(plain.len() >= TOKEN_LEN, "frame too short for its token");
        let mut remote_token = self.remote_token.lock().unwrap();
        anyhow::ensure!(
            plain[..TOKEN_LEN] == remote_token.value(),
            "frame token mismatch"
        );
        remote_token.advance();
        Ok(plain[TOKEN_LEN..].to_vec())
    }
}

async fn write_task(
    link: Arc<Link>,
    mut write_half: OwnedWriteHalf,
    outbox: flume::Receiver<Vec<u8>>,
) {
    loop {
        let bytes = tokio::select! {
            _ = link.cancel.cancelled() => break,
            bytes = outbox.recv_async() => match bytes {
                Ok(bytes) => bytes,
                Err(_) => break,
            },
        };
        let written = tokio::select! {
            _ = link.cancel.cancelled() => Err(anyhow::anyhow!("link closed")),
            written = async {
                let frame = link.seal_frame(&bytes)?;
                write_frame(&mut write_half, &frame).await
            } => written,
        };
        match written {
            Ok(()) => {
                link.local_token.lock().unwrap().advance();
                link.touch();
                link.send_dispatch_count.fetch_sub(1, Ordering::SeqCst);
            }
            Err(err) => {
                warn!(">=> {} {err}", link.information.remote_endpoint);
                link.send_dispatch_count.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        }
    }
    link.close()
}

async fn read_task(
    link: Arc<Link>,
    mut read_half: OwnedReadHalf,
    received: flume::Sender<(Arc<Link>, Vec<u8>)>,
) {
    loop {
        link.receive_dispatch_count.fetch_add(1, Ordering::SeqCst);
        let frame = tokio::select! {
            _ = link.cancel.cancelled() => Err(anyhow::anyhow!("link closed")),
            frame = read_frame(&mut read_half) => frame,
        };
        let outcome = frame.and_then(|frame| match frame {
            Some(frame) => link.open_frame(&frame).map(Some),
            None => Ok(None),
        });
        link.receive_dispatch_count.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(Some(bytes)) => {
                link.touch();
                if received.send((link.clone(), bytes)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("<<< {} end of stream", link.information.remote_endpoint);
                break;
            }
            Err(err) => {
                warn!("<<< {} {err}", link.information.remote_endpoint);
                break;
            }
        }
    }
    link.close()
}
