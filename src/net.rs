//! Dialing, accepting, and endpoint resolution.
//!
//! Connect and accept completions never touch client state; they post a
//! `ConnectionResult` to the reactor's queue and the tick loop takes it
//! from there.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::link::{unspecified_addr, ConnectionInformation};

/// A configured dial target. `localhost` hosts are re-resolved to the
/// machine's outward-facing address on every (re)connect.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub addr: SocketAddr,
    pub localhost: bool,
}

impl RemoteEndpoint {
    /// Parse a `"host:port"` endpoint string from the configuration.
    pub fn parse(endpoint: &str) -> anyhow::Result<Self> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .with_context(|| format!("endpoint {endpoint:?} is not host:port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("endpoint {endpoint:?} has a bad port"))?;
        if host == "localhost" {
            return Ok(Self {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                localhost: true,
            });
        }
        let ip: IpAddr = host
            .parse()
            .with_context(|| format!("endpoint {endpoint:?} has a bad host"))?;
        Ok(Self {
            addr: SocketAddr::from((ip, port)),
            localhost: false,
        })
    }

    /// The address to dial right now.
    pub fn resolve(&self) -> anyhow::Result<SocketAddr> {
        if !self.localhost {
            return Ok(self.addr);
        }
        let ip = primary_ipv4().context("resolve local ip address")?;
        Ok(SocketAddr::new(ip, self.addr.port()))
    }
}

/// The machine's primary outward-facing IPv4 address, learned by opening
/// a UDP socket towards a public address (no packet is sent).
fn primary_ipv4() -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    Ok(socket.local_addr()?.ip())
}

pub struct ConnectionResult {
    pub information: ConnectionInformation,
    /// Present on success; a failed dial or accept carries no socket.
    pub stream: Option<TcpStream>,
}

pub struct PendingConnection {
    pub endpoint: RemoteEndpoint,
    handle: JoinHandle<()>,
}

impl PendingConnection {
    pub fn start(
        endpoint: RemoteEndpoint,
        runtime: &Handle,
        results: flume::Sender<ConnectionResult>,
    ) -> Self {
        let dial = endpoint.clone();
        let handle = runtime.spawn(async move {
            let remote_endpoint = match dial.resolve() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(">=> {:?} {err}", dial.addr);
                    // report as a failed dial so the reactor schedules a retry
                    let _ = results.send(ConnectionResult {
                        information: outbound_information(dial.addr, None, dial.localhost),
                        stream: None,
                    });
                    return;
                }
            };
            let stream = match TcpStream::connect(remote_endpoint).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    Some(stream)
                }
                Err(err) => {
                    warn!(">=> {remote_endpoint} {err}");
                    None
                }
            };
            let _ = results.send(ConnectionResult {
                information: outbound_information(remote_endpoint, stream.as_ref(), dial.localhost),
                stream,
            });
        });
        Self { endpoint, handle }
    }

    pub fn finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn outbound_information(
    remote_endpoint: SocketAddr,
    stream: Option<&TcpStream>,
    remote_localhost: bool,
) -> ConnectionInformation {
    ConnectionInformation {
        remote_endpoint,
        local_endpoint: stream
            .and_then(|stream| stream.local_addr().ok())
            .unwrap_or_else(unspecified_addr),
        inbound: false,
        remote_localhost,
    }
}

/// Accept connections until cancelled or the listener reports an error.
pub async fn accept_loop(
    listener: TcpListener,
    results: flume::Sender<ConnectionResult>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote_endpoint)) => {
                let _ = stream.set_nodelay(true);
                let information = ConnectionInformation {
                    remote_endpoint,
                    local_endpoint: stream.local_addr().unwrap_or_else(|_| unspecified_addr()),
                    inbound: true,
                    remote_localhost: false,
                };
                if results
                    .send(ConnectionResult {
                        information,
                        stream: Some(stream),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                warn!("<<< accept error, server stopped: {err}");
                break;
            }
        }
    }
    info!("<<< acceptor stopped");
}
