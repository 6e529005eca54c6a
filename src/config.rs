//! Runtime configuration record.
//!
//! Parsing this from disk is the embedder's business; the client only
//! consumes the populated record. The approval list is read-only after
//! construction.

use crate::crypto::{Identity, KeyPair};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity and private key material of the local client.
    pub local_key_pair: KeyPair,
    pub enable_server: bool,
    /// TCP port of the acceptor; 0 lets the OS choose.
    pub server_bind_port: u16,
    /// `"host:port"` strings dialed on startup. A host of `localhost` is
    /// rewritten to the machine's outward-facing IPv4 address at dial time.
    pub remote_endpoints: Vec<String>,
    /// Identities allowed past an otherwise successful authentication.
    pub approved_identities: Vec<Identity>,
    pub enable_pending_authentication_timeout: bool,
    pub pending_authentication_timeout_in_seconds: u64,
    pub enable_authenticated_connection_timeout: bool,
    pub authenticated_connection_timeout_in_seconds: u64,
    pub reconnect_delay_in_seconds: u64,
}

impl ClientConfig {
    pub fn new(local_key_pair: KeyPair) -> Self {
        Self {
            local_key_pair,
            enable_server: false,
            server_bind_port: 0,
            remote_endpoints: Vec::new(),
            approved_identities: Vec::new(),
            enable_pending_authentication_timeout: true,
            pending_authentication_timeout_in_seconds: 10,
            enable_authenticated_connection_timeout: false,
            authenticated_connection_timeout_in_seconds: 3600,
            reconnect_delay_in_seconds: 5,
        }
    }
}
