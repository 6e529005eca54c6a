//! The client runtime: a single-threaded reactor over queue-posting I/O
//! tasks.
//!
//! Every tick drains the queues in a fixed order: pending dials,
//! connection results, authentication attempts and their results, the
//! authenticated link set, then received messages demultiplexed into the
//! relay / client-path / agent-information processors, delayed calls, and
//! finally the routing index sweep. I/O completions only ever post into
//! the flume queues; all state mutation happens here.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthenticationResult, PendingAuthentication};
use crate::config::ClientConfig;
use crate::crypto::Identity;
use crate::link::{utc_time, ConnectionInformation, Link};
use crate::message::{
    AgentInformation, Message, MessageBody, RelayBody, PROTOCOL_VERSION,
};
use crate::net::{accept_loop, ConnectionResult, PendingConnection, RemoteEndpoint};
use crate::routing::{find_client, path_is_acyclic, ClientInfo};

const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Deferred reactor work; a closed set instead of captured closures.
enum Action {
    ReconnectOutbound { endpoint: RemoteEndpoint },
}

struct PendingCall {
    fire_at: u64,
    action: Action,
}

/// A remote client visible through the routing index.
#[derive(Debug, Clone)]
pub struct Peer {
    pub identity: Identity,
    pub paths: Vec<Vec<Identity>>,
    pub agent_information: AgentInformation,
}

pub struct Client {
    config: ClientConfig,
    runtime: Handle,
    local_identity: Identity,
    agent_information: AgentInformation,
    shutting_down: bool,
    server_addr: Option<SocketAddr>,
    acceptor_cancel: CancellationToken,

    pending_outbound_connections: Vec<PendingConnection>,
    connection_results: (
        flume::Sender<ConnectionResult>,
        flume::Receiver<ConnectionResult>,
    ),
    authentication_attempts: Vec<PendingAuthentication>,
    authentication_attempt_results: (
        flume::Sender<AuthenticationResult>,
        flume::Receiver<AuthenticationResult>,
    ),
    authenticated_connections: Vec<Arc<Link>>,
    received_messages: (
        flume::Sender<(Arc<Link>, Vec<u8>)>,
        flume::Receiver<(Arc<Link>, Vec<u8>)>,
    ),
    relay_messages: VecDeque<Message>,
    client_path_messages: VecDeque<Message>,
    agent_information_messages: VecDeque<Message>,
    pending_function_calls: Vec<PendingCall>,
    registered_clients: Vec<ClientInfo>,
    delivered_messages: VecDeque<RelayBody>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        agent_information: AgentInformation,
        runtime: Handle,
    ) -> anyhow::Result<Self> {
        let local_identity = config.local_key_pair.identity()?;
        let endpoints = config
            .remote_endpoints
            .iter()
            .map(|endpoint| RemoteEndpoint::parse(endpoint))
            .collect::<anyhow::Result<Vec<_>>>()?;

        // the local client is always registered, with the trivial path
        let mut local_entry = ClientInfo::new(local_identity.clone(), agent_information.clone());
        local_entry.register_path(vec![local_identity.clone()]);

        let mut client = Self {
            config,
            runtime,
            local_identity,
            agent_information,
            shutting_down: false,
            server_addr: None,
            acceptor_cancel: CancellationToken::new(),
            pending_outbound_connections: Vec::new(),
            connection_results: flume::unbounded(),
            authentication_attempts: Vec::new(),
            authentication_attempt_results: flume::unbounded(),
            authenticated_connections: Vec::new(),
            received_messages: flume::unbounded(),
            relay_messages: VecDeque::new(),
            client_path_messages: VecDeque::new(),
            agent_information_messages: VecDeque::new(),
            pending_function_calls: Vec::new(),
            registered_clients: vec![local_entry],
            delivered_messages: VecDeque::new(),
        };
        if client.config.enable_server {
            client.start_server()?;
        }
        for endpoint in endpoints {
            client.start_outbound_connection(endpoint);
        }
        Ok(client)
    }

    fn start_server(&mut self) -> anyhow::Result<()> {
        let bind = (Ipv4Addr::UNSPECIFIED, self.config.server_bind_port);
        let listener = self
            .runtime
            .block_on(TcpListener::bind(bind))
            .context("bind acceptor")?;
        self.server_addr = Some(listener.local_addr()?);
        info!("<<< listening on {}", self.server_addr.unwrap());
        self.runtime.spawn(accept_loop(
            listener,
            self.connection_results.0.clone(),
            self.acceptor_cancel.clone(),
        ));
        Ok(())
    }

    fn start_outbound_connection(&mut self, endpoint: RemoteEndpoint) {
        self.pending_outbound_connections.push(PendingConnection::start(
            endpoint,
            &self.runtime,
            self.connection_results.0.clone(),
        ));
    }

    fn schedule_reconnect(&mut self, information: &ConnectionInformation) {
        if self.shutting_down {
            return;
        }
        let endpoint = RemoteEndpoint {
            addr: information.remote_endpoint,
            localhost: information.remote_localhost,
        };
        self.pending_function_calls.push(PendingCall {
            fire_at: utc_time() + self.config.reconnect_delay_in_seconds,
            action: Action::ReconnectOutbound { endpoint },
        });
    }

    fn identity_approved(&self, identity: &str) -> bool {
        self.config
            .approved_identities
            .iter()
            .any(|approved| approved == identity)
    }

    fn find_connection(&self, identity: &str) -> Option<&Arc<Link>> {
        self.authenticated_connections
            .iter()
            .find(|link| link.remote_identity() == identity)
    }

    /// Send our entire routing index to a freshly authenticated neighbor.
    fn register_local_index(&self, link: &Arc<Link>) {
        for client in &self.registered_clients {
            for path in &client.paths {
                if let Err(err) = link.send(&Message::client_path(path.clone(), true)) {
                    debug!(">=> {} {err}", link.information.remote_endpoint);
                }
            }
            let message = Message::agent_information(
                client.identity.clone(),
                client.agent_information.clone(),
            );
            if let Err(err) = link.send(&message) {
                debug!(">=> {} {err}", link.information.remote_endpoint);
            }
        }
    }

    /// Invalidate every path that runs through a lost neighbor, and let
    /// the rest of the mesh know.
    fn deregister_neighbor_index(&mut self, neighbor_identity: Identity) {
        self.client_path_messages
            .push_back(Message::client_path(vec![neighbor_identity], false));
    }

    fn broadcast_except(&self, message: &Message, excluded: &[Identity]) {
        for link in &self.authenticated_connections {
            if excluded.iter().any(|identity| identity == link.remote_identity()) {
                continue;
            }
            if let Err(err) = link.send(message) {
                debug!(">=> {} {err}", link.information.remote_endpoint);
            }
        }
    }

    /// One reactor pass over every queue, in fixed order.
    pub fn tick(&mut self) {
        self.process_pending_outbound_connections();
        self.process_connection_results();
        self.process_authentication_attempts();
        self.process_authentication_attempt_results();
        self.process_authenticated_connections();
        self.process_received_messages();
        self.process_relay_messages();
        self.process_client_path_messages();
        self.process_agent_information_messages();
        self.process_pending_function_calls();
        self.process_registered_clients();
    }

    /// Tick until shutdown completes. A panicking tick is logged and the
    /// loop keeps going.
    pub fn run(&mut self) {
        loop {
            if catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                error!("reactor tick panicked");
            }
            if self.finished() {
                return;
            }
            std::thread::sleep(TICK_INTERVAL);
        }
    }

    fn finished(&self) -> bool {
        self.shutting_down
            && self.authenticated_connections.is_empty()
            && self.authentication_attempts.is_empty()
            && self.pending_outbound_connections.is_empty()
    }

    fn process_pending_outbound_connections(&mut self) {
        self.pending_outbound_connections
            .retain(|pending| !pending.finished());
    }

    fn process_connection_results(&mut self) {
        for result in self.connection_results.1.try_iter().collect::<Vec<_>>() {
            match result.stream {
                Some(stream) if !self.shutting_down => {
                    self.authentication_attempts.push(PendingAuthentication::start(
                        result.information,
                        stream,
                        self.config.local_key_pair.clone(),
                        &self.config,
                        &self.runtime,
                        self.authentication_attempt_results.0.clone(),
                    ));
                }
                Some(stream) => drop(stream),
                None if !result.information.inbound => self.schedule_reconnect(&result.information),
                None => {}
            }
        }
    }

    fn process_authentication_attempts(&mut self) {
        self.authentication_attempts
            .retain(|attempt| !attempt.finished());
    }

    fn process_authentication_attempt_results(&mut self) {
        for result in self
            .authentication_attempt_results
            .1
            .try_iter()
            .collect::<Vec<_>>()
        {
            let information = result.information;
            match result.outcome {
                Some((stream, security))
                    if !self.shutting_down
                        && self.identity_approved(&security.remote_identity)
                        && self.find_connection(&security.remote_identity).is_none() =>
                {
                    info!(
                        "<-> {} authenticated ({}…)",
                        information.remote_endpoint,
                        &security.remote_identity[..security.remote_identity.len().min(12)],
                    );
                    let link = Link::spawn(
                        information,
                        security,
                        stream,
                        &self.runtime,
                        self.received_messages.0.clone(),
                    );
                    self.authenticated_connections.push(link.clone());
                    self.register_local_index(&link);
                }
                Some((stream, security)) => {
                    // authenticated fine, but unapproved or already linked
                    warn!(
                        "<-> {} identity refused ({}…)",
                        information.remote_endpoint,
                        &security.remote_identity[..security.remote_identity.len().min(12)],
                    );
                    drop(stream);
                    if !information.inbound {
                        self.schedule_reconnect(&information);
                    }
                }
                None => {
                    if !information.inbound {
                        self.schedule_reconnect(&information);
                    }
                }
            }
        }
    }

    fn process_authenticated_connections(&mut self) {
        for index in (0..self.authenticated_connections.len()).rev() {
            let link = self.authenticated_connections[index].clone();
            let timed_out = self.config.enable_authenticated_connection_timeout
                && link.idletime() > self.config.authenticated_connection_timeout_in_seconds;
            if timed_out && (link.connected() || link.dispatched()) {
                info!(
                    "<-> {} idle for {}s, closing",
                    link.information.remote_endpoint,
                    link.idletime()
                );
                link.close();
            }
            if !link.connected() {
                link.fail_pending_sends();
                if !link.dispatched() {
                    // removal only once every completion has drained
                    self.authenticated_connections.remove(index);
                    if !link.information.inbound {
                        self.schedule_reconnect(&link.information);
                    }
                    self.deregister_neighbor_index(link.remote_identity().to_string());
                }
            }
        }
    }

    fn process_received_messages(&mut self) {
        for (link, bytes) in self.received_messages.1.try_iter().collect::<Vec<_>>() {
            match Message::decode(&bytes) {
                Ok(message) => match &message.body {
                    MessageBody::Relay(_) => self.relay_messages.push_back(message),
                    MessageBody::ClientPath(_) => self.client_path_messages.push_back(message),
                    MessageBody::AgentInformation(_) => {
                        self.agent_information_messages.push_back(message)
                    }
                },
                Err(err) => {
                    warn!("<<< {} bad message: {err}", link.information.remote_endpoint);
                    link.close();
                }
            }
        }
    }

    fn process_relay_messages(&mut self) {
        while let Some(message) = self.relay_messages.pop_front() {
            let mut header = message.header;
            let MessageBody::Relay(mut body) = message.body else {
                unreachable!()
            };
            if body.path.first() != Some(&self.local_identity) {
                debug!("dropping mis-routed relay from {}", body.origin_identity);
                continue;
            }
            body.path.remove(0);
            if body.path.is_empty() {
                // we are the recipient
                self.delivered_messages.push_back(body);
                continue;
            }
            let Some(link) = self.find_connection(&body.path[0]).cloned() else {
                debug!(
                    "dropping relay from {}: next hop not connected",
                    body.origin_identity
                );
                continue;
            };
            header.version = PROTOCOL_VERSION;
            let forwarded = Message {
                header,
                body: MessageBody::Relay(body),
            };
            if let Err(err) = link.send(&forwarded) {
                debug!(">=> {} {err}", link.information.remote_endpoint);
            }
        }
    }

    fn process_client_path_messages(&mut self) {
        while let Some(message) = self.client_path_messages.pop_front() {
            let mut header = message.header;
            let MessageBody::ClientPath(mut body) = message.body else {
                unreachable!()
            };
            if body.client_path.is_empty() {
                debug!("dropping empty client path announcement");
                continue;
            }
            // the sender leaves the receiving end implicit; we are it
            body.client_path.insert(0, self.local_identity.clone());
            header.version = PROTOCOL_VERSION;
            if body.register {
                if !path_is_acyclic(&body.client_path) {
                    debug!("dropping cyclic client path");
                    continue;
                }
                let target = body.client_path.last().unwrap().clone();
                if find_client(&mut self.registered_clients, &target).is_none() {
                    self.registered_clients
                        .push(ClientInfo::new(target.clone(), AgentInformation::default()));
                }
                let entry = find_client(&mut self.registered_clients, &target).unwrap();
                if !entry.register_path(body.client_path.clone()) {
                    // known path; stop here so announcements cannot flood
                    continue;
                }
            } else {
                // any path depending on this prefix is now invalid
                for entry in &mut self.registered_clients {
                    entry.deregister_paths_starting_with(&body.client_path);
                }
            }
            let excluded = body.client_path.clone();
            self.broadcast_except(
                &Message {
                    header,
                    body: MessageBody::ClientPath(body),
                },
                &excluded,
            );
        }
    }

    fn process_agent_information_messages(&mut self) {
        while let Some(message) = self.agent_information_messages.pop_front() {
            let mut header = message.header;
            let MessageBody::AgentInformation(body) = message.body else {
                unreachable!()
            };
            let Some(entry) = find_client(&mut self.registered_clients, &body.client_identity)
            else {
                debug!(
                    "dropping agent information for unknown {}",
                    body.client_identity
                );
                continue;
            };
            if !body.agent_information.newer_than(&entry.agent_information) {
                // stale or same version: no update, no rebroadcast
                continue;
            }
            entry.agent_information = body.agent_information.clone();
            header.version = PROTOCOL_VERSION;
            self.broadcast_except(
                &Message {
                    header,
                    body: MessageBody::AgentInformation(body),
                },
                &[],
            );
        }
    }

    fn process_pending_function_calls(&mut self) {
        let now = utc_time();
        let mut index = 0;
        while index < self.pending_function_calls.len() {
            if self.pending_function_calls[index].fire_at > now {
                index += 1;
                continue;
            }
            // remove before running so the action can push new calls
            let call = self.pending_function_calls.remove(index);
            match call.action {
                Action::ReconnectOutbound { endpoint } => {
                    if !self.shutting_down {
                        self.start_outbound_connection(endpoint)
                    }
                }
            }
        }
    }

    fn process_registered_clients(&mut self) {
        self.registered_clients
            .retain(|client| !client.paths.is_empty());
    }

    pub fn local_identity(&self) -> &Identity {
        &self.local_identity
    }

    /// The acceptor's bound address, when the server is enabled.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Source-route a payload along an explicit path (starting with the
    /// local identity).
    pub fn relay(&mut self, path: Vec<Identity>, payload: Vec<u8>) {
        self.relay_messages
            .push_back(Message::relay(self.local_identity.clone(), path, payload));
    }

    /// Route a payload along the earliest-learned path to `identity`.
    pub fn relay_to(&mut self, identity: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let path = self
            .fastest_path_to_identity(identity)
            .with_context(|| format!("no known path to {identity}"))?;
        self.relay(path, payload);
        Ok(())
    }

    pub fn fastest_path_to_identity(&self, identity: &str) -> Option<Vec<Identity>> {
        self.registered_clients
            .iter()
            .find(|client| client.identity == identity)?
            .fastest_path()
            .cloned()
    }

    /// Bump the local agent information version and gossip it.
    pub fn disclose_agent_information(&mut self) {
        self.agent_information.version += 1;
        self.publish_agent_information(self.agent_information.clone());
    }

    /// Replace the local agent information record and gossip it. Stale
    /// versions are dropped by the ordinary processing path.
    pub fn publish_agent_information(&mut self, agent_information: AgentInformation) {
        self.agent_information = agent_information.clone();
        self.agent_information_messages.push_back(Message::agent_information(
            self.local_identity.clone(),
            agent_information,
        ));
    }

    /// Payloads relayed to this client, in delivery order.
    pub fn poll_received_messages(&mut self) -> Vec<RelayBody> {
        self.delivered_messages.drain(..).collect()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registered_clients
            .iter()
            .filter(|client| client.identity != self.local_identity)
            .map(|client| Peer {
                identity: client.identity.clone(),
                paths: client.paths.clone(),
                agent_information: client.agent_information.clone(),
            })
            .collect()
    }

    /// Stop accepting, close every link and suppress reconnects; keep
    /// ticking (or use [`run`](Self::run)) until the links drain.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("shutting down");
        self.shutting_down = true;
        self.acceptor_cancel.cancel();
        self.pending_function_calls.clear();
        for link in &self.authenticated_connections {
            link.close();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.acceptor_cancel.cancel();
        for link in &self.authenticated_connections {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_key_pair;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn identity(key: usize) -> Identity {
        test_key_pair(key).identity().unwrap()
    }

    fn mesh_client(
        runtime: &Runtime,
        key: usize,
        approved: &[usize],
        remotes: Vec<String>,
    ) -> Client {
        let mut config = ClientConfig::new(test_key_pair(key));
        config.enable_server = true;
        config.server_bind_port = 0;
        config.remote_endpoints = remotes;
        config.approved_identities = approved.iter().map(|&key| identity(key)).collect();
        config.reconnect_delay_in_seconds = 1;
        Client::new(
            config,
            AgentInformation::new(1, vec![key as u8]),
            runtime.handle().clone(),
        )
        .unwrap()
    }

    fn endpoint_of(client: &Client) -> String {
        format!("127.0.0.1:{}", client.server_addr().unwrap().port())
    }

    fn pump(clients: &mut Vec<Client>, done: impl Fn(&Vec<Client>) -> bool) {
        for _ in 0..2000 {
            for client in clients.iter_mut() {
                client.tick();
            }
            if done(clients) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("mesh did not reach the expected state");
    }

    fn pump_for(clients: &mut Vec<Client>, rounds: usize) {
        for _ in 0..rounds {
            for client in clients.iter_mut() {
                client.tick();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn two_peers_authenticate_and_exchange_paths() {
        let runtime = runtime();
        let a = mesh_client(&runtime, 0, &[1], Vec::new());
        let b = mesh_client(&runtime, 1, &[0], vec![endpoint_of(&a)]);
        let mut clients = vec![a, b];

        pump(&mut clients, |clients| {
            clients[0].peers().len() == 1 && clients[1].peers().len() == 1
        });

        let a_peers = clients[0].peers();
        assert_eq!(a_peers[0].identity, identity(1));
        assert_eq!(a_peers[0].paths, vec![vec![identity(0), identity(1)]]);
        let b_peers = clients[1].peers();
        assert_eq!(b_peers[0].identity, identity(0));
        assert_eq!(b_peers[0].paths, vec![vec![identity(1), identity(0)]]);
        // at most one link per remote identity
        assert_eq!(clients[0].authenticated_connections.len(), 1);
        assert_eq!(clients[1].authenticated_connections.len(), 1);
    }

    fn three_peer_mesh(runtime: &Runtime) -> Vec<Client> {
        let a = mesh_client(runtime, 0, &[1], Vec::new());
        let b = mesh_client(runtime, 1, &[0, 2], vec![endpoint_of(&a)]);
        let c = mesh_client(runtime, 2, &[1], vec![endpoint_of(&b)]);
        let mut clients = vec![a, b, c];
        pump(&mut clients, |clients| {
            clients[0]
                .fastest_path_to_identity(&identity(2))
                .is_some_and(|path| path == vec![identity(0), identity(1), identity(2)])
                && clients[2]
                    .fastest_path_to_identity(&identity(0))
                    .is_some_and(|path| path == vec![identity(2), identity(1), identity(0)])
        });
        clients
    }

    #[test]
    fn three_peer_transit_delivers_exactly_once() {
        let runtime = runtime();
        let mut clients = three_peer_mesh(&runtime);

        clients[0].relay_to(&identity(2), b"hello".to_vec()).unwrap();
        let mut delivered = Vec::new();
        for _ in 0..1000 {
            for client in clients.iter_mut() {
                client.tick();
            }
            delivered.extend(clients[2].poll_received_messages());
            if !delivered.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        pump_for(&mut clients, 20);
        delivered.extend(clients[2].poll_received_messages());

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].origin_identity, identity(0));
        assert_eq!(delivered[0].payload, b"hello");
        assert!(delivered[0].path.is_empty());
        // transit must not deliver at the forwarder
        assert!(clients[1].poll_received_messages().is_empty());
    }

    #[test]
    fn relay_to_self_short_circuits() {
        let runtime = runtime();
        let mut clients = vec![mesh_client(&runtime, 0, &[], Vec::new())];
        let local = identity(0);
        clients[0].relay_to(&local, b"note".to_vec()).unwrap();
        clients[0].tick();
        let delivered = clients[0].poll_received_messages();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].origin_identity, local);
    }

    #[test]
    fn losing_the_transit_peer_deregisters_paths() {
        let runtime = runtime();
        let mut clients = three_peer_mesh(&runtime);

        clients[1].shutdown();
        pump(&mut clients, |clients| {
            clients[0].peers().is_empty() && clients[2].peers().is_empty()
        });
        // the local trivial path is untouched
        assert_eq!(
            clients[0].fastest_path_to_identity(&identity(0)),
            Some(vec![identity(0)])
        );
    }

    #[test]
    fn cyclic_path_announcements_are_dropped() {
        let runtime = runtime();
        let a = mesh_client(&runtime, 0, &[1], Vec::new());
        let b = mesh_client(&runtime, 1, &[0], vec![endpoint_of(&a)]);
        let mut clients = vec![a, b];
        pump(&mut clients, |clients| {
            clients[0].peers().len() == 1 && clients[1].peers().len() == 1
        });
        let paths_before: Vec<_> = clients[0]
            .peers()
            .into_iter()
            .map(|peer| peer.paths)
            .collect();

        // as if b forwarded a path that already runs through us, and one
        // that terminates at us
        clients[0].client_path_messages.push_back(Message::client_path(
            vec![identity(0), identity(1), identity(0)],
            true,
        ));
        clients[0].client_path_messages.push_back(Message::client_path(
            vec![identity(1), identity(0)],
            true,
        ));
        pump_for(&mut clients, 10);

        let paths_after: Vec<_> = clients[0]
            .peers()
            .into_iter()
            .map(|peer| peer.paths)
            .collect();
        assert_eq!(paths_before, paths_after);
        assert_eq!(
            clients[0].fastest_path_to_identity(&identity(0)),
            Some(vec![identity(0)])
        );
    }

    #[test]
    fn unapproved_identity_is_refused_and_redialed() {
        let runtime = runtime();
        // a approves nobody, so b authenticates fine but is refused
        let a = mesh_client(&runtime, 0, &[], Vec::new());
        let b = mesh_client(&runtime, 1, &[0], vec![endpoint_of(&a)]);
        let mut clients = vec![a, b];

        pump_for(&mut clients, 150);
        assert!(clients[0].peers().is_empty());
        assert!(clients[1].peers().is_empty());
        assert!(clients[0].authenticated_connections.is_empty());
        // b is always either dialing, authenticating, holding the link a
        // is about to drop on it, or waiting to retry
        let b = &clients[1];
        assert!(
            !b.pending_function_calls.is_empty()
                || !b.pending_outbound_connections.is_empty()
                || !b.authentication_attempts.is_empty()
                || !b.authenticated_connections.is_empty()
        );
    }

    #[test]
    fn agent_information_versions_are_monotonic() {
        let runtime = runtime();
        let a = mesh_client(&runtime, 0, &[1], Vec::new());
        let b = mesh_client(&runtime, 1, &[0], vec![endpoint_of(&a)]);
        let mut clients = vec![a, b];
        pump(&mut clients, |clients| {
            clients[0].peers().len() == 1 && clients[1].peers().len() == 1
        });

        clients[1].publish_agent_information(AgentInformation::new(5, b"five".to_vec()));
        pump(&mut clients, |clients| {
            clients[0].peers()[0].agent_information.version == 5
        });

        clients[1].publish_agent_information(AgentInformation::new(3, b"three".to_vec()));
        pump_for(&mut clients, 20);
        assert_eq!(clients[0].peers()[0].agent_information.version, 5);
        assert_eq!(clients[0].peers()[0].agent_information.payload, b"five");

        clients[1].publish_agent_information(AgentInformation::new(7, b"seven".to_vec()));
        pump(&mut clients, |clients| {
            clients[0].peers()[0].agent_information.version == 7
        });
    }
}
