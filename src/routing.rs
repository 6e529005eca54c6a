//! Per-identity routing entries.
//!
//! Each entry keeps the paths learned towards one identity, in arrival
//! order. A path is an identity list starting at the local client and
//! ending at the entry's identity; the register-time filter only admits
//! paths whose identities are pairwise distinct, so the local identity
//! can never reappear past the front and no stored path contains a cycle.

use crate::crypto::Identity;
use crate::message::AgentInformation;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub identity: Identity,
    pub agent_information: AgentInformation,
    pub paths: Vec<Vec<Identity>>,
}

impl ClientInfo {
    pub fn new(identity: Identity, agent_information: AgentInformation) -> Self {
        Self {
            identity,
            agent_information,
            paths: Vec::new(),
        }
    }

    /// Store a path if it is not already known. Returns whether the path
    /// was inserted; a duplicate must not be re-broadcast.
    pub fn register_path(&mut self, path: Vec<Identity>) -> bool {
        if self.paths.contains(&path) {
            return false;
        }
        self.paths.push(path);
        true
    }

    /// Drop every path that depends on `prefix`.
    pub fn deregister_paths_starting_with(&mut self, prefix: &[Identity]) {
        self.paths.retain(|path| !path.starts_with(prefix))
    }

    /// The earliest-learned path; callers must not assume it is shortest.
    pub fn fastest_path(&self) -> Option<&Vec<Identity>> {
        self.paths.first()
    }
}

/// A path may be stored or forwarded only if no identity appears twice.
pub fn path_is_acyclic(path: &[Identity]) -> bool {
    path.iter()
        .enumerate()
        .all(|(index, identity)| !path[..index].contains(identity))
}

pub fn find_client<'a>(
    clients: &'a mut [ClientInfo],
    identity: &str,
) -> Option<&'a mut ClientInfo> {
    clients.iter_mut().find(|client| client.identity == identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(identity: &str) -> ClientInfo {
        ClientInfo::new(identity.into(), AgentInformation::default())
    }

    fn path(identities: &[&str]) -> Vec<Identity> {
        identities.iter().map(|identity| identity.to_string()).collect()
    }

    #[test]
    fn duplicate_paths_register_once() {
        let mut client = entry("c");
        assert!(client.register_path(path(&["a", "b", "c"])));
        assert!(!client.register_path(path(&["a", "b", "c"])));
        assert!(client.register_path(path(&["a", "d", "c"])));
        assert_eq!(client.paths.len(), 2);
    }

    #[test]
    fn fastest_path_is_first_learned() {
        let mut client = entry("c");
        client.register_path(path(&["a", "b", "c"]));
        client.register_path(path(&["a", "c"]));
        // arrival order wins, even over a shorter path
        assert_eq!(client.fastest_path(), Some(&path(&["a", "b", "c"])));
    }

    #[test]
    fn deregister_removes_dependent_paths() {
        let mut client = entry("d");
        client.register_path(path(&["a", "b", "d"]));
        client.register_path(path(&["a", "b", "c", "d"]));
        client.register_path(path(&["a", "c", "d"]));
        client.deregister_paths_starting_with(&path(&["a", "b"]));
        assert_eq!(client.paths, vec![path(&["a", "c", "d"])]);
        client.deregister_paths_starting_with(&path(&["a", "c", "d"]));
        assert!(client.paths.is_empty());
    }

    #[test]
    fn cycle_detection() {
        assert!(path_is_acyclic(&path(&["a"])));
        assert!(path_is_acyclic(&path(&["a", "b", "c"])));
        assert!(!path_is_acyclic(&path(&["a", "b", "a"])));
        assert!(!path_is_acyclic(&path(&["a", "a"])));
        assert!(!path_is_acyclic(&path(&["a", "b", "c", "b"])));
    }
}
