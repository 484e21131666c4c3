//! Peer registry
//!
//! Maintains the candidate peers for health consultation, keyed by node
//! role. A background task refreshes the lists by listing nodes filtered on
//! the role labels; queries always see a coherent snapshot because the
//! refresh swaps the whole snapshot under a write lock.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const WORKER_ROLE_LABEL: &str = "node-role.kubernetes.io/worker";
pub const CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/control-plane";
/// Accepted on clusters that still label control-plane nodes the old way
pub const LEGACY_CONTROL_PLANE_ROLE_LABEL: &str = "node-role.kubernetes.io/master";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Worker,
    ControlPlane,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Worker => Role::ControlPlane,
            Role::ControlPlane => Role::Worker,
        }
    }
}

/// A peer candidate: another node running the fencing agent
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Peer {
    pub node_name: String,
    pub address: String,
}

#[derive(Clone, Debug, Default)]
struct Snapshot {
    workers: Vec<Peer>,
    control_planes: Vec<Peer>,
}

pub struct PeerRegistry {
    client: Client,
    my_node_name: String,
    snapshot: RwLock<Snapshot>,
}

impl PeerRegistry {
    pub fn new(client: Client, my_node_name: &str) -> Self {
        Self {
            client,
            my_node_name: my_node_name.to_string(),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Refresh the registry forever at the configured interval
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                warn!(%err, "peer registry refresh failed, keeping previous snapshot");
            }
        }
    }

    /// List nodes per role label and swap in a fresh snapshot
    pub async fn refresh(&self) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());

        let mut listed: Vec<Node> = Vec::new();
        for label in [
            WORKER_ROLE_LABEL,
            CONTROL_PLANE_ROLE_LABEL,
            LEGACY_CONTROL_PLANE_ROLE_LABEL,
        ] {
            let lp = ListParams::default().labels(label);
            listed.extend(nodes.list(&lp).await.map_err(Error::KubeError)?);
        }

        let snapshot = build_snapshot(&listed, &self.my_node_name);
        debug!(
            workers = snapshot.workers.len(),
            control_planes = snapshot.control_planes.len(),
            "peer registry refreshed"
        );
        *self.snapshot.write().await = snapshot;
        Ok(())
    }

    /// An unordered random subset of peers for one consultation round
    pub async fn random_batch(&self, role: Role, batch_size: usize) -> Vec<Peer> {
        let snapshot = self.snapshot.read().await;
        let pool = match role {
            Role::Worker => &snapshot.workers,
            Role::ControlPlane => &snapshot.control_planes,
        };
        pool.choose_multiple(&mut rand::thread_rng(), batch_size)
            .cloned()
            .collect()
    }

    /// Number of known peers with the given role, for quorum arithmetic
    pub async fn size(&self, role: Role) -> usize {
        let snapshot = self.snapshot.read().await;
        match role {
            Role::Worker => snapshot.workers.len(),
            Role::ControlPlane => snapshot.control_planes.len(),
        }
    }
}

/// The role a node advertises through its labels. The worker label wins for
/// nodes carrying both.
pub fn node_role(node: &Node) -> Option<Role> {
    let labels = node.labels();
    if labels.contains_key(WORKER_ROLE_LABEL) {
        return Some(Role::Worker);
    }
    if labels.contains_key(CONTROL_PLANE_ROLE_LABEL)
        || labels.contains_key(LEGACY_CONTROL_PLANE_ROLE_LABEL)
    {
        return Some(Role::ControlPlane);
    }
    None
}

fn build_snapshot(nodes: &[Node], my_node_name: &str) -> Snapshot {
    let mut snapshot = Snapshot::default();
    for node in nodes {
        let name = node.name_any();
        if name == my_node_name {
            continue;
        }
        let Some(address) = internal_address(node) else {
            debug!(node = %name, "node has no internal address, not a peer candidate");
            continue;
        };
        let peer = Peer {
            node_name: name,
            address,
        };
        match node_role(node) {
            Some(Role::Worker) => {
                if !snapshot.workers.contains(&peer) {
                    snapshot.workers.push(peer);
                }
            }
            Some(Role::ControlPlane) => {
                if !snapshot.control_planes.contains(&peer) {
                    snapshot.control_planes.push(peer);
                }
            }
            None => {}
        }
    }
    snapshot
}

fn internal_address(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn make_node(name: &str, labels: &[&str], ip: Option<&str>) -> Node {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|l| (l.to_string(), "".to_string()))
            .collect();
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            status: ip.map(|ip| NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: ip.to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_role_worker_label_wins() {
        let node = make_node(
            "n1",
            &[WORKER_ROLE_LABEL, CONTROL_PLANE_ROLE_LABEL],
            Some("10.0.0.1"),
        );
        assert_eq!(node_role(&node), Some(Role::Worker));
    }

    #[test]
    fn test_node_role_accepts_legacy_label() {
        let node = make_node("n1", &[LEGACY_CONTROL_PLANE_ROLE_LABEL], Some("10.0.0.1"));
        assert_eq!(node_role(&node), Some(Role::ControlPlane));

        let unlabeled = make_node("n2", &[], Some("10.0.0.2"));
        assert_eq!(node_role(&unlabeled), None);
    }

    #[test]
    fn test_build_snapshot_excludes_self_and_addressless_nodes() {
        let nodes = vec![
            make_node("me", &[WORKER_ROLE_LABEL], Some("10.0.0.1")),
            make_node("w1", &[WORKER_ROLE_LABEL], Some("10.0.0.2")),
            make_node("w2", &[WORKER_ROLE_LABEL], None),
            make_node("cp1", &[CONTROL_PLANE_ROLE_LABEL], Some("10.0.0.3")),
        ];

        let snapshot = build_snapshot(&nodes, "me");
        assert_eq!(snapshot.workers.len(), 1);
        assert_eq!(snapshot.workers[0].node_name, "w1");
        assert_eq!(snapshot.control_planes.len(), 1);
        assert_eq!(snapshot.control_planes[0].address, "10.0.0.3");
    }

    #[test]
    fn test_build_snapshot_deduplicates_double_listed_nodes() {
        // A node listed under both control-plane labels appears once
        let node = make_node(
            "cp1",
            &[CONTROL_PLANE_ROLE_LABEL, LEGACY_CONTROL_PLANE_ROLE_LABEL],
            Some("10.0.0.3"),
        );
        let snapshot = build_snapshot(&[node.clone(), node], "me");
        assert_eq!(snapshot.control_planes.len(), 1);
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(Role::Worker.opposite(), Role::ControlPlane);
        assert_eq!(Role::ControlPlane.opposite(), Role::Worker);
    }
}
