//! Per-host cluster identity and a `/health/cluster` readiness endpoint for
//! an external multi-host orchestrator to poll when running one coordinator
//! and its workers across more than one machine.
//!
//! Cluster mode is opt-in via `CLUSTER_ENABLED=true`. When disabled (the
//! default) the binary runs standalone and `NodeState` is permanently
//! `Standalone`. There is no leader election here — the core has exactly one
//! designated coordinator per run, assigned out of band by whatever starts
//! the processes — so this module only reports identity and join progress,
//! not consensus state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tracing::{error, info};

/// Cluster configuration parsed from environment variables.
///
/// All fields have defaults so the struct is always constructable even when
/// `CLUSTER_ENABLED=false` (the default).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Whether cluster mode is enabled. Default: `false`.
    pub enabled: bool,

    /// Stable node identity used in metric labels and health responses.
    /// Defaults to `HOSTNAME` env var, then `"unknown-node"`.
    pub node_id: String,

    /// Geographic region tag attached to all emitted metrics.
    /// Defaults to `"local"` in standalone mode, `"unknown"` in cluster mode
    /// unless `CLUSTER_REGION` is set.
    pub region: String,

    /// Address for the HTTP health check endpoint polled by the orchestrator.
    pub health_addr: String,

    /// Peer addresses for this run, parsed from `CLUSTER_NODES`.
    pub nodes: Vec<String>,
}

impl ClusterConfig {
    /// Parse cluster configuration from environment variables.
    pub fn from_env() -> Self {
        let enabled = std::env::var("CLUSTER_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        let node_id = std::env::var("CLUSTER_NODE_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-node".to_string())
        });

        let region = std::env::var("CLUSTER_REGION").unwrap_or_else(|_| {
            if enabled {
                "unknown".to_string()
            } else {
                "local".to_string()
            }
        });

        let health_addr =
            std::env::var("CLUSTER_HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let nodes = std::env::var("CLUSTER_NODES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Self {
            enabled,
            node_id,
            region,
            health_addr,
            nodes,
        }
    }

    /// Create a cluster config for testing purposes (cluster disabled).
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            enabled: false,
            node_id: "test-node".to_string(),
            region: "local".to_string(),
            health_addr: "0.0.0.0:8080".to_string(),
            nodes: vec![],
        }
    }
}

/// This node's membership state.
///
/// In standalone mode the state is permanently `Standalone`. In cluster mode
/// a node starts `Joining` until the orchestrator marks it `Ready` to take
/// part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Cluster mode disabled — node operates standalone.
    Standalone,
    /// Cluster enabled; not yet confirmed ready to take load.
    Joining,
    /// In cluster and ready to take load.
    Ready,
}

impl NodeState {
    /// Returns the lowercase string used in health responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Standalone => "standalone",
            NodeState::Joining => "joining",
            NodeState::Ready => "ready",
        }
    }

    /// Returns true once the node is ready to take part in a run.
    pub fn cluster_ready(&self) -> bool {
        matches!(self, NodeState::Standalone | NodeState::Ready)
    }
}

/// Shared cluster state handle — cheap to clone, safe to share across tasks.
#[derive(Clone)]
pub struct ClusterHandle {
    state: Arc<Mutex<NodeState>>,
    config: ClusterConfig,
}

impl ClusterHandle {
    /// Create a new handle. Initial state is `Joining` if cluster is enabled,
    /// `Standalone` otherwise.
    pub fn new(config: ClusterConfig) -> Self {
        let initial_state = if config.enabled {
            NodeState::Joining
        } else {
            NodeState::Standalone
        };
        Self {
            state: Arc::new(Mutex::new(initial_state)),
            config,
        }
    }

    /// Returns the current node state.
    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }

    /// Transitions to a new state, called by whatever external orchestrator
    /// tracks readiness across hosts.
    pub fn set_state(&self, new_state: NodeState) {
        let old = {
            let mut guard = self.state.lock().unwrap();
            let old = *guard;
            *guard = new_state;
            old
        };
        info!(
            node_id = %self.config.node_id,
            region = %self.config.region,
            old_state = old.as_str(),
            new_state = new_state.as_str(),
            "cluster node state changed"
        );
    }

    /// The cluster configuration for this node.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The region label to attach to metrics.
    pub fn region(&self) -> &str {
        &self.config.region
    }
}

/// JSON body returned by `GET /health/cluster`.
#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    state: String,
    node_id: String,
    region: String,
    cluster_enabled: bool,
    cluster_ready: bool,
    peers: usize,
}

async fn health_handler(
    req: Request<Body>,
    handle: ClusterHandle,
) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/health/cluster" {
        return Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap());
    }

    let state = handle.state();
    let response = HealthResponse {
        state: state.as_str().to_string(),
        node_id: handle.config().node_id.clone(),
        region: handle.region().to_string(),
        cluster_enabled: handle.config().enabled,
        cluster_ready: state.cluster_ready(),
        peers: handle.config().nodes.len(),
    };

    let body = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap())
}

/// Starts the cluster health check HTTP server.
///
/// Serves `GET /health/cluster` returning JSON with the node's current
/// membership state. All other paths return 404.
pub async fn start_health_server(handle: ClusterHandle) {
    let addr: SocketAddr = handle
        .config()
        .health_addr
        .parse()
        .unwrap_or_else(|_| ([0, 0, 0, 0], 8080).into());

    let make_svc = make_service_fn(move |_conn| {
        let handle_clone = handle.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let handle_inner = handle_clone.clone();
                async move { health_handler(req, handle_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "cluster health endpoint started");

    if let Err(e) = server.await {
        error!(error = %e, "cluster health server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_mode_by_default() {
        let config = ClusterConfig::for_testing();
        let handle = ClusterHandle::new(config);
        assert_eq!(handle.state(), NodeState::Standalone);
        assert!(handle.state().cluster_ready());
    }

    #[test]
    fn cluster_enabled_starts_joining() {
        let mut config = ClusterConfig::for_testing();
        config.enabled = true;
        config.region = "us-central1".to_string();
        let handle = ClusterHandle::new(config);
        assert_eq!(handle.state(), NodeState::Joining);
        assert!(!handle.state().cluster_ready());
    }

    #[test]
    fn state_transitions() {
        let mut config = ClusterConfig::for_testing();
        config.enabled = true;
        let handle = ClusterHandle::new(config);

        handle.set_state(NodeState::Ready);
        assert_eq!(handle.state(), NodeState::Ready);
        assert!(handle.state().cluster_ready());

        handle.set_state(NodeState::Joining);
        assert_eq!(handle.state(), NodeState::Joining);
        assert!(!handle.state().cluster_ready());
    }

    #[test]
    fn node_state_strings() {
        assert_eq!(NodeState::Standalone.as_str(), "standalone");
        assert_eq!(NodeState::Joining.as_str(), "joining");
        assert_eq!(NodeState::Ready.as_str(), "ready");
    }

    #[test]
    fn region_defaults_to_local_in_standalone() {
        let config = ClusterConfig::for_testing();
        assert_eq!(config.region, "local");
    }

    #[test]
    fn static_nodes_parsed_from_string() {
        let nodes_str = "10.1.0.1:7000, 10.2.0.1:7000, 10.3.0.1:7000";
        let nodes: Vec<String> = nodes_str
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], "10.1.0.1:7000");
        assert_eq!(nodes[2], "10.3.0.1:7000");
    }

    #[test]
    fn handle_clone_shares_state() {
        let config = ClusterConfig::for_testing();
        let handle1 = ClusterHandle::new(config);
        let handle2 = handle1.clone();

        handle1.set_state(NodeState::Joining);
        assert_eq!(handle2.state(), NodeState::Joining);
    }
}
