use dashmap::DashMap;
use serenity::model::id::UserId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{Node, NodeMessage, ReconnectPolicy};
use crate::{config::NodeConfig, error::NodeError};

/// Conjunto de nodos de audio disponibles
#[derive(Debug)]
pub struct NodePool {
    nodes: DashMap<String, Arc<Node>>,
    user_id: UserId,
    shard_count: u32,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<NodeMessage>,
}

impl NodePool {
    pub fn new(
        user_id: UserId,
        shard_count: u32,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<NodeMessage>,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            user_id,
            shard_count,
            policy,
            events,
        }
    }

    /// Registra un nodo y arranca su conexión
    pub fn add_node(&self, config: NodeConfig) -> Arc<Node> {
        let node = self.register(config);
        node.connect();
        node
    }

    fn register(&self, config: NodeConfig) -> Arc<Node> {
        let name = config.name.clone();
        let node = Node::new(
            config,
            self.user_id,
            self.shard_count,
            self.policy,
            self.events.clone(),
        );

        if let Some(previous) = self.nodes.insert(name.clone(), Arc::clone(&node)) {
            warn!("♻️ Nodo '{}' reemplazado", name);
            previous.destroy();
        }
        info!("📡 Nodo '{}' registrado", name);
        node
    }

    #[cfg(test)]
    pub(crate) fn register_for_tests(&self, config: NodeConfig) -> Arc<Node> {
        self.register(config)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Quita un nodo del pool y lo destruye
    pub fn remove_node(&self, name: &str) -> Option<Arc<Node>> {
        let (_, node) = self.nodes.remove(name)?;
        node.destroy();
        info!("🗑️ Nodo '{}' removido", name);
        Some(node)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.iter().filter(|entry| entry.is_connected()).count()
    }

    /// Nodo conectado con menor carga por núcleo; empata por menos llamadas REST
    pub fn least_loaded(&self) -> Result<Arc<Node>, NodeError> {
        self.least_loaded_excluding(None)
    }

    /// Igual que [`least_loaded`](Self::least_loaded) pero sin considerar `exclude`
    pub fn least_loaded_excluding(&self, exclude: Option<&str>) -> Result<Arc<Node>, NodeError> {
        self.nodes
            .iter()
            .filter(|entry| entry.is_connected() && Some(entry.key().as_str()) != exclude)
            .map(|entry| Arc::clone(entry.value()))
            .min_by(|a, b| {
                a.stats()
                    .load_score()
                    .total_cmp(&b.stats().load_score())
                    .then_with(|| a.rest_calls().cmp(&b.rest_calls()))
            })
            .ok_or(NodeError::NoAvailableNode)
    }

    /// Destruye todos los nodos (apagado del bot)
    pub fn shutdown(&self) {
        for entry in self.nodes.iter() {
            entry.value().destroy();
        }
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn config(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "pass".to_string(),
            secure: false,
        }
    }

    fn pool() -> NodePool {
        let (tx, _rx) = mpsc::unbounded_channel();
        NodePool::new(UserId::new(1), 1, ReconnectPolicy::default(), tx)
    }

    fn online(pool: &NodePool, name: &str, cores: u32, system_load: f64) -> Arc<Node> {
        let node = pool.register(config(name));
        node.connected.store(true, Ordering::Release);
        node.handle_text(&format!(
            r#"{{"op":"stats","players":0,"playingPlayers":0,"uptime":1,"cpu":{{"cores":{},"systemLoad":{},"lavalinkLoad":0.0}}}}"#,
            cores, system_load
        ));
        node
    }

    #[test]
    fn no_connected_nodes_is_an_error() {
        let pool = pool();
        pool.register(config("offline"));
        assert!(matches!(pool.least_loaded(), Err(NodeError::NoAvailableNode)));
    }

    #[test]
    fn picks_lowest_load_per_core() {
        let pool = pool();
        online(&pool, "busy", 2, 1.8);
        online(&pool, "idle", 8, 1.6);

        assert_eq!(pool.least_loaded().unwrap().name(), "idle");
        assert_eq!(pool.least_loaded_excluding(Some("idle")).unwrap().name(), "busy");
    }

    #[test]
    fn ties_break_on_rest_calls() {
        let pool = pool();
        let a = online(&pool, "a", 4, 1.0);
        online(&pool, "b", 4, 1.0);
        a.rest_calls.fetch_add(3, Ordering::Relaxed);

        assert_eq!(pool.least_loaded().unwrap().name(), "b");
    }
}
