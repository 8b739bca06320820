//! Mining coordination across the managed nodes.
//!
//! The service records a per-account mining intent for every healthy node
//! and runs a monitor that periodically compares intent with what each node
//! reports. The monitor only logs by default; with `mining.remediate` set it
//! restarts the miner on nodes that stopped.

use crate::config::ConfigError;
use crate::error::MiningError;
use crate::metrics::{ACTIVE_MINERS, MINING_MONITOR_TICKS};
use crate::node::{NodeInstance, NodeManager};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinerInfo {
    pub name: String,
    pub account: String,
    pub mining: bool,
    pub block_number: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiningStats {
    pub active_miners: usize,
    pub nodes: Vec<MinerInfo>,
}

struct MonitorTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared with the monitor task.
struct Shared {
    manager: Arc<NodeManager>,
    active: RwLock<HashMap<String, bool>>,
    ticks: AtomicU64,
    threads: usize,
    remediate: bool,
    query_timeout: Duration,
}

impl Shared {
    async fn publish_active(&self) {
        let count = self.active.read().await.values().filter(|v| **v).count();
        ACTIVE_MINERS.set(count as i64);
    }

    async fn monitor(
        self: Arc<Self>,
        interval: Duration,
        stop: CancellationToken,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("Mining monitor exited");
    }

    async fn tick(&self) {
        let nodes = self.manager.get_all_nodes().await;
        let intents = self.active.read().await.clone();

        join_all(nodes.iter().map(|node| {
            let intent = intents.get(&node.account_hex()).copied().unwrap_or(false);
            self.inspect(node, intent)
        }))
        .await;

        self.ticks.fetch_add(1, Ordering::SeqCst);
        MINING_MONITOR_TICKS.inc();
    }

    async fn inspect(&self, node: &NodeInstance, intent: bool) {
        let healthy = node.is_healthy().await;
        if !intent {
            debug!(node = %node.name(), healthy, "Node has no mining intent");
            return;
        }
        if !healthy {
            warn!(node = %node.name(), "Mining node is unhealthy");
            return;
        }
        let Some(client) = node.client().await else {
            warn!(node = %node.name(), "Mining node has no RPC client");
            return;
        };

        match tokio::time::timeout(self.query_timeout, client.is_mining()).await {
            Ok(Ok(true)) => debug!(node = %node.name(), "Node is mining"),
            Ok(Ok(false)) => {
                warn!(node = %node.name(), account = %node.account_hex(), "Node should be mining but is not");
                if self.remediate {
                    match tokio::time::timeout(self.query_timeout, client.start_mining(self.threads))
                        .await
                    {
                        Ok(Ok(())) => info!(node = %node.name(), "Restarted miner"),
                        Ok(Err(e)) => warn!(node = %node.name(), "Failed to restart miner: {}", e),
                        Err(_) => warn!(node = %node.name(), "Restarting miner timed out"),
                    }
                }
            }
            Ok(Err(e)) => warn!(node = %node.name(), "Failed to query mining status: {}", e),
            Err(_) => warn!(node = %node.name(), "Mining status query timed out"),
        }
    }
}

/// Two states, stopped and running. The monitor task exists only while
/// running.
pub struct MiningService {
    shared: Arc<Shared>,
    interval: Duration,
    monitor: Mutex<Option<MonitorTask>>,
}

impl MiningService {
    pub fn new(manager: Arc<NodeManager>) -> Result<Self, ConfigError> {
        let config = manager.config();
        let threads = config.mining.threads;
        let remediate = config.mining.remediate;
        let interval = config.mining.monitor_interval()?;
        let query_timeout = config.health_check.timeout()?;
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                active: RwLock::new(HashMap::new()),
                ticks: AtomicU64::new(0),
                threads,
                remediate,
                query_timeout,
            }),
            interval,
            monitor: Mutex::new(None),
        })
    }

    /// Set mining intent on every healthy node and launch the monitor.
    /// Returns the number of nodes enrolled.
    ///
    /// The monitor also exits when `shutdown` is cancelled; [`Self::stop`]
    /// is still required to release the mining state.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<usize, MiningError> {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return Err(MiningError::AlreadyRunning);
        }

        let mut eligible = Vec::new();
        for node in self.shared.manager.get_all_nodes().await {
            if node.is_healthy().await && node.has_handle().await {
                eligible.push((node.name().to_string(), node.account_hex()));
            }
        }
        if eligible.is_empty() {
            return Err(MiningError::NoNodesAvailable);
        }

        {
            let mut active = self.shared.active.write().await;
            for (name, account) in &eligible {
                active.insert(account.clone(), true);
                info!(node = %name, account = %account, "Mining enabled");
            }
        }
        self.shared.publish_active().await;

        let stop = CancellationToken::new();
        let handle = tokio::spawn(self.shared.clone().monitor(
            self.interval,
            stop.clone(),
            shutdown.clone(),
        ));
        *monitor = Some(MonitorTask { stop, handle });

        info!("Mining started on {} node(s)", eligible.len());
        Ok(eligible.len())
    }

    /// Stop the monitor, wait for it to exit, then clear the mining intent
    /// of every node that is still registered.
    pub async fn stop(&self) -> Result<(), MiningError> {
        let mut monitor = self.monitor.lock().await;
        let task = monitor.take().ok_or(MiningError::NotRunning)?;

        task.stop.cancel();
        if let Err(e) = task.handle.await {
            warn!("Mining monitor task failed: {}", e);
        }

        let nodes = self.shared.manager.get_all_nodes().await;
        {
            let mut active = self.shared.active.write().await;
            for node in &nodes {
                active.remove(&node.account_hex());
            }
        }
        self.shared.publish_active().await;

        info!("Mining stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Accounts with mining intent set, sorted.
    pub async fn active_miners(&self) -> Vec<String> {
        let mut accounts: Vec<_> = self
            .shared
            .active
            .read()
            .await
            .iter()
            .filter(|(_, mining)| **mining)
            .map(|(account, _)| account.clone())
            .collect();
        accounts.sort();
        accounts
    }

    /// Completed monitor passes since the service was created.
    pub fn monitor_ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    /// Snapshot of mining intent and chain height per node. Nodes whose
    /// height cannot be read are left out.
    pub async fn get_mining_stats(&self) -> MiningStats {
        let nodes = self.shared.manager.get_all_nodes().await;
        let intents = self.shared.active.read().await.clone();
        let timeout = self.shared.query_timeout;

        let rows = join_all(nodes.iter().map(|node| {
            let mining = intents.get(&node.account_hex()).copied().unwrap_or(false);
            async move {
                let Some(client) = node.client().await else {
                    warn!(node = %node.name(), "Skipping node without RPC client in mining stats");
                    return None;
                };
                let block_number = match tokio::time::timeout(timeout, client.block_number()).await
                {
                    Ok(Ok(height)) => height,
                    Ok(Err(e)) => {
                        warn!(node = %node.name(), "Failed to read block number: {}", e);
                        return None;
                    }
                    Err(_) => {
                        warn!(node = %node.name(), "Block number query timed out");
                        return None;
                    }
                };
                Some(MinerInfo {
                    name: node.name().to_string(),
                    account: node.account_hex(),
                    mining,
                    block_number,
                    healthy: node.is_healthy().await,
                })
            }
        }))
        .await;

        MiningStats {
            active_miners: intents.values().filter(|v| **v).count(),
            nodes: rows.into_iter().flatten().collect(),
        }
    }
}
