use crate::config::Config;
use crate::error::MiningError;
use crate::metrics;
use crate::mining::MiningService;
use crate::node::NodeManager;
use clap::Parser;
use engine::GethEngine;
use eyre::Result;
use futures::pin_mut;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Prefix of the environment variables that override configuration.
pub const ENV_PREFIX: &str = "DEVNET_";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "Private multi-node geth devnet", long_about = None)]
pub struct App {
    #[arg(long, value_name = "PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Skipped when the file does not exist.
    #[arg(long, value_name = "PATH", default_value = "genesis.json")]
    pub genesis: PathBuf,

    #[arg(long = "log-level", env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,

    #[arg(long, default_value_t = false)]
    pub full_log_context: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(self.execute())
    }

    fn init_tracing(&self) {
        let log_level = Level::from_str(&self.log_level).unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(log_level.as_str())
        } else {
            let filter_tag = format!("devnet={log_level},engine={log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if log_level == Level::DEBUG || log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    async fn execute(self) -> Result<()> {
        let mut config = Config::load_with_overrides(&self.config, Some(ENV_PREFIX))?;
        if let Some(port) = self.metrics_port {
            config.metrics.port = Some(port);
        }
        let config = Arc::new(config);
        info!(
            "Loaded {} node(s) for chain {} from {}",
            config.nodes.len(),
            config.network.chain_id,
            self.config.display()
        );

        let genesis = if self.genesis.exists() {
            Some(self.genesis.clone())
        } else {
            warn!(
                "Genesis file {} not found, nodes keep their existing chain data",
                self.genesis.display()
            );
            None
        };

        let engine = GethEngine::new(&config.engine.binary)
            .with_password(config.engine.password.clone())
            .with_startup_timeout(config.engine.startup_timeout()?);

        let shutdown = CancellationToken::new();
        if let Some(port) = config.metrics.port {
            metrics::start_server(port, shutdown.clone())?;
        }

        let devnet = Devnet::new(config, Arc::new(engine), genesis, shutdown.clone())?;
        let result = run_until_signal(devnet.run(), &shutdown).await;
        shutdown.cancel();
        devnet.shutdown().await;
        result
    }
}

/// Sequences the managed nodes from start-up to shutdown.
pub struct Devnet {
    manager: Arc<NodeManager>,
    mining: MiningService,
    shutdown: CancellationToken,
}

impl Devnet {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<dyn engine::ChainEngine>,
        genesis: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let manager = Arc::new(NodeManager::new(config, engine, genesis)?);
        let mining = MiningService::new(manager.clone())?;
        Ok(Self {
            manager,
            mining,
            shutdown,
        })
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub fn mining(&self) -> &MiningService {
        &self.mining
    }

    /// Start, peer and mine, then poll health until `shutdown` fires.
    pub async fn run(&self) -> Result<()> {
        if let Err(err) = self.manager.start_all(&self.shutdown).await {
            if self.shutdown.is_cancelled() {
                warn!("Start-up interrupted: {}", err);
                return Ok(());
            }
            return Err(err.into());
        }
        info!("All {} node(s) started", self.manager.node_count().await);

        let config = self.manager.config();
        if !self.pause(config.engine.settle_delay()?).await {
            return Ok(());
        }
        self.manager.connect_peers(&self.shutdown).await;
        if !self.pause(config.engine.peer_settle_delay()?).await {
            return Ok(());
        }

        match self.mining.start(&self.shutdown).await {
            Ok(count) => info!("Mining enabled on {} node(s)", count),
            Err(e) => warn!("Mining not started: {}", e),
        }

        self.print_node_info().await;
        self.health_loop().await;
        Ok(())
    }

    /// Sleep unless shut down first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn health_loop(&self) {
        let period = self
            .manager
            .config()
            .health_check
            .interval()
            .unwrap_or_else(|e| {
                warn!("{}, using {:?}", e, DEFAULT_HEALTH_INTERVAL);
                DEFAULT_HEALTH_INTERVAL
            });
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.manager.health_check(&self.shutdown).await;
                    if summary.unhealthy > 0 {
                        warn!(
                            "Health check: {} healthy, {} unhealthy",
                            summary.healthy, summary.unhealthy
                        );
                    } else {
                        debug!("Health check: all {} node(s) healthy", summary.healthy);
                    }
                }
            }
        }
    }

    async fn print_node_info(&self) {
        let config = self.manager.config();
        info!("Devnet is running");
        for node in self.manager.get_all_nodes().await {
            let spec = self.manager.spec_for(node.config());
            info!(
                node = %node.name(),
                rpc = %spec.rpc_endpoint(),
                ws = %spec.ws_endpoint().unwrap_or_else(|| "-".to_string()),
                account = %node.account_hex(),
                miner = node.config().miner,
                data_dir = %node.data_dir().display(),
                "Node ready"
            );
        }

        if let Some(first) = config.nodes.first() {
            info!(
                "Wallet settings: network name \"Devnet\", RPC URL {}, chain ID {}, currency symbol ETH",
                self.manager.spec_for(first).rpc_endpoint(),
                config.network.chain_id
            );
        }
    }

    /// Stop mining, then every node, within [`SHUTDOWN_TIMEOUT`]. Whatever is
    /// still running after the deadline is killed when the engine handles
    /// are dropped.
    pub async fn shutdown(&self) {
        info!("Shutting down devnet");
        let cleanup = async {
            match self.mining.stop().await {
                Ok(()) | Err(MiningError::NotRunning) => {}
                Err(e) => warn!("Failed to stop mining: {}", e),
            }
            self.manager.stop_all().await;
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, cleanup).await.is_err() {
            error!(
                "Shutdown did not complete within {:?}, abandoning remaining nodes",
                SHUTDOWN_TIMEOUT
            );
        } else {
            info!("Devnet stopped");
        }
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Drive `fut` to completion. On SIGINT or SIGTERM, cancel `shutdown` and
/// let `fut` wind down on its own.
async fn run_until_signal<F, E>(fut: F, shutdown: &CancellationToken) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut.as_mut() => return res,
    }

    shutdown.cancel();
    fut.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, HealthCheckConfig, NetworkConfig, NodeConfig};
    use engine::testing::{ClientBehavior, MockEngine};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Arc<Config> {
        Arc::new(Config {
            network: NetworkConfig {
                chain_id: 1337,
                network_id: 1337,
            },
            nodes: (1..=2u16)
                .map(|i| NodeConfig {
                    name: format!("node{i}"),
                    port: 30302 + i,
                    rpc_port: 8543 + 2 * i,
                    miner: true,
                    ..Default::default()
                })
                .collect(),
            mining: Default::default(),
            health_check: HealthCheckConfig {
                interval: "1s".to_string(),
                ..Default::default()
            },
            engine: EngineConfig {
                data_dir: dir.path().to_path_buf(),
                settle_delay: "1s".to_string(),
                peer_settle_delay: "1s".to_string(),
                ..Default::default()
            },
            metrics: Default::default(),
        })
    }

    #[test]
    fn cli_defaults() {
        let app = App::try_parse_from(["devnet"]).unwrap();
        assert_eq!(app.config, PathBuf::from("config.yaml"));
        assert_eq!(app.genesis, PathBuf::from("genesis.json"));
        assert_eq!(app.metrics_port, None);
        assert!(!app.full_log_context);
    }

    #[test]
    fn cli_overrides() {
        let app = App::try_parse_from([
            "devnet",
            "--config",
            "/etc/devnet.yaml",
            "--metrics-port",
            "9100",
            "--full-log-context",
        ])
        .unwrap();
        assert_eq!(app.config, PathBuf::from("/etc/devnet.yaml"));
        assert_eq!(app.metrics_port, Some(9100));
        assert!(app.full_log_context);
    }

    #[tokio::test(start_paused = true)]
    async fn devnet_runs_until_shutdown_then_cleans_up() {
        let dir = TempDir::new().unwrap();
        let engine = MockEngine::new();
        let shutdown = CancellationToken::new();
        let devnet = Devnet::new(
            config(&dir),
            Arc::new(engine.clone()),
            None,
            shutdown.clone(),
        )
        .unwrap();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });
        devnet.run().await.unwrap();

        assert_eq!(devnet.manager().mesh_links().await.len(), 1);
        assert!(devnet.mining().is_running().await);

        devnet.shutdown().await;
        assert!(!devnet.mining().is_running().await);
        assert!(devnet.manager().get_all_nodes().await.is_empty());
        assert!(engine.handle("node1").unwrap().is_stopped());
    }

    #[tokio::test]
    async fn devnet_fails_when_nodes_do_not_start() {
        let dir = TempDir::new().unwrap();
        let engine = MockEngine::new();
        engine.refuse_rpc_port(8547);
        let devnet = Devnet::new(
            config(&dir),
            Arc::new(engine.clone()),
            None,
            CancellationToken::new(),
        )
        .unwrap();

        let err = devnet.run().await.unwrap_err();
        assert!(err.to_string().contains("node2"));
        devnet.shutdown().await;
        assert!(engine.handle("node1").unwrap().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_interrupts_a_running_health_sweep() {
        let dir = TempDir::new().unwrap();
        let engine = MockEngine::new();
        let mut config = (*config(&dir)).clone();
        config.health_check = HealthCheckConfig {
            interval: "1s".to_string(),
            timeout: "5s".to_string(),
            retries: 3,
        };
        let shutdown = CancellationToken::new();
        let devnet = Devnet::new(
            Arc::new(config),
            Arc::new(engine.clone()),
            None,
            shutdown.clone(),
        )
        .unwrap();

        let canceller = shutdown.clone();
        let hung = engine.clone();
        tokio::spawn(async move {
            // first sweep starts at t=3s, after both settle delays
            tokio::time::sleep(Duration::from_millis(2500)).await;
            hung.set_behavior("node2", ClientBehavior::Hang);
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        devnet.run().await.unwrap();
        // cancelled at t=4s, one 5s attempt into the hung sweep
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!engine.client("node2").unwrap().is_closed());
        devnet.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(engine.client("node2").unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_on_a_stuck_node_after_the_deadline() {
        let dir = TempDir::new().unwrap();
        let engine = MockEngine::new();
        let shutdown = CancellationToken::new();
        let devnet = Devnet::new(
            config(&dir),
            Arc::new(engine.clone()),
            None,
            shutdown.clone(),
        )
        .unwrap();
        devnet.manager().start_all(&shutdown).await.unwrap();
        engine.hang_on_stop("node1");

        let started = tokio::time::Instant::now();
        devnet.shutdown().await;
        assert!(started.elapsed() >= SHUTDOWN_TIMEOUT);
        assert!(started.elapsed() < SHUTDOWN_TIMEOUT + Duration::from_secs(1));
        assert!(!engine.handle("node1").unwrap().is_stopped());
        assert!(engine.handle("node2").unwrap().is_stopped());
        assert!(engine.client("node2").unwrap().is_closed());
    }
}
