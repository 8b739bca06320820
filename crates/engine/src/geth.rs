//! [`ChainEngine`] backed by an external `geth` binary.
//!
//! Each handle owns one child process started with its own data directory
//! and port set. Control traffic after start-up (`admin_*`) goes through the
//! node's HTTP endpoint.

use crate::client::RpcClient;
use crate::keystore::first_account;
use crate::{
    ChainEngine, EngineClient, EngineError, EngineHandle, EngineResult, EngineSpec, Enode,
};
use async_trait::async_trait;
use ethers::types::Address;
use ethers::utils::to_checksum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_GETH_BINARY: &str = "geth";
pub const DEFAULT_PASSWORD: &str = "password";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

const RPC_MODULES: &str = "eth,net,web3,personal,admin,miner,txpool";
const MAX_PEERS: u32 = 50;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PASSWORD_FILE: &str = "password.txt";
const LOG_FILE: &str = "geth.log";
/// How long geth gets to flush its state after SIGINT before it is killed.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct GethEngine {
    binary: PathBuf,
    password: String,
    startup_timeout: Duration,
}

impl Default for GethEngine {
    fn default() -> Self {
        Self::new(DEFAULT_GETH_BINARY)
    }
}

impl GethEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            password: DEFAULT_PASSWORD.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

#[async_trait]
impl ChainEngine for GethEngine {
    async fn create(&self, spec: &EngineSpec) -> EngineResult<Arc<dyn EngineHandle>> {
        Ok(Arc::new(GethHandle::new(
            self.binary.clone(),
            spec.clone(),
            self.password.clone(),
            self.startup_timeout,
        )))
    }

    async fn open_client(&self, endpoint: &str) -> EngineResult<Arc<dyn EngineClient>> {
        Ok(Arc::new(RpcClient::new(endpoint)?))
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct NodeInfo {
    enode: String,
}

pub struct GethHandle {
    binary: PathBuf,
    spec: EngineSpec,
    password: String,
    startup_timeout: Duration,
    etherbase: Mutex<Option<Address>>,
    account: Mutex<Option<Address>>,
    process: Mutex<Option<Child>>,
    rpc: RwLock<Option<Arc<RpcClient>>>,
}

impl GethHandle {
    pub fn new(
        binary: PathBuf,
        spec: EngineSpec,
        password: String,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            binary,
            spec,
            password,
            startup_timeout,
            etherbase: Mutex::new(None),
            account: Mutex::new(None),
            process: Mutex::new(None),
            rpc: RwLock::new(None),
        }
    }

    fn data_dir(&self) -> &Path {
        &self.spec.data_dir
    }

    fn password_file(&self) -> PathBuf {
        self.data_dir().join(PASSWORD_FILE)
    }

    async fn write_password_file(&self) -> EngineResult<PathBuf> {
        let path = self.password_file();
        tokio::fs::write(&path, &self.password)
            .await
            .map_err(|e| EngineError::io("writing password file", e))?;
        Ok(path)
    }

    /// Run a one-shot geth subcommand against this node's data directory.
    async fn run(&self, args: &[&str]) -> EngineResult<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--datadir")
            .arg(self.data_dir())
            .args(args)
            .stdin(Stdio::null());
        let rendered = format!("{} {}", self.binary.display(), args.join(" "));
        debug!("Running `{}` for {}", rendered, self.spec.name);

        let output = command
            .output()
            .await
            .map_err(|e| EngineError::io(format!("running `{rendered}`"), e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Command {
                command: rendered,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    pub(crate) fn command_args(
        &self,
        etherbase: Option<Address>,
        unlock: Option<Address>,
    ) -> Vec<String> {
        let spec = &self.spec;
        let mut args = vec![
            "--datadir".to_string(),
            spec.data_dir.display().to_string(),
            "--networkid".to_string(),
            spec.network_id.to_string(),
            "--syncmode".to_string(),
            "full".to_string(),
            "--maxpeers".to_string(),
            MAX_PEERS.to_string(),
            "--nat".to_string(),
            "none".to_string(),
            "--port".to_string(),
            spec.p2p_port.to_string(),
            "--http".to_string(),
            "--http.addr".to_string(),
            spec.host.clone(),
            "--http.port".to_string(),
            spec.rpc_port.to_string(),
            "--http.api".to_string(),
            RPC_MODULES.to_string(),
            "--http.corsdomain".to_string(),
            "*".to_string(),
            "--http.vhosts".to_string(),
            "*".to_string(),
            "--miner.gasprice".to_string(),
            spec.gas_price.to_string(),
        ];

        if spec.discovery_port != 0 {
            args.extend(["--discovery.port".to_string(), spec.discovery_port.to_string()]);
        } else {
            args.push("--nodiscover".to_string());
        }

        if spec.ws_port != 0 {
            args.extend([
                "--ws".to_string(),
                "--ws.addr".to_string(),
                spec.host.clone(),
                "--ws.port".to_string(),
                spec.ws_port.to_string(),
                "--ws.api".to_string(),
                RPC_MODULES.to_string(),
                "--ws.origins".to_string(),
                "*".to_string(),
            ]);
        }

        if let Some(etherbase) = etherbase {
            args.extend([
                "--miner.etherbase".to_string(),
                to_checksum(&etherbase, None),
            ]);
        }

        if let Some(account) = unlock {
            args.extend([
                "--unlock".to_string(),
                to_checksum(&account, None),
                "--password".to_string(),
                self.password_file().display().to_string(),
                "--allow-insecure-unlock".to_string(),
            ]);
        }

        if spec.miner {
            args.extend([
                "--mine".to_string(),
                "--miner.threads".to_string(),
                spec.mining_threads.to_string(),
            ]);
        }

        args
    }

    /// Poll the HTTP endpoint until it answers, bailing out if the process
    /// dies first.
    async fn wait_ready(&self, child: &mut Child, rpc: &RpcClient) -> EngineResult<()> {
        let poll = async {
            loop {
                if let Some(status) = child
                    .try_wait()
                    .map_err(|e| EngineError::io("polling geth process", e))?
                {
                    return Err(EngineError::ProcessExited(status.to_string()));
                }
                match rpc.block_number().await {
                    Ok(height) => {
                        debug!("{} answered at height {}", self.spec.name, height);
                        return Ok(());
                    }
                    Err(_) => sleep(READY_POLL_INTERVAL).await,
                }
            }
        };
        tokio::time::timeout(self.startup_timeout, poll)
            .await
            .map_err(|_| EngineError::StartupTimeout(self.startup_timeout))?
    }

    async fn rpc(&self) -> EngineResult<Arc<RpcClient>> {
        self.rpc
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::NotStarted(self.spec.name.clone()))
    }
}

#[async_trait]
impl EngineHandle for GethHandle {
    async fn init_genesis(&self, genesis: Option<&Path>) -> EngineResult<bool> {
        let chain_data = self.data_dir().join("geth").join("chaindata");
        if tokio::fs::try_exists(&chain_data).await.unwrap_or(false) {
            debug!("Chain data for {} already initialized", self.spec.name);
            return Ok(false);
        }
        let Some(genesis) = genesis else {
            info!(
                "No genesis file for {}, geth will use its built-in genesis",
                self.spec.name
            );
            return Ok(false);
        };

        let genesis = genesis.display().to_string();
        self.run(&["init", &genesis]).await?;
        info!("Initialized genesis for {} from {}", self.spec.name, genesis);
        Ok(true)
    }

    async fn ensure_account(&self) -> EngineResult<Address> {
        let keystore = self.data_dir().join("keystore");
        if let Some(account) = first_account(&keystore).await? {
            *self.account.lock().await = Some(account);
            return Ok(account);
        }

        let password_file = self.write_password_file().await?;
        let password_file = password_file.display().to_string();
        self.run(&["account", "new", "--password", &password_file])
            .await?;

        let account = first_account(&keystore).await?.ok_or_else(|| {
            EngineError::Keystore(format!("geth created no key file in {}", keystore.display()))
        })?;
        info!(
            "Created new account {} for {}",
            to_checksum(&account, None),
            self.spec.name
        );
        *self.account.lock().await = Some(account);
        Ok(account)
    }

    async fn set_etherbase(&self, address: Address) {
        *self.etherbase.lock().await = Some(address);
    }

    async fn start(&self) -> EngineResult<()> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Ok(());
        }

        let etherbase = *self.etherbase.lock().await;
        let unlock = *self.account.lock().await;
        if unlock.is_some() {
            self.write_password_file().await?;
        }

        let log_path = self.data_dir().join(LOG_FILE);
        let log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|e| EngineError::io(format!("creating {}", log_path.display()), e))?;
        let log_err = log
            .try_clone()
            .await
            .map_err(|e| EngineError::io("duplicating log handle", e))?;
        let (log, log_err) = (log.into_std().await, log_err.into_std().await);

        let mut child = Command::new(&self.binary)
            .args(self.command_args(etherbase, unlock))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::io(format!("spawning {}", self.binary.display()), e))?;

        let rpc = Arc::new(RpcClient::new(&self.spec.rpc_endpoint())?);
        if let Err(err) = self.wait_ready(&mut child, &rpc).await {
            warn!(
                "{} failed to come up, see {}: {}",
                self.spec.name,
                log_path.display(),
                err
            );
            let _ = child.kill().await;
            return Err(err);
        }

        info!("Started geth for {} (pid {:?})", self.spec.name, child.id());
        *self.rpc.write().await = Some(rpc);
        *process = Some(child);
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        if let Some(rpc) = self.rpc.write().await.take() {
            rpc.close();
        }
        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };
        shutdown_child(&mut child, &self.spec.name, STOP_GRACE_PERIOD).await?;
        debug!("Stopped geth for {}", self.spec.name);
        Ok(())
    }

    async fn peer_address(&self) -> EngineResult<String> {
        let rpc = self.rpc().await?;
        let info: NodeInfo = rpc
            .request("admin_nodeInfo", ())
            .await
            .map_err(|e| EngineError::NetworkUnavailable(format!("{}: {e}", self.spec.name)))?;
        Ok(info.enode)
    }

    async fn add_peer(&self, peer: &Enode) -> EngineResult<()> {
        let rpc = self.rpc().await?;
        let url = peer.to_string();
        let accepted: bool = rpc.request("admin_addPeer", [url.as_str()]).await?;
        if accepted {
            Ok(())
        } else {
            Err(EngineError::PeerRejected(url))
        }
    }
}

/// Interrupt `child` and wait up to `grace` for it to exit, killing it
/// afterwards. geth only persists its in-memory state on a clean exit.
async fn shutdown_child(child: &mut Child, name: &str, grace: Duration) -> EngineResult<()> {
    if let Err(e) = interrupt(child) {
        warn!("Failed to interrupt geth for {}: {}", name, e);
    } else {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("geth for {} exited with {}", name, status);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Failed to wait for geth of {}: {}", name, e),
            Err(_) => warn!("geth for {} ignored SIGINT for {:?}, killing it", name, grace),
        }
    }
    child
        .kill()
        .await
        .map_err(|e| EngineError::io(format!("stopping geth for {name}"), e))
}

#[cfg(unix)]
fn interrupt(child: &Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    // SAFETY: `pid` belongs to a child we have not waited on yet.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(dir: &Path) -> EngineSpec {
        EngineSpec {
            name: "node1".to_string(),
            data_dir: dir.to_path_buf(),
            network_id: 1337,
            chain_id: 1337,
            host: "127.0.0.1".to_string(),
            p2p_port: 30303,
            discovery_port: 30301,
            rpc_port: 8545,
            ws_port: 8546,
            miner: true,
            mining_threads: 2,
            gas_price: 1,
        }
    }

    fn handle(spec: EngineSpec) -> GethHandle {
        GethHandle::new(
            PathBuf::from("/nonexistent/geth"),
            spec,
            DEFAULT_PASSWORD.to_string(),
            Duration::from_secs(1),
        )
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .map(|i| args[i + 1].as_str())
    }

    #[test]
    fn command_args_bind_node_ports() {
        let dir = TempDir::new().unwrap();
        let args = handle(spec(dir.path())).command_args(None, None);

        assert_eq!(value_of(&args, "--networkid"), Some("1337"));
        assert_eq!(value_of(&args, "--port"), Some("30303"));
        assert_eq!(value_of(&args, "--discovery.port"), Some("30301"));
        assert_eq!(value_of(&args, "--http.port"), Some("8545"));
        assert_eq!(value_of(&args, "--ws.port"), Some("8546"));
        assert_eq!(value_of(&args, "--http.api"), Some(RPC_MODULES));
        assert_eq!(value_of(&args, "--miner.threads"), Some("2"));
        assert!(args.contains(&"--mine".to_string()));
        assert!(!args.contains(&"--unlock".to_string()));
    }

    #[test]
    fn command_args_set_etherbase_and_unlock_account() {
        let dir = TempDir::new().unwrap();
        let etherbase = Address::from_low_u64_be(0xabc);
        let account = Address::from_low_u64_be(0xdef);
        let args = handle(spec(dir.path())).command_args(Some(etherbase), Some(account));

        assert_eq!(
            value_of(&args, "--miner.etherbase"),
            Some(to_checksum(&etherbase, None).as_str())
        );
        assert_eq!(
            value_of(&args, "--unlock"),
            Some(to_checksum(&account, None).as_str())
        );
        assert!(value_of(&args, "--password")
            .unwrap()
            .ends_with(PASSWORD_FILE));
    }

    #[test]
    fn command_args_skip_disabled_services() {
        let dir = TempDir::new().unwrap();
        let mut spec = spec(dir.path());
        spec.ws_port = 0;
        spec.discovery_port = 0;
        spec.miner = false;
        let args = handle(spec).command_args(None, None);

        assert!(!args.contains(&"--ws".to_string()));
        assert!(!args.contains(&"--mine".to_string()));
        assert!(args.contains(&"--nodiscover".to_string()));
    }

    #[tokio::test]
    async fn genesis_init_is_skipped_for_existing_chain_data() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("geth").join("chaindata")).unwrap();
        let genesis = dir.path().join("genesis.json");

        let initialized = handle(spec(dir.path()))
            .init_genesis(Some(&genesis))
            .await
            .unwrap();
        assert!(!initialized);
    }

    #[tokio::test]
    async fn genesis_init_without_file_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        assert!(!handle(spec(dir.path())).init_genesis(None).await.unwrap());
    }

    #[tokio::test]
    async fn existing_keystore_account_is_reused() {
        let dir = TempDir::new().unwrap();
        let keystore = dir.path().join("keystore");
        std::fs::create_dir_all(&keystore).unwrap();
        std::fs::write(
            keystore.join("UTC--2024-01-01T00-00-00Z--01"),
            r#"{"address":"0000000000000000000000000000000000000001"}"#,
        )
        .unwrap();

        let account = handle(spec(dir.path())).ensure_account().await.unwrap();
        assert_eq!(account, Address::from_low_u64_be(1));
    }

    #[tokio::test]
    async fn missing_binary_fails_start() {
        let dir = TempDir::new().unwrap();
        let err = handle(spec(dir.path())).start().await.unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn peering_requires_a_started_node() {
        let dir = TempDir::new().unwrap();
        let handle = handle(spec(dir.path()));
        assert!(matches!(
            handle.peer_address().await,
            Err(EngineError::NotStarted(_))
        ));
        handle.stop().await.unwrap();
    }

    #[cfg(unix)]
    async fn spawn_script(dir: &Path, script: &str) -> Child {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(dir)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let ready = dir.join("ready");
        for _ in 0..100 {
            if ready.exists() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(ready.exists(), "script never became ready");
        child
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_interrupts_before_killing() {
        let dir = TempDir::new().unwrap();
        let mut child = spawn_script(
            dir.path(),
            "trap 'touch flushed; exit 0' INT; touch ready; while true; do sleep 0.1; done",
        )
        .await;

        shutdown_child(&mut child, "node1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(dir.path().join("flushed").exists());
        assert!(child.try_wait().unwrap().unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_a_process_that_ignores_interrupt() {
        let dir = TempDir::new().unwrap();
        let mut child = spawn_script(dir.path(), "trap '' INT; touch ready; exec sleep 30").await;

        let started = std::time::Instant::now();
        shutdown_child(&mut child, "node1", Duration::from_millis(300))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!child.try_wait().unwrap().unwrap().success());
    }
}
