use crate::{EngineClient, EngineError, EngineResult};
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Bytes, U256};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// JSON-RPC client for a single node's HTTP endpoint.
#[derive(Debug)]
pub struct RpcClient {
    endpoint: String,
    provider: Provider<Http>,
    closed: AtomicBool,
}

impl RpcClient {
    pub fn new(endpoint: &str) -> EngineResult<Self> {
        let provider =
            Provider::<Http>::try_from(endpoint).map_err(|e| EngineError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            provider,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn provider(&self) -> EngineResult<&Provider<Http>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ClientClosed);
        }
        Ok(&self.provider)
    }

    /// Raw call for the non-standard namespaces (`admin_*`, `miner_*`).
    pub(crate) async fn request<P, R>(&self, method: &str, params: P) -> EngineResult<R>
    where
        P: Serialize + Send + Sync + Debug,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        trace!("Querying `{}` on {} with params: {:?}", method, self.endpoint, params);
        Ok(self.provider()?.request(method, params).await?)
    }
}

#[async_trait]
impl EngineClient for RpcClient {
    async fn block_number(&self) -> EngineResult<u64> {
        Ok(self.provider()?.get_block_number().await?.as_u64())
    }

    async fn balance(&self, address: Address) -> EngineResult<U256> {
        Ok(self.provider()?.get_balance(address, None).await?)
    }

    async fn nonce(&self, address: Address) -> EngineResult<U256> {
        Ok(self.provider()?.get_transaction_count(address, None).await?)
    }

    async fn code_at(&self, address: Address) -> EngineResult<Bytes> {
        Ok(self.provider()?.get_code(address, None).await?)
    }

    async fn is_mining(&self) -> EngineResult<bool> {
        self.request("eth_mining", ()).await
    }

    async fn start_mining(&self, threads: usize) -> EngineResult<()> {
        let _: serde_json::Value = self.request("miner_start", [threads]).await?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
