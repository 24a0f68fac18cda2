//! Block template acquisition.
//!
//! A [`Template`] is an immutable snapshot of the node's view of the next
//! block. The [`TemplateSource`] task keeps a fresh one flowing to the job
//! builder, refreshing on a fixed timer and immediately whenever the node
//! announces a new tip over ZMQ. Transient node failures never kill the
//! task; the last good template keeps serving miners until the node returns.

pub mod rpc;
pub mod zmq;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;
use crate::u256::U256;
use rpc::{CoreRpcClient, GetBlockTemplate};

/// How often to poll `getblocktemplate` absent a ZMQ trigger.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// One transaction from the template, decoded.
#[derive(Debug, Clone)]
pub struct TxTemplate {
    /// Raw consensus-serialized transaction
    pub data: Vec<u8>,

    /// Transaction id, internal byte order
    pub txid: [u8; 32],
}

/// Immutable snapshot of the next block, from `getblocktemplate`.
#[derive(Debug, Clone)]
pub struct Template {
    pub height: u64,

    /// Previous block hash, internal byte order
    pub prev_blockhash: [u8; 32],

    /// Coinbase reward plus fees, satoshis
    pub coinbase_value: u64,

    /// Full witness commitment scriptPubKey, when the template has
    /// segwit transactions
    pub witness_commitment: Option<Vec<u8>>,

    /// Compact network target
    pub bits: u32,

    /// Expanded network target
    pub target: U256,

    /// Earliest consensus-valid block time
    pub min_time: u32,

    /// Node's current time suggestion
    pub cur_time: u32,

    /// Block version
    pub version: i32,

    /// Non-coinbase transactions, in template order
    pub transactions: Vec<TxTemplate>,
}

impl Template {
    /// Decode a `getblocktemplate` reply.
    pub fn from_gbt(gbt: GetBlockTemplate) -> anyhow::Result<Self> {
        let prev_blockhash = parse_hash(&gbt.previousblockhash).context("previousblockhash")?;

        let bits_bytes: [u8; 4] = hex::decode(&gbt.bits)
            .ok()
            .and_then(|b| b.try_into().ok())
            .context("bits")?;
        let bits = u32::from_be_bytes(bits_bytes);

        let target = parse_hash(&gbt.target).context("target")?;
        let target = U256::from_le_bytes(target);

        let witness_commitment = gbt
            .default_witness_commitment
            .as_deref()
            .map(hex::decode)
            .transpose()
            .context("default_witness_commitment")?;

        let transactions = gbt
            .transactions
            .iter()
            .map(|tx| {
                Ok(TxTemplate {
                    data: hex::decode(&tx.data).context("transaction data")?,
                    txid: parse_hash(&tx.txid).context("transaction txid")?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            height: gbt.height,
            prev_blockhash,
            coinbase_value: gbt.coinbasevalue,
            witness_commitment,
            bits,
            target,
            min_time: gbt.mintime,
            cur_time: gbt.curtime,
            version: gbt.version,
            transactions,
        })
    }
}

/// Decode a display-order (big-endian) hash into internal byte order.
fn parse_hash(hex_str: &str) -> anyhow::Result<[u8; 32]> {
    let mut bytes: [u8; 32] = hex::decode(hex_str)
        .ok()
        .and_then(|b| b.try_into().ok())
        .context("expected 32 hex-encoded bytes")?;
    bytes.reverse();
    Ok(bytes)
}

/// A new template, plus whether it obsoletes in-flight work.
#[derive(Debug, Clone)]
pub struct TemplateUpdate {
    pub template: Arc<Template>,

    /// True when the previous block changed; the next job broadcast tells
    /// miners to abandon earlier work.
    pub clean: bool,
}

/// Task that keeps the current template fresh.
pub struct TemplateSource {
    rpc: Arc<CoreRpcClient>,
    zmq_endpoint: String,
    update_tx: mpsc::Sender<TemplateUpdate>,
    shutdown: CancellationToken,
    current: Option<Arc<Template>>,
}

impl TemplateSource {
    pub fn new(
        rpc: Arc<CoreRpcClient>,
        zmq_endpoint: String,
        update_tx: mpsc::Sender<TemplateUpdate>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rpc,
            zmq_endpoint,
            update_tx,
            shutdown,
            current: None,
        }
    }

    /// Fetch the first template. Failure here is fatal: a pool that cannot
    /// reach its node at startup has nothing to serve.
    pub async fn bootstrap(&mut self) -> anyhow::Result<()> {
        let gbt = self
            .rpc
            .get_block_template()
            .await
            .context("initial getblocktemplate failed; is the node reachable?")?;

        let template = Arc::new(Template::from_gbt(gbt)?);
        info!(height = template.height, "Initial block template acquired");

        self.current = Some(template.clone());
        self.update_tx
            .send(TemplateUpdate {
                template,
                clean: true,
            })
            .await
            .context("job builder gone during startup")?;

        Ok(())
    }

    /// Poll-and-notify loop. Runs until shutdown.
    pub async fn run(mut self) {
        let (block_tx, mut block_rx) = mpsc::channel::<()>(8);
        tokio::spawn(zmq::run_hashblock_listener(
            self.zmq_endpoint.clone(),
            block_tx,
            self.shutdown.clone(),
        ));

        let mut tick = tokio::time::interval(REFRESH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.refresh().await;
                }
                Some(()) = block_rx.recv() => {
                    self.refresh().await;
                    tick.reset();
                }
                _ = self.shutdown.cancelled() => {
                    debug!("Template source shutting down");
                    return;
                }
            }
        }
    }

    /// Fetch a template and emit it if it supersedes the current one.
    /// RPC failures log and keep the last good template.
    async fn refresh(&mut self) {
        let gbt = match self.rpc.get_block_template().await {
            Ok(gbt) => gbt,
            Err(e) => {
                warn!(error = %e, "getblocktemplate failed, keeping last template");
                return;
            }
        };

        let template = match Template::from_gbt(gbt) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(error = %e, "Malformed block template, keeping last template");
                return;
            }
        };

        let clean = match &self.current {
            Some(current) => template.prev_blockhash != current.prev_blockhash,
            None => true,
        };

        let changed = match &self.current {
            Some(current) => {
                clean
                    || template.height != current.height
                    || template.cur_time >= current.cur_time + 1
            }
            None => true,
        };

        if !changed {
            return;
        }

        if clean {
            info!(
                height = template.height,
                txs = template.transactions.len(),
                "New chain tip, work restarts"
            );
        } else {
            debug!(height = template.height, "Template refreshed");
        }

        self.current = Some(template.clone());
        if self
            .update_tx
            .send(TemplateUpdate { template, clean })
            .await
            .is_err()
        {
            // Job builder gone; shutdown is in progress.
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_gbt() -> GetBlockTemplate {
        serde_json::from_value(serde_json::json!({
            "height": 850000u64,
            "previousblockhash":
                "00000000000000000002c0cc73626b56fb3ee1ce605b0ce125cc4fb58775a0a9",
            "coinbasevalue": 312500000u64,
            "bits": "17031abe",
            "target": "000000000000000000031abe0000000000000000000000000000000000000000",
            "mintime": 1718000000u32,
            "curtime": 1718000600u32,
            "version": 0x20000000,
            "transactions": [{
                "data": "01000000000100",
                "txid": "11d4f13a1a0a1b6f1c0a55cf20d9de1a0c9f9f2a3b4c5d6e7f80919293949596"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_from_gbt_byte_orders() {
        let template = Template::from_gbt(sample_gbt()).unwrap();

        // Internal order is the display hex reversed.
        assert_eq!(template.prev_blockhash[31], 0x00);
        assert_eq!(template.prev_blockhash[0], 0xa9);
        assert_eq!(template.bits, 0x17031abe);
        assert_eq!(template.transactions[0].txid[0], 0x96);
        assert_eq!(template.transactions[0].txid[31], 0x11);

        // Target round-trips through the compact bits form.
        assert_eq!(
            crate::hasher::target_from_bits(template.bits),
            template.target
        );
    }

    #[test]
    fn test_from_gbt_rejects_short_hash() {
        let mut gbt = sample_gbt();
        gbt.previousblockhash = "abcd".into();
        assert!(Template::from_gbt(gbt).is_err());
    }

    #[test]
    fn test_from_gbt_rejects_bad_hex() {
        let mut gbt = sample_gbt();
        gbt.bits = "zzzz".into();
        assert!(Template::from_gbt(gbt).is_err());
    }
}
