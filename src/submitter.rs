//! Block assembly and submission.
//!
//! When a share meets the network target the validator queues it here. The
//! submitter serializes the complete block (header, transaction count,
//! coinbase, then the template's transactions in order) and hands it to the
//! node. The miner has already been told `AcceptedBlock`; whatever the node
//! answers is logged for the operator and recorded, never charged back to
//! the miner.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hasher::dsha256;
use crate::job::write_varint;
use crate::persistence::{unix_now, BlockRecord, Record};
use crate::template::rpc::CoreRpcClient;
use crate::tracing::prelude::*;
use crate::validator::BlockSubmission;

/// Task draining found blocks to the node, one at a time.
pub struct BlockSubmitter {
    rpc: Arc<CoreRpcClient>,
    rx: mpsc::Receiver<BlockSubmission>,
    record_tx: mpsc::Sender<Record>,
    shutdown: CancellationToken,
}

impl BlockSubmitter {
    pub fn new(
        rpc: Arc<CoreRpcClient>,
        rx: mpsc::Receiver<BlockSubmission>,
        record_tx: mpsc::Sender<Record>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rpc,
            rx,
            record_tx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                submission = self.rx.recv() => {
                    match submission {
                        Some(submission) => self.submit(submission).await,
                        None => return,
                    }
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn submit(&self, submission: BlockSubmission) {
        let block_hex = hex::encode(serialize_block(&submission));

        let mut hash = dsha256(&submission.header);
        hash.reverse();
        let hash_hex = hex::encode(hash);

        let height = submission.job.template.height;

        match self.rpc.submit_block(&block_hex).await {
            Ok(None) => {
                info!(block = %hash_hex, height, worker = %submission.worker, "Block accepted by node");
            }
            Ok(Some(reason)) => {
                // The hash met the target; a node-side rejection usually
                // means we lost a race with the network.
                warn!(
                    block = %hash_hex,
                    height,
                    reason = %reason,
                    header = %hex::encode(submission.header),
                    "Node rejected block"
                );
            }
            Err(e) => {
                error!(
                    block = %hash_hex,
                    height,
                    error = %e,
                    header = %hex::encode(submission.header),
                    "submitblock call failed"
                );
            }
        }

        let record = BlockRecord {
            ts: unix_now(),
            height,
            hash: hash_hex,
            finder_address: submission.address.clone(),
            worker: submission.worker.clone(),
            reward: submission.job.template.coinbase_value,
        };
        if self.record_tx.try_send(Record::Block(record)).is_err() {
            warn!("Block record dropped, recorder backlogged");
        }
    }
}

/// `header ‖ varint(1 + ntx) ‖ coinbase ‖ tx1 ‖ … ‖ txN`
fn serialize_block(submission: &BlockSubmission) -> Vec<u8> {
    let transactions = &submission.job.template.transactions;

    let size = 80
        + 9
        + submission.coinbase.len()
        + transactions.iter().map(|tx| tx.data.len()).sum::<usize>();
    let mut block = Vec::with_capacity(size);

    block.extend_from_slice(&submission.header);
    write_varint(&mut block, 1 + transactions.len() as u64);
    block.extend_from_slice(&submission.coinbase);
    for tx in transactions {
        block.extend_from_slice(&tx.data);
    }

    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobBuilder, Job};
    use crate::template::{Template, TemplateUpdate, TxTemplate};

    fn submission_with_txs(tx_count: usize) -> BlockSubmission {
        let mut template = crate::job::tests::test_template(false);
        template.transactions = (0..tx_count)
            .map(|i| TxTemplate {
                data: vec![i as u8; 4 + i],
                txid: [i as u8; 32],
            })
            .collect();
        submission_for(template)
    }

    fn submission_for(template: Template) -> BlockSubmission {
        let job: Job = JobBuilder::new().build(&TemplateUpdate {
            template: Arc::new(template),
            clean: true,
        });

        BlockSubmission {
            header: core::array::from_fn(|i| i as u8),
            coinbase: vec![0xcc; 60],
            job: Arc::new(job),
            worker: "w".into(),
            address: "a".into(),
        }
    }

    #[test]
    fn test_block_layout() {
        let submission = submission_with_txs(2);
        let block = serialize_block(&submission);

        assert_eq!(&block[..80], &submission.header[..]);
        assert_eq!(block[80], 3, "coinbase plus two transactions");
        assert_eq!(&block[81..141], &[0xcc; 60][..]);

        let tx1_len = submission.job.template.transactions[0].data.len();
        assert_eq!(
            &block[141..141 + tx1_len],
            submission.job.template.transactions[0].data.as_slice()
        );
        assert_eq!(
            block.len(),
            141 + tx1_len + submission.job.template.transactions[1].data.len()
        );
    }

    #[test]
    fn test_block_layout_coinbase_only() {
        let submission = submission_with_txs(0);
        let block = serialize_block(&submission);
        assert_eq!(block[80], 1);
        assert_eq!(block.len(), 81 + 60);
    }
}
