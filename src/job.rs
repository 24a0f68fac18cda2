//! Mining job construction.
//!
//! Each [`Template`] becomes a [`Job`]: the coinbase transaction split into
//! the two halves Stratum miners splice their extranonce into, the merkle
//! branch the coinbase folds through, and the header fields for
//! `mining.notify`. Because this is a solo pool the payout output belongs to
//! whichever miner submits, so the second coinbase half is kept as a
//! template and rendered against a session's payout script both at notify
//! time and again at share validation.
//!
//! Jobs live in a small bounded buffer; a share against an evicted job is
//! reported as "job not found".

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use bitcoin::Script;
use serde_json::{json, Value};

use crate::hasher::{dsha256, flipped_32};
use crate::template::{Template, TemplateUpdate};

/// How many jobs stay addressable for late shares.
pub const JOB_BACKLOG: usize = 5;

/// Bytes of extranonce1 (per session) in the coinbase scriptSig.
pub const EXTRANONCE1_SIZE: usize = 4;

/// Bytes of extranonce2 (per submission) in the coinbase scriptSig.
pub const EXTRANONCE2_SIZE: usize = 4;

/// Identifier pushed into every coinbase scriptSig.
const POOL_TAG: &[u8] = b"/tanuki/";

/// Append a Bitcoin varint.
pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Serialize the BIP34 height push that must open the coinbase scriptSig.
///
/// Heights 1-16 use the small-integer opcodes; larger heights use a minimal
/// CScriptNum push, exactly as the node serializes it for comparison.
pub fn bip34_height_push(height: u64) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    if (1..=16).contains(&height) {
        return vec![0x50 + height as u8];
    }

    let mut data = Vec::new();
    let mut n = height;
    while n > 0 {
        data.push((n & 0xff) as u8);
        n >>= 8;
    }
    // CScriptNum reserves the top bit for sign.
    if data.last().is_some_and(|b| b & 0x80 != 0) {
        data.push(0);
    }

    let mut out = Vec::with_capacity(1 + data.len());
    out.push(data.len() as u8);
    out.extend_from_slice(&data);
    out
}

/// Compute the merkle branch a coinbase folds through.
///
/// `txids` are the non-coinbase transaction ids in template order, internal
/// byte order. The result is the ordered list of siblings along the
/// coinbase's path to the root, with the standard duplication of the last
/// node at odd-sized levels.
pub fn merkle_branches(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branches = Vec::new();

    // Nodes of the current level, excluding the coinbase-path node itself.
    let mut level: Vec<[u8; 32]> = txids.to_vec();

    while !level.is_empty() {
        branches.push(level[0]);
        if level.len() == 1 {
            break;
        }

        let mut rest: Vec<[u8; 32]> = level[1..].to_vec();
        if rest.len() % 2 == 1 {
            if let Some(&last) = rest.last() {
                rest.push(last);
            }
        }

        level = rest
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                dsha256(&buf)
            })
            .collect();
    }

    branches
}

/// Fold a leaf hash up through a merkle branch.
pub fn fold_branches(leaf: [u8; 32], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut hash = leaf;
    for branch in branches {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&hash);
        buf[32..].copy_from_slice(branch);
        hash = dsha256(&buf);
    }
    hash
}

/// The coinbase transaction, split around the extranonce placeholder.
///
/// `coinb1` is fixed per template. The second half depends on the payout
/// script, so it is rendered on demand via [`CoinbaseSplit::coinb2_for`].
#[derive(Debug, Clone)]
pub struct CoinbaseSplit {
    /// Everything before the 8-byte extranonce1‖extranonce2 splice point
    pub coinb1: Vec<u8>,

    /// Fixed bytes after the extranonce, up to the output list
    coinb2_head: Vec<u8>,

    /// Reward paid by the single payout output, satoshis
    value: u64,

    /// Witness commitment scriptPubKey appended as a second output
    witness_commitment: Option<Vec<u8>>,
}

impl CoinbaseSplit {
    pub fn new(template: &Template) -> Self {
        let height_push = bip34_height_push(template.height);

        // scriptSig: height, a 4-byte timestamp push, the raw extranonce
        // bytes behind a push-8, and the pool tag.
        let mut sig_prefix = height_push;
        sig_prefix.push(0x04);
        sig_prefix.extend_from_slice(&template.cur_time.to_le_bytes());
        sig_prefix.push((EXTRANONCE1_SIZE + EXTRANONCE2_SIZE) as u8);

        let mut sig_suffix = Vec::with_capacity(1 + POOL_TAG.len());
        sig_suffix.push(POOL_TAG.len() as u8);
        sig_suffix.extend_from_slice(POOL_TAG);

        let script_len = sig_prefix.len() + EXTRANONCE1_SIZE + EXTRANONCE2_SIZE + sig_suffix.len();

        let mut coinb1 = Vec::with_capacity(48 + sig_prefix.len());
        coinb1.extend_from_slice(&1u32.to_le_bytes()); // tx version
        coinb1.push(0x01); // one input
        coinb1.extend_from_slice(&[0u8; 32]); // null prevout
        coinb1.extend_from_slice(&[0xff; 4]); // prevout index
        coinb1.push(script_len as u8);
        coinb1.extend_from_slice(&sig_prefix);

        let mut coinb2_head = sig_suffix;
        coinb2_head.extend_from_slice(&[0xff; 4]); // sequence

        Self {
            coinb1,
            coinb2_head,
            value: template.coinbase_value,
            witness_commitment: template.witness_commitment.clone(),
        }
    }

    /// Render the second coinbase half paying the given script.
    pub fn coinb2_for(&self, payout_script: &Script) -> Vec<u8> {
        let mut out = self.coinb2_head.clone();

        let output_count = 1 + usize::from(self.witness_commitment.is_some());
        write_varint(&mut out, output_count as u64);

        out.extend_from_slice(&self.value.to_le_bytes());
        write_varint(&mut out, payout_script.len() as u64);
        out.extend_from_slice(payout_script.as_bytes());

        if let Some(commitment) = &self.witness_commitment {
            out.extend_from_slice(&0u64.to_le_bytes());
            write_varint(&mut out, commitment.len() as u64);
            out.extend_from_slice(commitment);
        }

        out.extend_from_slice(&0u32.to_le_bytes()); // locktime
        out
    }

    /// Assemble the full coinbase for a submission.
    pub fn assemble(
        &self,
        extranonce1: &[u8],
        extranonce2: &[u8],
        payout_script: &Script,
    ) -> Vec<u8> {
        let coinb2 = self.coinb2_for(payout_script);
        let mut tx =
            Vec::with_capacity(self.coinb1.len() + extranonce1.len() + extranonce2.len() + coinb2.len());
        tx.extend_from_slice(&self.coinb1);
        tx.extend_from_slice(extranonce1);
        tx.extend_from_slice(extranonce2);
        tx.extend_from_slice(&coinb2);
        tx
    }
}

/// One unit of work broadcast to miners.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque token unique for the process lifetime
    pub job_id: String,

    /// Previous block hash in the word-swapped wire form `mining.notify`
    /// carries and headers are assembled from
    pub prevhash: [u8; 32],

    /// Coinbase halves, payout script left open
    pub coinbase: CoinbaseSplit,

    /// Siblings the coinbase txid folds through
    pub merkle_branch: Vec<[u8; 32]>,

    pub version: i32,
    pub nbits: u32,
    pub ntime: u32,

    /// Tells miners to abandon work from before this job
    pub clean_jobs: bool,

    /// Template this job came from; needed for block assembly
    pub template: Arc<Template>,
}

impl Job {
    /// Build the `mining.notify` params array for one session.
    ///
    /// `clean` overrides the job's own flag; a freshly authorized session
    /// is always told to start clean.
    pub fn notify_params(&self, payout_script: &Script, clean: bool) -> Value {
        let branches: Vec<String> = self.merkle_branch.iter().map(hex::encode).collect();

        json!([
            self.job_id,
            hex::encode(self.prevhash),
            hex::encode(&self.coinbase.coinb1),
            hex::encode(self.coinbase.coinb2_for(payout_script)),
            branches,
            format!("{:08x}", self.version as u32),
            format!("{:08x}", self.nbits),
            format!("{:08x}", self.ntime),
            clean,
        ])
    }
}

/// Turns templates into numbered jobs.
#[derive(Debug, Default)]
pub struct JobBuilder {
    next_id: u64,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&mut self, update: &TemplateUpdate) -> Job {
        let template = &update.template;
        self.next_id += 1;

        let txids: Vec<[u8; 32]> = template.transactions.iter().map(|tx| tx.txid).collect();

        Job {
            job_id: format!("{:016x}", self.next_id),
            prevhash: flipped_32(template.prev_blockhash),
            coinbase: CoinbaseSplit::new(template),
            merkle_branch: merkle_branches(&txids),
            version: template.version,
            nbits: template.bits,
            ntime: template.cur_time,
            clean_jobs: update.clean,
            template: template.clone(),
        }
    }
}

/// Bounded buffer of recent jobs.
///
/// Written only by the job builder task; validators clone out an `Arc` by id
/// and never hold the lock while hashing.
#[derive(Debug, Default)]
pub struct JobBuffer {
    jobs: RwLock<VecDeque<Arc<Job>>>,
}

impl JobBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new current job, evicting beyond [`JOB_BACKLOG`].
    pub fn insert(&self, job: Arc<Job>) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.push_back(job);
        while jobs.len() > JOB_BACKLOG {
            jobs.pop_front();
        }
    }

    /// Look up a job still in the window.
    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.iter().find(|job| job.job_id == job_id).cloned()
    }

    /// The most recently built job.
    pub fn current(&self) -> Option<Arc<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.back().cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::u256::U256;
    use bitcoin::consensus::deserialize;
    use bitcoin::{Amount, ScriptBuf, Transaction};

    pub(crate) fn test_template(witness: bool) -> Template {
        Template {
            height: 850000,
            prev_blockhash: [0x11; 32],
            coinbase_value: 312_500_000,
            witness_commitment: witness.then(|| {
                let mut script = vec![0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
                script.extend_from_slice(&[0x42; 32]);
                script
            }),
            bits: 0x17031abe,
            target: crate::hasher::target_from_bits(0x17031abe),
            min_time: 1_718_000_000,
            cur_time: 1_718_000_600,
            version: 0x20000000,
            transactions: Vec::new(),
        }
    }

    fn test_script() -> ScriptBuf {
        // P2WPKH for the BIP-173 test key.
        let bytes = hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        ScriptBuf::from_bytes(bytes)
    }

    fn test_update(template: Template) -> TemplateUpdate {
        TemplateUpdate {
            template: Arc::new(template),
            clean: true,
        }
    }

    #[test]
    fn test_varint_encodings() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0xfc);
        assert_eq!(buf, vec![0xfc]);

        buf.clear();
        write_varint(&mut buf, 0xfd);
        assert_eq!(buf, vec![0xfd, 0xfd, 0x00]);

        buf.clear();
        write_varint(&mut buf, 0x1_0000);
        assert_eq!(buf, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_bip34_small_heights_use_opcodes() {
        assert_eq!(bip34_height_push(1), vec![0x51]);
        assert_eq!(bip34_height_push(16), vec![0x60]);
    }

    #[test]
    fn test_bip34_minimal_pushes() {
        assert_eq!(bip34_height_push(17), vec![0x01, 0x11]);
        // 300 = 0x012c, little-endian
        assert_eq!(bip34_height_push(300), vec![0x02, 0x2c, 0x01]);
        // Top bit set in the high byte forces a sign byte.
        assert_eq!(bip34_height_push(128), vec![0x02, 0x80, 0x00]);
        // 850000 = 0x0cf850
        assert_eq!(bip34_height_push(850_000), vec![0x03, 0x50, 0xf8, 0x0c]);
    }

    /// Reference merkle root over a full leaf list, duplicating the last
    /// node at odd levels.
    fn merkle_root(mut level: Vec<[u8; 32]>) -> [u8; 32] {
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = *level.last().unwrap();
                level.push(last);
            }
            level = level
                .chunks_exact(2)
                .map(|pair| {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(&pair[0]);
                    buf[32..].copy_from_slice(&pair[1]);
                    dsha256(&buf)
                })
                .collect();
        }
        level[0]
    }

    #[test]
    fn test_branches_fold_to_full_tree_root() {
        let coinbase_txid = [0xcb; 32];

        for tx_count in 0..9 {
            let txids: Vec<[u8; 32]> = (0..tx_count).map(|i| [i as u8 + 1; 32]).collect();

            let branches = merkle_branches(&txids);
            let folded = fold_branches(coinbase_txid, &branches);

            let mut leaves = vec![coinbase_txid];
            leaves.extend_from_slice(&txids);
            let expected = merkle_root(leaves);

            assert_eq!(folded, expected, "mismatch with {} transactions", tx_count);
        }
    }

    #[test]
    fn test_branch_count_is_logarithmic() {
        let txids: Vec<[u8; 32]> = (0..100).map(|i| [i as u8; 32]).collect();
        let branches = merkle_branches(&txids);
        // 101 leaves fold in ceil(log2(101)) = 7 levels.
        assert_eq!(branches.len(), 7);
    }

    #[test]
    fn test_coinbase_is_valid_transaction() {
        let split = CoinbaseSplit::new(&test_template(false));
        let raw = split.assemble(&[0xde, 0xad, 0xbe, 0xef], &[0u8; 4], &test_script());

        let tx: Transaction = deserialize(&raw).expect("coinbase must deserialize");
        assert!(tx.is_coinbase());
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(312_500_000));
        assert_eq!(tx.output[0].script_pubkey, test_script());
        assert_eq!(tx.lock_time.to_consensus_u32(), 0);

        // The scriptSig opens with the BIP34 height push.
        let sig = tx.input[0].script_sig.as_bytes();
        assert!(sig.starts_with(&bip34_height_push(850_000)));
    }

    #[test]
    fn test_coinbase_carries_witness_commitment() {
        let template = test_template(true);
        let split = CoinbaseSplit::new(&template);
        let raw = split.assemble(&[0; 4], &[0; 4], &test_script());

        let tx: Transaction = deserialize(&raw).unwrap();
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[1].value, Amount::ZERO);
        assert_eq!(
            tx.output[1].script_pubkey.as_bytes(),
            template.witness_commitment.as_deref().unwrap()
        );
    }

    #[test]
    fn test_coinbase_differs_only_in_payout_script() {
        let split = CoinbaseSplit::new(&test_template(true));
        let other = ScriptBuf::from_bytes(
            hex::decode("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac").unwrap(),
        );

        // coinb1 is script-independent; coinb2 differs.
        assert_ne!(split.coinb2_for(&test_script()), split.coinb2_for(&other));

        let tx: Transaction =
            deserialize(&split.assemble(&[0; 4], &[0; 4], &other)).unwrap();
        assert_eq!(tx.output[0].script_pubkey, other);
    }

    #[test]
    fn test_notify_params_shape() {
        let mut builder = JobBuilder::new();
        let job = builder.build(&test_update(test_template(false)));

        let params = job.notify_params(&test_script(), job.clean_jobs);
        let arr = params.as_array().unwrap();
        assert_eq!(arr.len(), 9);
        assert_eq!(arr[0], json!("0000000000000001"));
        assert_eq!(arr[5], json!("20000000"));
        assert_eq!(arr[6], json!("17031abe"));
        assert_eq!(arr[8], json!(true));

        // The wire prevhash is the word-swapped internal form; for a
        // constant pattern the swap is a fixed point.
        assert_eq!(arr[1], json!(hex::encode([0x11u8; 32])));
    }

    #[test]
    fn test_job_ids_are_unique_and_monotonic() {
        let mut builder = JobBuilder::new();
        let update = test_update(test_template(false));
        let a = builder.build(&update);
        let b = builder.build(&update);
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(b.job_id, "0000000000000002");
    }

    #[test]
    fn test_buffer_evicts_beyond_backlog() {
        let buffer = JobBuffer::new();
        let mut builder = JobBuilder::new();
        let update = test_update(test_template(false));

        let jobs: Vec<Arc<Job>> = (0..6).map(|_| Arc::new(builder.build(&update))).collect();
        for job in &jobs {
            buffer.insert(job.clone());
        }

        assert!(buffer.get(&jobs[0].job_id).is_none(), "oldest job evicted");
        for job in &jobs[1..] {
            assert!(buffer.get(&job.job_id).is_some());
        }
        assert_eq!(buffer.current().unwrap().job_id, jobs[5].job_id);
    }

    #[test]
    fn test_template_target_consistency() {
        let template = test_template(false);
        assert!(template.target > U256::ZERO);
    }
}
