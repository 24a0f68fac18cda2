//! Share validation.
//!
//! Every `mining.submit` funnels through here: look the job up, parse the
//! fields strictly, rebuild the coinbase with the submitting session's
//! payout script, fold the merkle branch, hash the header the way ckpool
//! does, and compare against the session and network targets. A share that
//! meets the network target is handed to the block submitter but reported
//! to the miner immediately; node-side races are an operator concern, not
//! the miner's.

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Script;
use tokio::sync::mpsc;

use crate::hasher::{difficulty_to_target, dsha256, flip_32, flip_80, target_from_bits};
use crate::job::{fold_branches, Job, JobBuffer, EXTRANONCE2_SIZE};
use crate::persistence::{unix_now, Record, ShareRecord};
use crate::tracing::prelude::*;
use crate::u256::U256;

/// Consensus allowance for how far a timestamp may run ahead of wall time.
const MAX_FUTURE_TIME: u64 = 7200;

/// Every way a submission can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Met the session target
    Accepted,
    /// Met the network target; block submission triggered
    AcceptedBlock,
    /// Work from before a clean boundary, no longer wanted
    RejectStale,
    /// Fingerprint already seen this session
    RejectDuplicate,
    /// Hash above the session target
    RejectLowDifficulty,
    /// Job id not in the retention window
    RejectInvalidJob,
    /// Unparseable or wrong-width fields
    RejectMalformed,
    /// Session has no authorized payout address
    RejectUnauthorized,
    /// ntime outside the consensus window
    RejectBadTime,
}

impl ShareOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, ShareOutcome::Accepted | ShareOutcome::AcceptedBlock)
    }

    /// Stratum error triple for rejects, per the ckpool conventions.
    pub fn error(self) -> Option<(i32, &'static str)> {
        use crate::stratum::messages::code;

        match self {
            ShareOutcome::Accepted | ShareOutcome::AcceptedBlock => None,
            ShareOutcome::RejectStale => Some((code::JOB_NOT_FOUND, "Stale share")),
            ShareOutcome::RejectDuplicate => Some((code::DUPLICATE, "Duplicate share")),
            ShareOutcome::RejectLowDifficulty => Some((code::LOW_DIFFICULTY, "Low difficulty")),
            ShareOutcome::RejectInvalidJob => Some((code::JOB_NOT_FOUND, "Job not found")),
            ShareOutcome::RejectMalformed => Some((code::OTHER, "Malformed submission")),
            ShareOutcome::RejectUnauthorized => Some((code::UNAUTHORIZED, "Unauthorized worker")),
            ShareOutcome::RejectBadTime => Some((code::OTHER, "Bad ntime")),
        }
    }
}

/// At-most-once bookkeeping key for a submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    job_id: String,
    extranonce2: [u8; EXTRANONCE2_SIZE],
    ntime: u32,
    nonce: u32,
    version: Option<u32>,
}

/// The `mining.submit` fields after the worker name, still hex.
#[derive(Debug, Clone)]
pub struct SubmitShare<'a> {
    pub job_id: &'a str,
    pub extranonce2: &'a str,
    pub ntime: &'a str,
    pub nonce: &'a str,
    pub version: Option<&'a str>,
}

/// Per-session state the validator reads and updates.
pub struct MinerContext<'a> {
    pub extranonce1: [u8; 4],
    pub worker: &'a str,
    pub address: &'a str,
    pub payout_script: &'a Script,
    pub difficulty: f64,
    /// Negotiated version-rolling mask, if mining.configure succeeded
    pub version_mask: Option<u32>,
    /// Fingerprints of this session's accepted shares
    pub seen: &'a mut HashSet<Fingerprint>,
}

/// A full-target share on its way to the node.
#[derive(Debug, Clone)]
pub struct BlockSubmission {
    /// Consensus-layout 80-byte header
    pub header: [u8; 80],
    /// Fully assembled coinbase transaction
    pub coinbase: Vec<u8>,
    pub job: Arc<Job>,
    pub worker: String,
    pub address: String,
}

/// Stateless validation engine shared by all sessions.
pub struct ShareValidator {
    jobs: Arc<JobBuffer>,
    submit_tx: mpsc::Sender<BlockSubmission>,
    record_tx: mpsc::Sender<Record>,
}

impl ShareValidator {
    pub fn new(
        jobs: Arc<JobBuffer>,
        submit_tx: mpsc::Sender<BlockSubmission>,
        record_tx: mpsc::Sender<Record>,
    ) -> Self {
        Self {
            jobs,
            submit_tx,
            record_tx,
        }
    }

    /// Run a submission through the full pipeline. Every failing step
    /// short-circuits to its outcome; the fingerprint is recorded only for
    /// accepted shares.
    pub fn validate(&self, ctx: &mut MinerContext<'_>, share: &SubmitShare<'_>) -> ShareOutcome {
        let Some(job) = self.jobs.get(share.job_id) else {
            return ShareOutcome::RejectInvalidJob;
        };

        let Some(extranonce2) = parse_fixed::<EXTRANONCE2_SIZE>(share.extranonce2) else {
            return ShareOutcome::RejectMalformed;
        };
        let Some(ntime) = parse_u32(share.ntime) else {
            return ShareOutcome::RejectMalformed;
        };
        let Some(nonce) = parse_u32(share.nonce) else {
            return ShareOutcome::RejectMalformed;
        };
        let submitted_version = match share.version {
            None => None,
            Some(v) => match parse_u32(v) {
                Some(v) => Some(v),
                None => return ShareOutcome::RejectMalformed,
            },
        };

        if u64::from(ntime) < u64::from(job.template.min_time)
            || u64::from(ntime) > unix_now() + MAX_FUTURE_TIME
        {
            return ShareOutcome::RejectBadTime;
        }

        let job_version = job.version as u32;
        let effective_version = match (ctx.version_mask, submitted_version) {
            (Some(mask), Some(version)) => (job_version & !mask) | (version & mask),
            (None, Some(version)) if version != job_version => {
                return ShareOutcome::RejectMalformed;
            }
            _ => job_version,
        };

        let fingerprint = Fingerprint {
            job_id: job.job_id.clone(),
            extranonce2,
            ntime,
            nonce,
            version: submitted_version,
        };
        if ctx.seen.contains(&fingerprint) {
            return ShareOutcome::RejectDuplicate;
        }

        let coinbase = job
            .coinbase
            .assemble(&ctx.extranonce1, &extranonce2, ctx.payout_script);

        let mut merkle_root = fold_branches(dsha256(&coinbase), &job.merkle_branch);
        flip_32(&mut merkle_root);

        let (header, hash) =
            hash_header(job.prevhash, merkle_root, effective_version, ntime, job.nbits, nonce);
        let hash_value = U256::from_le_bytes(hash);

        let share_target = difficulty_to_target(ctx.difficulty);
        if hash_value > share_target {
            return ShareOutcome::RejectLowDifficulty;
        }

        ctx.seen.insert(fingerprint);

        let block_found = hash_value <= target_from_bits(job.nbits);

        let record = ShareRecord {
            ts: unix_now(),
            worker: ctx.worker.to_string(),
            address: ctx.address.to_string(),
            difficulty: ctx.difficulty,
            block_found,
        };
        if self.record_tx.try_send(Record::Share(record)).is_err() {
            warn!("Share record dropped, recorder backlogged");
        }

        if block_found {
            info!(
                worker = ctx.worker,
                block = %display_hash(&hash),
                height = job.template.height,
                "BLOCK FOUND"
            );

            let submission = BlockSubmission {
                header,
                coinbase,
                job: job.clone(),
                worker: ctx.worker.to_string(),
                address: ctx.address.to_string(),
            };
            if self.submit_tx.try_send(submission).is_err() {
                error!("Block submission queue unavailable");
            }

            ShareOutcome::AcceptedBlock
        } else {
            debug!(
                worker = ctx.worker,
                job = %job.job_id,
                hash = %display_hash(&hash),
                "Share accepted"
            );
            ShareOutcome::Accepted
        }
    }
}

/// Assemble the header the way miners see it, un-swap it to the consensus
/// layout, and double-hash. Returns the consensus header and its hash.
fn hash_header(
    prevhash_wire: [u8; 32],
    merkle_root_flipped: [u8; 32],
    version: u32,
    ntime: u32,
    nbits: u32,
    nonce: u32,
) -> ([u8; 80], [u8; 32]) {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(&prevhash_wire);
    header[36..68].copy_from_slice(&merkle_root_flipped);
    header[68..72].copy_from_slice(&ntime.to_le_bytes());
    header[72..76].copy_from_slice(&nbits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());

    flip_80(&mut header);
    let hash = dsha256(&header);
    (header, hash)
}

/// Strict fixed-width hex: exactly N bytes, no sign or prefix.
fn parse_fixed<const N: usize>(hex_str: &str) -> Option<[u8; N]> {
    if hex_str.len() != N * 2 {
        return None;
    }
    hex::decode(hex_str).ok()?.try_into().ok()
}

fn parse_u32(hex_str: &str) -> Option<u32> {
    parse_fixed::<4>(hex_str).map(u32::from_be_bytes)
}

/// Display-order hex of an internal-order hash.
fn display_hash(hash: &[u8; 32]) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}
