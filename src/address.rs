//! Payout address validation.
//!
//! Miners authorize with `<address>[.<worker>]` as the username. The address
//! part must parse as a Bitcoin address for the configured network; its
//! scriptPubKey becomes the coinbase payout script for that session. Base58
//! (P2PKH, P2SH) and bech32/bech32m (P2WPKH, P2WSH, P2TR) forms are accepted.

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, ScriptBuf};
use thiserror::Error;

/// Why a payout address was refused.
#[derive(Debug, Error)]
pub enum AddressError {
    /// Not a parseable Bitcoin address (bad checksum, bad encoding, ...)
    #[error("invalid payout address: {0}")]
    Invalid(String),

    /// Parsed, but belongs to a different network than the pool serves
    #[error("payout address is for the wrong network")]
    WrongNetwork,
}

/// A validated payout destination.
#[derive(Debug, Clone)]
pub struct Payout {
    /// The address as the miner supplied it
    pub address: String,

    /// Full worker name (address plus optional `.worker` suffix)
    pub worker: String,

    /// scriptPubKey paying the address
    pub script: ScriptBuf,
}

/// Validate a Stratum username and derive the payout script.
///
/// The username is `<address>` or `<address>.<worker>`; everything after the
/// first dot is an opaque worker label.
pub fn parse_worker(username: &str, network: Network) -> Result<Payout, AddressError> {
    let address_part = username.split('.').next().unwrap_or(username);
    let script = payout_script(address_part, network)?;

    Ok(Payout {
        address: address_part.to_string(),
        worker: username.to_string(),
        script,
    })
}

/// Parse an address string and return its scriptPubKey.
///
/// Rejects checksum failures and addresses encoded for another network.
pub fn payout_script(address: &str, network: Network) -> Result<ScriptBuf, AddressError> {
    let parsed = address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| AddressError::Invalid(e.to_string()))?;

    let address = parsed
        .require_network(network)
        .map_err(|_| AddressError::WrongNetwork)?;

    Ok(address.script_pubkey())
}
