//! Solo Bitcoin mining pool daemon.
//!
//! tanuki-pool accepts Stratum v1 connections from mining hardware, derives
//! work from a Bitcoin full node over JSON-RPC and ZMQ, validates submitted
//! shares with the same byte conventions ckpool-solo uses, and submits any
//! share that meets the network target back to the node as a block. Being a
//! solo pool there is no reward accounting: the coinbase of a found block
//! pays the submitting miner's own address.

pub mod address;
pub mod config;
pub mod daemon;
pub mod hasher;
pub mod job;
pub mod persistence;
pub mod stratum;
pub mod submitter;
pub mod template;
pub mod tracing;
pub mod u256;
pub mod validator;
