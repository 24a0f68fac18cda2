//! Per-connection Stratum session.
//!
//! Each accepted socket gets one task running [`run_session`]: it reads
//! frames sequentially, feeds them through a [`SessionFsm`], and queues the
//! resulting messages on the session's outbound channel (drained by a small
//! writer task, so responses and broadcasts interleave FIFO). The state
//! machine itself is synchronous and side-effect free apart from registry
//! updates, which keeps every transition unit-testable without sockets.
//!
//! Lifecycle: Connected → Subscribed → Authorized → Active, with
//! `mining.configure` tracked as an orthogonal flag. Framing violations
//! close the connection without a response; semantic errors answer a
//! JSON-RPC error and close only when a session misbehaves five times
//! inside a minute.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::net::TcpStream;

use super::connection;
use super::messages::{code, JsonRpcMessage};
use super::registry::{SessionId, SessionRegistry};
use crate::address;
use crate::job::{JobBuffer, EXTRANONCE2_SIZE};
use crate::tracing::prelude::*;
use crate::validator::{Fingerprint, MinerContext, ShareValidator, SubmitShare};

/// Server identification answered to `client.get_version`.
pub const USER_AGENT: &str = concat!("tanuki-pool/", env!("CARGO_PKG_VERSION"));

/// Semantic errors tolerated per window before the session is dropped.
const STRIKE_LIMIT: usize = 5;
const STRIKE_WINDOW: Duration = Duration::from_secs(60);

/// Knobs the state machine needs from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub network: bitcoin::Network,
    pub initial_difficulty: f64,
    pub accept_suggested_difficulty: bool,
    pub version_rolling_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Subscribed,
    Authorized,
    Active,
}

/// What the session task should do with a transition's output.
#[derive(Debug)]
pub enum Action {
    Send(JsonRpcMessage),
    Close,
}

/// The per-connection protocol state machine.
pub struct SessionFsm {
    session_id: SessionId,
    extranonce1: [u8; 4],
    settings: Arc<SessionSettings>,
    jobs: Arc<JobBuffer>,
    validator: Arc<ShareValidator>,
    registry: Arc<SessionRegistry>,
    state: State,
    /// Negotiated version-rolling mask (the Configured flag)
    version_mask: Option<u32>,
    payout: Option<address::Payout>,
    difficulty: f64,
    seen: HashSet<Fingerprint>,
    strikes: VecDeque<Instant>,
}

impl SessionFsm {
    pub fn new(
        session_id: SessionId,
        extranonce1: [u8; 4],
        settings: Arc<SessionSettings>,
        jobs: Arc<JobBuffer>,
        validator: Arc<ShareValidator>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let difficulty = settings.initial_difficulty;
        Self {
            session_id,
            extranonce1,
            settings,
            jobs,
            validator,
            registry,
            state: State::Connected,
            version_mask: None,
            payout: None,
            difficulty,
            seen: HashSet::new(),
            strikes: VecDeque::new(),
        }
    }

    /// Process one inbound message.
    pub fn handle_message(&mut self, msg: JsonRpcMessage) -> Vec<Action> {
        match msg {
            // Acks to our notifications; nothing to do.
            JsonRpcMessage::Response { .. } => Vec::new(),
            JsonRpcMessage::Request { id: None, method, .. } => {
                debug!(session = self.session_id, method = %method, "Ignoring client notification");
                Vec::new()
            }
            JsonRpcMessage::Request {
                id: Some(id),
                method,
                params,
            } => self.dispatch(id, &method, params),
        }
    }

    fn dispatch(&mut self, id: u64, method: &str, params: Value) -> Vec<Action> {
        match method {
            "mining.subscribe" => self.on_subscribe(id),
            "mining.configure" => self.on_configure(id, &params),
            "mining.authorize" => self.on_authorize(id, &params),
            "mining.suggest_difficulty" => self.on_suggest_difficulty(&params),
            "mining.submit" => self.on_submit(id, &params),
            "mining.get_transactions" => self.on_get_transactions(id),
            "client.get_version" => vec![Action::Send(JsonRpcMessage::ok(id, json!(USER_AGENT)))],
            _ => {
                debug!(session = self.session_id, method, "Unknown method");
                self.semantic_error(JsonRpcMessage::err(
                    id,
                    code::UNKNOWN_METHOD,
                    "Method not found",
                ))
            }
        }
    }

    fn on_subscribe(&mut self, id: u64) -> Vec<Action> {
        if self.state == State::Connected {
            self.state = State::Subscribed;
        }

        let subscription_id = format!("{:08x}", self.session_id);
        let result = json!([
            [["mining.notify", subscription_id]],
            hex::encode(self.extranonce1),
            EXTRANONCE2_SIZE,
        ]);

        vec![Action::Send(JsonRpcMessage::ok(id, result))]
    }

    fn on_configure(&mut self, id: u64, params: &Value) -> Vec<Action> {
        let requested: Vec<&str> = params
            .get(0)
            .and_then(Value::as_array)
            .map(|features| features.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut result = serde_json::Map::new();
        for feature in requested {
            if feature == "version-rolling" {
                let client_mask = params
                    .get(1)
                    .and_then(|p| p.get("version-rolling.mask"))
                    .and_then(Value::as_str)
                    .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                    .unwrap_or(u32::MAX);

                let mask = client_mask & self.settings.version_rolling_mask;
                self.version_mask = Some(mask);

                result.insert("version-rolling".into(), json!(true));
                result.insert("version-rolling.mask".into(), json!(format!("{:08x}", mask)));
            } else {
                result.insert(feature.into(), json!(false));
            }
        }

        vec![Action::Send(JsonRpcMessage::ok(id, Value::Object(result)))]
    }

    fn on_authorize(&mut self, id: u64, params: &Value) -> Vec<Action> {
        if self.state == State::Connected {
            return self.semantic_error(JsonRpcMessage::err(
                id,
                code::OTHER,
                "Subscribe before authorizing",
            ));
        }

        let Some(username) = params.get(0).and_then(Value::as_str) else {
            return self.semantic_error(JsonRpcMessage::err(id, code::OTHER, "Missing worker name"));
        };

        let payout = match address::parse_worker(username, self.settings.network) {
            Ok(payout) => payout,
            Err(e) => {
                info!(session = self.session_id, worker = username, error = %e, "Authorization refused");
                return vec![Action::Send(JsonRpcMessage::ok(id, json!(false)))];
            }
        };

        info!(
            session = self.session_id,
            worker = %payout.worker,
            "Worker authorized"
        );

        self.registry
            .mark_authorized(self.session_id, &payout.worker, payout.script.clone());
        self.registry.set_difficulty(self.session_id, self.difficulty);

        let mut actions = vec![
            Action::Send(JsonRpcMessage::ok(id, json!(true))),
            Action::Send(JsonRpcMessage::notification(
                "mining.set_difficulty",
                json!([self.difficulty]),
            )),
        ];

        if let Some(mask) = self.version_mask {
            actions.push(Action::Send(JsonRpcMessage::notification(
                "mining.set_version_mask",
                json!([format!("{:08x}", mask)]),
            )));
        }

        // Hand the newly authorized miner the current job immediately; it
        // has no earlier work, so the notify always cleans.
        if let Some(job) = self.jobs.current() {
            actions.push(Action::Send(JsonRpcMessage::notification(
                "mining.notify",
                job.notify_params(&payout.script, true),
            )));
        }

        self.payout = Some(payout);
        if self.state == State::Subscribed {
            self.state = State::Authorized;
        }

        actions
    }

    fn on_suggest_difficulty(&mut self, params: &Value) -> Vec<Action> {
        let Some(suggested) = params.get(0).and_then(Value::as_f64) else {
            return Vec::new();
        };

        if !self.settings.accept_suggested_difficulty {
            debug!(
                session = self.session_id,
                suggested, "Ignoring suggested difficulty"
            );
            return Vec::new();
        }

        debug!(session = self.session_id, suggested, "Adopting suggested difficulty");
        self.difficulty = suggested;
        self.registry.set_difficulty(self.session_id, suggested);

        vec![Action::Send(JsonRpcMessage::notification(
            "mining.set_difficulty",
            json!([suggested]),
        ))]
    }

    fn on_submit(&mut self, id: u64, params: &Value) -> Vec<Action> {
        let Some(payout) = self.payout.as_ref() else {
            return self.semantic_error(JsonRpcMessage::err(
                id,
                code::UNAUTHORIZED,
                "Unauthorized worker",
            ));
        };

        let fields: Option<(&str, &str, &str, &str)> = (|| {
            let arr = params.as_array()?;
            Some((
                arr.get(1)?.as_str()?,
                arr.get(2)?.as_str()?,
                arr.get(3)?.as_str()?,
                arr.get(4)?.as_str()?,
            ))
        })();

        let Some((job_id, extranonce2, ntime, nonce)) = fields else {
            return self.semantic_error(JsonRpcMessage::err(id, code::OTHER, "Bad submit params"));
        };

        let share = SubmitShare {
            job_id,
            extranonce2,
            ntime,
            nonce,
            version: params.get(5).and_then(Value::as_str),
        };

        let mut ctx = MinerContext {
            extranonce1: self.extranonce1,
            worker: &payout.worker,
            address: &payout.address,
            payout_script: payout.script.as_script(),
            difficulty: self.difficulty,
            version_mask: self.version_mask,
            seen: &mut self.seen,
        };

        let outcome = self.validator.validate(&mut ctx, &share);
        self.state = State::Active;

        let response = match outcome.error() {
            None => JsonRpcMessage::ok(id, json!(true)),
            Some((code, message)) => {
                debug!(
                    session = self.session_id,
                    job = job_id,
                    reason = message,
                    "Share rejected"
                );
                JsonRpcMessage::err(id, code, message)
            }
        };

        vec![Action::Send(response)]
    }

    fn on_get_transactions(&mut self, id: u64) -> Vec<Action> {
        let transactions: Vec<String> = self
            .jobs
            .current()
            .map(|job| {
                job.template
                    .transactions
                    .iter()
                    .map(|tx| hex::encode(&tx.data))
                    .collect()
            })
            .unwrap_or_default();

        vec![Action::Send(JsonRpcMessage::ok(id, json!(transactions)))]
    }

    /// Answer a semantic error and close if the session keeps producing
    /// them: five strikes inside the window.
    fn semantic_error(&mut self, response: JsonRpcMessage) -> Vec<Action> {
        let now = Instant::now();
        self.strikes.push_back(now);
        while let Some(front) = self.strikes.front() {
            if now.duration_since(*front) > STRIKE_WINDOW {
                self.strikes.pop_front();
            } else {
                break;
            }
        }

        let mut actions = vec![Action::Send(response)];
        if self.strikes.len() >= STRIKE_LIMIT {
            warn!(session = self.session_id, "Too many protocol errors, closing");
            actions.push(Action::Close);
        }
        actions
    }
}

/// Drive one connection to completion.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    jobs: Arc<JobBuffer>,
    validator: Arc<ShareValidator>,
    settings: Arc<SessionSettings>,
) {
    let (mut reader, mut writer) = connection::split(stream);
    let handle = registry.add(peer);
    let session_id = handle.session_id;
    let mut outbound_rx = handle.outbound_rx;
    let outbound_tx = handle.outbound_tx;
    let cancel = handle.cancel;

    debug!(session = session_id, peer = %peer, "Session opened");

    // All writes funnel through this task, serializing responses with
    // registry broadcasts.
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if writer.write_message(&msg).await.is_err() {
                break;
            }
        }
    });

    let mut fsm = SessionFsm::new(
        session_id,
        handle.extranonce1,
        settings,
        jobs,
        validator,
        registry.clone(),
    );

    'session: loop {
        tokio::select! {
            result = reader.read_message() => {
                let msg = match result {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!(session = session_id, "Peer closed connection");
                        break 'session;
                    }
                    Err(e) => {
                        // Framing violations close with no response.
                        debug!(session = session_id, error = %e, "Closing misbehaving connection");
                        break 'session;
                    }
                };

                registry.touch(session_id);

                for action in fsm.handle_message(msg) {
                    match action {
                        Action::Send(msg) => {
                            if outbound_tx.try_send(msg).is_err() {
                                warn!(session = session_id, "Outbound queue full, dropping session");
                                break 'session;
                            }
                        }
                        Action::Close => break 'session,
                    }
                }
            }
            _ = cancel.cancelled() => break 'session,
        }
    }

    registry.remove(session_id);
    drop(outbound_tx);
    let _ = writer_task.await;
    debug!(session = session_id, peer = %peer, "Session closed");
}
