//! ExchangeProtocol: signed request/response key agreement.
//!
//! ```text
//! Initiated ──respond──▶ Responded{accepted} ──▶ Established
//!                                    └──────────▶ Failed
//! ```
//!
//! A responder checks, in order: the initiator key is known and usable, the
//! signature verifies against it, the timestamp is inside the freshness
//! window, the request id has not been answered before, the algorithm tag
//! matches the key, and any capability certificate is trusted. A request
//! that fails a check gets a signed `agreed = false` response carrying the
//! reason; only local faults (missing responder key, HSM failure, shutdown)
//! are returned as errors.

use crate::clock;
use crate::context::EngineContext;
use crate::error::{ExchangeError, Result};
use crate::events::EngineEvent;
use crate::keys::{Curve, KeyAlgorithm, KeyPairInfo, KeyPairManager, KeyStatus};
use crate::store::{AgentPair, Derivation, SharedSecret, SharedSecretStore};
use crate::trust::{put_field, CapabilityCertificate, TrustViolation};
use a2a_crypto::{AgentPublicKey, Blake3Hash};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const NONCE_LEN: usize = 32;

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn put_time(out: &mut Vec<u8>, at: &DateTime<Utc>) {
    out.extend_from_slice(&at.timestamp().to_be_bytes());
    out.extend_from_slice(&at.timestamp_subsec_nanos().to_be_bytes());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangeRequest {
    pub request_id: Uuid,
    pub from: String,
    pub to: String,
    pub initiator_key_id: String,
    pub public_key: AgentPublicKey,
    pub algorithm: KeyAlgorithm,
    pub curve: Option<Curve>,
    pub capabilities: Vec<String>,
    pub certificate: Option<CapabilityCertificate>,
    pub nonce: [u8; NONCE_LEN],
    pub timestamp: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl KeyExchangeRequest {
    /// Canonical bytes covered by the initiator's signature
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        put_field(&mut out, b"a2a-keyx/request/v1");
        put_field(&mut out, self.request_id.as_bytes());
        put_field(&mut out, self.from.as_bytes());
        put_field(&mut out, self.to.as_bytes());
        put_field(&mut out, self.initiator_key_id.as_bytes());
        put_field(&mut out, &self.public_key.to_bytes());
        put_field(&mut out, self.algorithm.name().as_bytes());
        put_field(&mut out, curve_name(self.curve).as_bytes());
        out.extend_from_slice(&(self.capabilities.len() as u32).to_be_bytes());
        for capability in &self.capabilities {
            put_field(&mut out, capability.as_bytes());
        }
        match &self.certificate {
            Some(certificate) => {
                out.push(1);
                put_field(&mut out, &certificate.signing_payload());
                put_field(&mut out, &certificate.signature);
            }
            None => out.push(0),
        }
        put_field(&mut out, &self.nonce);
        put_time(&mut out, &self.timestamp);
        out
    }
}

fn curve_name(curve: Option<Curve>) -> &'static str {
    match curve {
        Some(Curve::X25519) => "X25519",
        None => "",
    }
}

/// Why a responder refused a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    Declined,
    SignatureInvalid,
    StaleRequest { age_secs: i64, window_secs: u64 },
    ReplayedRequest,
    UnknownInitiatorKey { key_id: String },
    InitiatorKeyRevoked { key_id: String },
    InitiatorKeyExpired { key_id: String },
    UntrustedCertificate { detail: String },
    AlgorithmMismatch { offered: KeyAlgorithm, key: KeyAlgorithm },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Declined => write!(f, "declined by responder"),
            RejectionReason::SignatureInvalid => write!(f, "request signature invalid"),
            RejectionReason::StaleRequest { age_secs, window_secs } => {
                write!(f, "request is {}s old, window is {}s", age_secs, window_secs)
            }
            RejectionReason::ReplayedRequest => write!(f, "request id already answered"),
            RejectionReason::UnknownInitiatorKey { key_id } => write!(f, "unknown initiator key {}", key_id),
            RejectionReason::InitiatorKeyRevoked { key_id } => write!(f, "initiator key {} revoked", key_id),
            RejectionReason::InitiatorKeyExpired { key_id } => write!(f, "initiator key {} expired", key_id),
            RejectionReason::UntrustedCertificate { detail } => write!(f, "untrusted certificate: {}", detail),
            RejectionReason::AlgorithmMismatch { offered, key } => {
                write!(f, "request offers {} but the key is {}", offered, key)
            }
        }
    }
}

impl RejectionReason {
    /// Rejections decided after the request id was recorded
    fn is_recorded(&self) -> bool {
        matches!(
            self,
            RejectionReason::Declined
                | RejectionReason::AlgorithmMismatch { .. }
                | RejectionReason::UntrustedCertificate { .. }
        )
    }
}

impl From<TrustViolation> for RejectionReason {
    fn from(violation: TrustViolation) -> Self {
        RejectionReason::UntrustedCertificate {
            detail: violation.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangeResponse {
    pub request_id: Uuid,
    pub response_id: Uuid,
    /// Responder
    pub from: String,
    /// Initiator
    pub to: String,
    pub responder_key_id: String,
    pub public_key: AgentPublicKey,
    pub agreed: bool,
    pub rejection: Option<RejectionReason>,
    /// BLAKE3 of the derived encryption key; only set when `agreed`
    pub shared_secret_hash: Option<Blake3Hash>,
    pub nonce: [u8; NONCE_LEN],
    pub timestamp: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl KeyExchangeResponse {
    /// Canonical bytes covered by the responder's signature
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        put_field(&mut out, b"a2a-keyx/response/v1");
        put_field(&mut out, self.request_id.as_bytes());
        put_field(&mut out, self.response_id.as_bytes());
        put_field(&mut out, self.from.as_bytes());
        put_field(&mut out, self.to.as_bytes());
        put_field(&mut out, self.responder_key_id.as_bytes());
        put_field(&mut out, &self.public_key.to_bytes());
        out.push(self.agreed as u8);
        let rejection = self.rejection.as_ref().map(|r| r.to_string()).unwrap_or_default();
        put_field(&mut out, rejection.as_bytes());
        put_field(
            &mut out,
            self.shared_secret_hash.as_ref().map(|h| &h.as_bytes()[..]).unwrap_or(&[]),
        );
        put_field(&mut out, &self.nonce);
        put_time(&mut out, &self.timestamp);
        out
    }

    /// `Ok` when agreed, otherwise the rejection as an error
    pub fn ensure_agreed(&self) -> Result<()> {
        if self.agreed {
            return Ok(());
        }
        Err(match &self.rejection {
            Some(RejectionReason::SignatureInvalid) => {
                ExchangeError::SignatureInvalid(format!("request {}", self.request_id))
            }
            Some(RejectionReason::StaleRequest { age_secs, window_secs }) => ExchangeError::StaleRequest {
                age_secs: *age_secs,
                window_secs: *window_secs,
            },
            Some(RejectionReason::ReplayedRequest) => ExchangeError::ReplayedRequest(self.request_id),
            Some(RejectionReason::UnknownInitiatorKey { key_id }) => ExchangeError::KeyNotFound(key_id.clone()),
            Some(RejectionReason::InitiatorKeyRevoked { key_id }) => ExchangeError::KeyRevoked(key_id.clone()),
            Some(RejectionReason::InitiatorKeyExpired { key_id }) => ExchangeError::KeyExpired(key_id.clone()),
            Some(other) => ExchangeError::Validation(format!("exchange {} rejected: {}", self.request_id, other)),
            None => ExchangeError::Validation(format!("exchange {} rejected", self.request_id)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeState {
    Initiated,
    Responded { accepted: bool },
    Established,
    Failed,
}

impl ExchangeState {
    pub fn is_final(&self) -> bool {
        matches!(self, ExchangeState::Established | ExchangeState::Failed)
    }
}

/// A request this engine signed as initiator
struct IssuedExchange {
    request: KeyExchangeRequest,
    state: ExchangeState,
}

/// A request this engine answered as responder
struct AnsweredExchange {
    timestamp: DateTime<Utc>,
    state: ExchangeState,
}

/// Records dropped by one [`ExchangeProtocol::prune`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub completed: usize,
    pub issued: usize,
}

fn validate_request(request: &KeyExchangeRequest) -> Result<AgentPair> {
    if request.initiator_key_id.is_empty() {
        return Err(ExchangeError::Validation("request has no initiator key id".to_string()));
    }
    if request.signature.is_empty() {
        return Err(ExchangeError::Validation("request is unsigned".to_string()));
    }
    AgentPair::new(&request.from, &request.to)
}

fn ordered_source_keys(pair: &AgentPair, agent: &str, agent_key: &str, peer_key: &str) -> (String, String) {
    if pair.first() == agent {
        (agent_key.to_string(), peer_key.to_string())
    } else {
        (peer_key.to_string(), agent_key.to_string())
    }
}

pub struct ExchangeProtocol {
    ctx: Arc<EngineContext>,
    keys: Arc<KeyPairManager>,
    store: Arc<SharedSecretStore>,
    /// (from, to) -> request awaiting an answer
    pending: DashMap<(String, String), Uuid>,
    issued: DashMap<Uuid, IssuedExchange>,
    completed: DashMap<Uuid, AnsweredExchange>,
}

impl ExchangeProtocol {
    pub(crate) fn new(ctx: Arc<EngineContext>, keys: Arc<KeyPairManager>, store: Arc<SharedSecretStore>) -> Self {
        Self {
            ctx,
            keys,
            store,
            pending: DashMap::new(),
            issued: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    /// Build and sign a request from `from` to `to`.
    ///
    /// While a request for the same ordered pair is pending and still fresh,
    /// that request is returned unchanged instead of a new one.
    pub async fn initiate_key_exchange(
        &self,
        from: &str,
        to: &str,
        capabilities: Vec<String>,
        certificate: Option<CapabilityCertificate>,
    ) -> Result<KeyExchangeRequest> {
        self.ctx.ensure_running()?;
        AgentPair::new(from, to)?;
        let route = (from.to_string(), to.to_string());

        if let Some(existing) = self.live_pending(&route) {
            debug!(from, to, request_id = %existing.request_id, "Returning pending exchange request");
            return Ok(existing);
        }

        let key = self.keys.get_active_key(from)?;
        if !key.has_private_key() {
            return Err(ExchangeError::Validation(format!(
                "agent {} is a remote peer and cannot initiate here",
                from
            )));
        }

        let mut request = KeyExchangeRequest {
            request_id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.to_string(),
            initiator_key_id: key.key_id.clone(),
            public_key: key.public_key,
            algorithm: key.algorithm,
            curve: key.curve,
            capabilities,
            certificate,
            nonce: fresh_nonce(),
            timestamp: self.ctx.now(),
            signature: Vec::new(),
        };
        request.signature = self.keys.sign(&key.key_id, &request.signing_payload()).await?;

        // Concurrent initiates for the same route collapse onto one request
        match self.pending.entry(route) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = self.fresh_issued(*entry.get()) {
                    return Ok(existing);
                }
                entry.insert(request.request_id);
            }
            Entry::Vacant(entry) => {
                entry.insert(request.request_id);
            }
        }
        self.issued.insert(
            request.request_id,
            IssuedExchange {
                request: request.clone(),
                state: ExchangeState::Initiated,
            },
        );

        debug!(from, to, request_id = %request.request_id, key_id = %key.key_id, "Initiated key exchange");
        self.ctx.emit(EngineEvent::ExchangeInitiated {
            request_id: request.request_id,
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(request)
    }

    fn live_pending(&self, route: &(String, String)) -> Option<KeyExchangeRequest> {
        let request_id = *self.pending.get(route)?;
        self.fresh_issued(request_id)
    }

    /// An issued request still awaiting an answer inside the freshness window
    fn fresh_issued(&self, request_id: Uuid) -> Option<KeyExchangeRequest> {
        let window = self.ctx.config().freshness_window;
        let now = self.ctx.now();
        self.issued.get(&request_id).and_then(|issued| {
            let fresh = now < clock::after(issued.request.timestamp, window);
            (issued.state == ExchangeState::Initiated && fresh).then(|| issued.request.clone())
        })
    }

    /// Answer `request` as its addressee.
    ///
    /// Trust failures produce a signed response with `agreed = false`.
    pub async fn respond_to_key_exchange(
        &self,
        request: &KeyExchangeRequest,
        accept: bool,
    ) -> Result<KeyExchangeResponse> {
        self.ctx.ensure_running()?;

        match self.answer(request, accept).await {
            Ok(response) => Ok(response),
            Err(err) => {
                let recorded = self
                    .completed
                    .get(&request.request_id)
                    .map_or(false, |answered| !answered.state.is_final());
                if recorded {
                    self.finish(request.request_id, ExchangeState::Failed);
                }
                self.record_failure(request.request_id, &request.from, &request.to, &err.to_string());
                Err(err)
            }
        }
    }

    async fn answer(&self, request: &KeyExchangeRequest, accept: bool) -> Result<KeyExchangeResponse> {
        let pair = validate_request(request)?;
        let responder = self.keys.get_active_key(&request.to)?;
        if !responder.has_private_key() {
            return Err(ExchangeError::Validation(format!(
                "agent {} is not managed by this engine",
                request.to
            )));
        }

        let now = self.ctx.now();
        let verdict = self.check_request(request, accept, now).and_then(|initiator| {
            if accept {
                Ok(initiator)
            } else {
                Err(RejectionReason::Declined)
            }
        });

        let record = match &verdict {
            Ok(initiator) => {
                let raw = self
                    .keys
                    .diffie_hellman(&responder.key_id, &initiator.public_key)
                    .await?;
                let record = SharedSecret::derive(
                    Derivation {
                        source_keys: ordered_source_keys(
                            &pair,
                            &request.to,
                            &responder.key_id,
                            &initiator.key_id,
                        ),
                        pair: pair.clone(),
                        raw: &raw,
                        algorithm: responder.algorithm,
                        established_by: Some(request.request_id),
                        generation: 0,
                    },
                    &self.ctx.policy(),
                    now,
                )?;
                Some(record)
            }
            Err(_) => None,
        };
        let rejection = verdict.err();

        let mut response = KeyExchangeResponse {
            request_id: request.request_id,
            response_id: Uuid::new_v4(),
            from: request.to.clone(),
            to: request.from.clone(),
            responder_key_id: responder.key_id.clone(),
            public_key: responder.public_key,
            agreed: record.is_some(),
            rejection: rejection.clone(),
            shared_secret_hash: record.as_ref().map(|r| r.shared_secret_hash()),
            nonce: fresh_nonce(),
            timestamp: now,
            signature: Vec::new(),
        };
        response.signature = self.keys.sign(&responder.key_id, &response.signing_payload()).await?;

        match (record, rejection) {
            (Some(record), _) => {
                let stored = self.store.store_established(record);
                self.finish(request.request_id, ExchangeState::Established);
                self.ctx.metrics.key_exchanges.inc();
                info!(
                    request_id = %request.request_id,
                    pair = %stored.pair,
                    secret_id = %stored.secret_id,
                    "Key exchange established"
                );
                self.ctx.emit(EngineEvent::ExchangeEstablished {
                    request_id: request.request_id,
                    secret_id: stored.secret_id,
                    pair: stored.pair.clone(),
                });
            }
            (None, Some(reason)) => {
                if reason.is_recorded() {
                    self.finish(request.request_id, ExchangeState::Failed);
                }
                self.record_failure(request.request_id, &request.from, &request.to, &reason.to_string());
            }
            (None, None) => {}
        }
        Ok(response)
    }

    /// Authenticate `request` and record its id. Returns the initiator key.
    fn check_request(
        &self,
        request: &KeyExchangeRequest,
        accept: bool,
        now: DateTime<Utc>,
    ) -> std::result::Result<KeyPairInfo, RejectionReason> {
        let config = self.ctx.config();
        let key_id = request.initiator_key_id.clone();

        let initiator = match self.keys.key_info(&request.initiator_key_id) {
            Ok(info) if info.agent_id == request.from => info,
            _ => return Err(RejectionReason::UnknownInitiatorKey { key_id }),
        };
        match initiator.effective_status(now, config.rotation_grace_period) {
            KeyStatus::Revoked => return Err(RejectionReason::InitiatorKeyRevoked { key_id }),
            KeyStatus::Expired => return Err(RejectionReason::InitiatorKeyExpired { key_id }),
            KeyStatus::Active | KeyStatus::Rotating => {}
        }

        if initiator.public_key != request.public_key
            || initiator
                .public_key
                .verify(&request.signing_payload(), &request.signature)
                .is_err()
        {
            return Err(RejectionReason::SignatureInvalid);
        }

        let age = now.signed_duration_since(request.timestamp);
        let window = clock::to_chrono(config.freshness_window);
        if age > window || age < -window {
            return Err(RejectionReason::StaleRequest {
                age_secs: age.num_seconds(),
                window_secs: config.freshness_window.as_secs(),
            });
        }

        match self.completed.entry(request.request_id) {
            Entry::Occupied(_) => return Err(RejectionReason::ReplayedRequest),
            Entry::Vacant(entry) => {
                entry.insert(AnsweredExchange {
                    timestamp: request.timestamp,
                    state: ExchangeState::Responded { accepted: accept },
                });
            }
        }

        if request.algorithm != initiator.algorithm || request.curve != initiator.curve {
            return Err(RejectionReason::AlgorithmMismatch {
                offered: request.algorithm,
                key: initiator.algorithm,
            });
        }

        match &request.certificate {
            Some(certificate) => {
                self.ctx
                    .trusted
                    .verify(certificate, &request.from, &request.capabilities, now)?;
            }
            None if config.require_certificates => return Err(TrustViolation::Missing.into()),
            None => {}
        }

        Ok(initiator)
    }

    /// Check a response to a request this engine issued and store the secret.
    ///
    /// Recomputes the agreement from the initiator side; the responder's
    /// `shared_secret_hash` must match bit for bit.
    pub async fn confirm_key_exchange(&self, response: &KeyExchangeResponse) -> Result<Arc<SharedSecret>> {
        self.ctx.ensure_running()?;

        let request = self
            .issued
            .get(&response.request_id)
            .map(|issued| issued.request.clone())
            .ok_or_else(|| {
                ExchangeError::Validation(format!("response to unknown request {}", response.request_id))
            })?;
        if response.from != request.to || response.to != request.from {
            return Err(ExchangeError::Validation(format!(
                "response for {} does not match its request route",
                response.request_id
            )));
        }

        let now = self.ctx.now();
        let config = self.ctx.config();
        let responder = self.keys.key_info(&response.responder_key_id)?;
        if responder.agent_id != response.from {
            return Err(ExchangeError::KeyNotFound(response.responder_key_id.clone()));
        }
        match responder.effective_status(now, config.rotation_grace_period) {
            KeyStatus::Revoked => return Err(ExchangeError::KeyRevoked(responder.key_id)),
            KeyStatus::Expired => return Err(ExchangeError::KeyExpired(responder.key_id)),
            KeyStatus::Active | KeyStatus::Rotating => {}
        }
        if responder.public_key != response.public_key
            || responder
                .public_key
                .verify(&response.signing_payload(), &response.signature)
                .is_err()
        {
            self.record_failure(response.request_id, &request.from, &request.to, "response signature invalid");
            return Err(ExchangeError::SignatureInvalid(format!("response {}", response.response_id)));
        }

        let age = now.signed_duration_since(response.timestamp);
        let window = clock::to_chrono(config.freshness_window);
        if age > window || age < -window {
            return Err(ExchangeError::StaleRequest {
                age_secs: age.num_seconds(),
                window_secs: config.freshness_window.as_secs(),
            });
        }

        if let Err(err) = response.ensure_agreed() {
            self.finish(response.request_id, ExchangeState::Failed);
            return Err(err);
        }
        let expected = response.shared_secret_hash.ok_or_else(|| {
            ExchangeError::Validation(format!("agreed response {} carries no secret hash", response.response_id))
        })?;

        let pair = AgentPair::new(&request.from, &request.to)?;
        let raw = self
            .keys
            .diffie_hellman(&request.initiator_key_id, &responder.public_key)
            .await?;
        let record = SharedSecret::derive(
            Derivation {
                source_keys: ordered_source_keys(&pair, &request.from, &request.initiator_key_id, &responder.key_id),
                pair,
                raw: &raw,
                algorithm: request.algorithm,
                established_by: Some(request.request_id),
                generation: 0,
            },
            &self.ctx.policy(),
            now,
        )?;
        drop(raw);

        if !record.shared_secret_hash().ct_eq(&expected) {
            self.finish(response.request_id, ExchangeState::Failed);
            self.record_failure(response.request_id, &request.from, &request.to, "shared secret hash mismatch");
            return Err(ExchangeError::Validation(format!(
                "shared secret hash mismatch for exchange {}",
                response.request_id
            )));
        }

        let derived_id = record.secret_id;
        let stored = self.store.store_established(record);
        self.finish(response.request_id, ExchangeState::Established);

        // Both sides on this engine: the responder already published it
        if stored.secret_id == derived_id {
            self.ctx.metrics.key_exchanges.inc();
            info!(request_id = %response.request_id, pair = %stored.pair, "Key exchange confirmed");
            self.ctx.emit(EngineEvent::ExchangeEstablished {
                request_id: response.request_id,
                secret_id: stored.secret_id,
                pair: stored.pair.clone(),
            });
        }
        Ok(stored)
    }

    /// Move an exchange to `state` on whichever sides this engine played
    fn finish(&self, request_id: Uuid, state: ExchangeState) {
        if let Some(mut answered) = self.completed.get_mut(&request_id) {
            answered.state = state;
        }
        let route = self.issued.get_mut(&request_id).map(|mut issued| {
            issued.state = state;
            (issued.request.from.clone(), issued.request.to.clone())
        });
        if let Some(route) = route {
            self.pending.remove_if(&route, |_, pending| *pending == request_id);
        }
    }

    fn record_failure(&self, request_id: Uuid, from: &str, to: &str, reason: &str) {
        self.ctx.metrics.failed_exchanges.inc();
        warn!(request_id = %request_id, from, to, reason, "Key exchange failed");
        self.ctx.emit(EngineEvent::ExchangeFailed {
            request_id,
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn exchange_state(&self, request_id: Uuid) -> Option<ExchangeState> {
        self.issued
            .get(&request_id)
            .map(|issued| issued.state)
            .or_else(|| self.completed.get(&request_id).map(|answered| answered.state))
    }

    /// Requests still awaiting an answer
    pub fn pending_requests(&self) -> Vec<KeyExchangeRequest> {
        self.pending
            .iter()
            .filter_map(|entry| self.issued.get(entry.value()).map(|issued| issued.request.clone()))
            .collect()
    }

    /// Drop bookkeeping that can no longer matter.
    ///
    /// Answered ids are kept for twice the freshness window: by then any
    /// replay of them is already rejected as stale.
    pub fn prune(&self, now: DateTime<Utc>) -> PruneReport {
        let window = self.ctx.config().freshness_window;
        let replay_horizon = clock::before(now, window.saturating_mul(2));
        let accept_horizon = clock::before(now, window);

        let completed_before = self.completed.len();
        self.completed.retain(|_, answered| answered.timestamp >= replay_horizon);

        let issued_before = self.issued.len();
        self.issued.retain(|_, issued| {
            let horizon = if issued.state.is_final() { replay_horizon } else { accept_horizon };
            issued.request.timestamp >= horizon
        });
        self.pending.retain(|_, request_id| self.issued.contains_key(request_id));

        let report = PruneReport {
            completed: completed_before - self.completed.len(),
            issued: issued_before - self.issued.len(),
        };
        if report != PruneReport::default() {
            debug!(completed = report.completed, issued = report.issued, "Pruned exchange records");
        }
        report
    }
}
