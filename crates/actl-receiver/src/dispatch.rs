//! Control request dispatcher.
//!
//! [`ControlReceiver`] owns the full decision pipeline for one inbound
//! request line:
//!
//! 1. decode + structural validation (rejects answer immediately, no dedup
//!    slot consumed)
//! 2. same-team authorization (ditto)
//! 3. unsupported-interrupt rejection (ditto, so repeats never look like
//!    duplicates)
//! 4. single-flight dedup reservation
//! 5. per-target queue slot, then liveness gate
//! 6. content resolution and adapter execution under the exec timeout
//! 7. record finalization and ack construction
//!
//! Liveness failures release the reservation instead of finalizing it, so a
//! retry of the same `request_id` re-evaluates liveness at delivery time.

use crate::adapter::{Outcome, WorkerAdapter};
use crate::audit::{AuditEvent, AuditHandle, AuditKind};
use crate::authz::{Access, AuthzPolicy};
use crate::config::ReceiverConfig;
use crate::content_ref;
use crate::dedup::{DedupKey, DedupRecord, DedupStore, Reservation, ReservationGuard};
use crate::liveness::{self, LivenessDecision, SessionRegistry, SessionTarget};
use crate::queue::SessionQueues;
use agent_ctl_core::codec::{
    self, AckFields, InboundRequest, ValidationError, ack_fields_from_value,
};
use agent_ctl_core::control::{
    CONTROL_SCHEMA_VERSION, ControlAck, ControlEnvelope, ControlMessage, ResultCode, StdinRequest,
};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The receiver's decision engine. Collaborators are injected so backends,
/// rosters, and registries can vary without touching the pipeline.
pub struct ControlReceiver {
    config: ReceiverConfig,
    dedup: DedupStore,
    queues: SessionQueues,
    registry: Arc<dyn SessionRegistry>,
    adapter: Arc<dyn WorkerAdapter>,
    authz: Arc<dyn AuthzPolicy>,
    audit: AuditHandle,
}

impl ControlReceiver {
    pub fn new(
        config: ReceiverConfig,
        registry: Arc<dyn SessionRegistry>,
        adapter: Arc<dyn WorkerAdapter>,
        authz: Arc<dyn AuthzPolicy>,
        audit: AuditHandle,
    ) -> Self {
        let dedup = DedupStore::new(
            config.dedup_ttl,
            config.dedup_capacity,
            config.pending_wait,
        );
        Self {
            config,
            dedup,
            queues: SessionQueues::new(),
            registry,
            adapter,
            authz,
            audit,
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    /// Periodic dedup sweep plus queue pruning, until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let receiver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(receiver.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        receiver.dedup.sweep();
                        receiver.queues.prune();
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }

    /// Process one raw socket line and produce the response line.
    pub async fn handle_line(&self, raw: &str) -> String {
        let envelope = match codec::decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Recover whatever correlation fields the raw line carries so
                // the sender can still match the rejection to its request.
                let payload = serde_json::from_str(raw).unwrap_or(serde_json::Value::Null);
                let fields = ack_fields_from_value(payload.get("payload").unwrap_or(&payload));
                let envelope_id = payload
                    .get("request_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let ack = self.rejection_ack(&fields, &err);
                self.audit_rejection(&fields, &ack, rejection_action(payload.get("payload")));
                return encode_response(&envelope_id, ack_message(payload.get("payload"), ack));
            }
        };
        let response = self.handle_envelope(&envelope).await;
        serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string())
    }

    /// Process a decoded envelope into a response envelope.
    pub async fn handle_envelope(&self, envelope: &ControlEnvelope) -> ControlEnvelope {
        match codec::decode_request(envelope, &self.config.validation_limits()) {
            Ok(request) => {
                let ack = self.handle_request(&request).await;
                let message = match request {
                    InboundRequest::Stdin(_) => ControlMessage::StdinAck(ack),
                    InboundRequest::Interrupt(_) => ControlMessage::InterruptAck(ack),
                };
                respond(&envelope.request_id, message)
            }
            Err(err) => {
                let fields = ack_fields_from_value(&envelope.payload);
                let ack = self.rejection_ack(&fields, &err);
                self.audit_rejection(&fields, &ack, rejection_action(Some(&envelope.payload)));
                respond(
                    &envelope.request_id,
                    ack_message(Some(&envelope.payload), ack),
                )
            }
        }
    }

    /// Run the post-validation pipeline for one typed request.
    pub async fn handle_request(&self, request: &InboundRequest) -> ControlAck {
        self.audit.emit(AuditEvent {
            kind: AuditKind::RequestReceived,
            level: "info",
            action: request.action_name(),
            detail: embedded_interrupt_note(request),
            ..self.base_event(request)
        });

        // Authorization runs before any dedup bookkeeping: a denied request
        // must not consume the single-flight slot for its request_id.
        if let Access::Deny(reason) = self.authz.check(
            request.sender(),
            request.team(),
            request.agent_id(),
        ) {
            warn!(
                sender = request.sender(),
                team = request.team(),
                "control request denied: {reason}"
            );
            let ack = self.fresh_ack(request, ResultCode::Rejected, Some(reason), None);
            self.emit_ack_event(request, &ack);
            return ack;
        }

        // Unsupported interrupt is a stable property of the backend, not an
        // outcome of this delivery; rejecting before the reservation keeps
        // repeats from ever reading as duplicates.
        let target = SessionTarget::new(request.session_id(), request.agent_id());
        if matches!(request, InboundRequest::Interrupt(_))
            && !self.adapter.supports_interrupt(&target)
        {
            let ack = self.fresh_ack(
                request,
                ResultCode::Rejected,
                Some("interrupt is not supported for this target".to_string()),
                None,
            );
            self.emit_ack_event(request, &ack);
            return ack;
        }

        let key = DedupKey::new(
            request.team(),
            request.session_id(),
            request.agent_id(),
            request.request_id(),
        );
        match self.dedup.reserve_or_get(key).await {
            Reservation::Cached(record) => {
                debug!(
                    request_id = request.request_id(),
                    served = record.duplicate_served,
                    "replaying stored outcome for duplicate"
                );
                let ack = self.replay_ack(request, &record);
                self.audit.emit(AuditEvent {
                    kind: AuditKind::DuplicateReplayed,
                    level: "info",
                    action: request.action_name(),
                    result: Some(record.result.to_string()),
                    duplicate: Some(true),
                    ..self.base_event(request)
                });
                ack
            }
            Reservation::WaitTimeout => {
                let ack = self.ack_for(
                    request,
                    ResultCode::Timeout,
                    true,
                    Some("original request still in flight".to_string()),
                    None,
                    now_rfc3339(),
                );
                self.emit_ack_event(request, &ack);
                ack
            }
            Reservation::Reserved(guard) => {
                let ack = self.execute(request, &target, guard).await;
                self.emit_ack_event(request, &ack);
                ack
            }
        }
    }

    /// Liveness check plus adapter execution, serialized per target.
    async fn execute(
        &self,
        request: &InboundRequest,
        target: &SessionTarget,
        guard: ReservationGuard,
    ) -> ControlAck {
        let _slot = self.queues.acquire(target).await;

        match liveness::evaluate(self.registry.status(target)) {
            LivenessDecision::NotFound => {
                // Not cached: the target may register before the retry.
                guard.release();
                return self.fresh_ack(
                    request,
                    ResultCode::NotFound,
                    Some("unknown session or agent".to_string()),
                    None,
                );
            }
            LivenessDecision::NotLive(reason) => {
                guard.release();
                return self.fresh_ack(request, ResultCode::NotLive, Some(reason), None);
            }
            LivenessDecision::Live => {}
        }

        let (result, detail, error) = match request {
            InboundRequest::Stdin(stdin) => self.execute_stdin(stdin, target).await,
            InboundRequest::Interrupt(_) => {
                let outcome = timeout(
                    self.config.exec_timeout,
                    self.adapter.interrupt(target),
                )
                .await;
                map_outcome(outcome, "interrupt delivered")
            }
        };

        let acked_at = now_rfc3339();
        let record = guard.finalize(result, detail, error, acked_at);
        if record.result == ResultCode::Ok {
            info!(
                request_id = request.request_id(),
                target_id = %target,
                "control request delivered"
            );
        }
        self.ack_for(
            request,
            record.result,
            false,
            record.detail.clone(),
            record.error.clone(),
            record.acked_at.clone(),
        )
    }

    async fn execute_stdin(
        &self,
        request: &StdinRequest,
        target: &SessionTarget,
    ) -> (ResultCode, Option<String>, Option<String>) {
        let bytes = match (&request.content, &request.content_ref) {
            (Some(content), None) => {
                if content.len() >= self.config.soft_limit_bytes {
                    warn!(
                        request_id = request.request_id,
                        size = content.len(),
                        "inline content exceeds soft limit"
                    );
                    self.audit.emit(AuditEvent {
                        kind: AuditKind::SoftLimitExceeded,
                        level: "warn",
                        action: "control_stdin",
                        team: Some(request.team.clone()),
                        session_id: Some(request.session_id.clone()),
                        agent_id: Some(request.agent_id.clone()),
                        sender: Some(request.sender.clone()),
                        request_id: Some(request.request_id.clone()),
                        size_bytes: Some(content.len() as u64),
                        ..Default::default()
                    });
                }
                content.clone().into_bytes()
            }
            (None, Some(content_ref)) => {
                match content_ref::resolve(content_ref, &self.config.content_dir) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        return (ResultCode::Rejected, Some(err.to_string()), None);
                    }
                }
            }
            // Validation guarantees exactly one is present.
            _ => {
                return (
                    ResultCode::InternalError,
                    None,
                    Some("request body invariant violated".to_string()),
                );
            }
        };

        let outcome = timeout(self.config.exec_timeout, self.adapter.inject(target, &bytes)).await;
        map_outcome(outcome, "delivered")
    }

    // ── Ack helpers ──────────────────────────────────────────────────────

    fn ack_for(
        &self,
        request: &InboundRequest,
        result: ResultCode,
        duplicate: bool,
        detail: Option<String>,
        error: Option<String>,
        acked_at: String,
    ) -> ControlAck {
        ControlAck {
            v: CONTROL_SCHEMA_VERSION,
            request_id: request.request_id().to_string(),
            team: request.team().to_string(),
            session_id: request.session_id().to_string(),
            agent_id: request.agent_id().to_string(),
            acked_at,
            result,
            duplicate,
            detail,
            error,
        }
    }

    fn fresh_ack(
        &self,
        request: &InboundRequest,
        result: ResultCode,
        detail: Option<String>,
        error: Option<String>,
    ) -> ControlAck {
        self.ack_for(request, result, false, detail, error, now_rfc3339())
    }

    /// Ack replaying a stored record; `acked_at` is the original decision
    /// time, not now.
    fn replay_ack(&self, request: &InboundRequest, record: &DedupRecord) -> ControlAck {
        self.ack_for(
            request,
            record.result,
            true,
            record.detail.clone(),
            record.error.clone(),
            record.acked_at.clone(),
        )
    }

    fn rejection_ack(&self, fields: &AckFields, err: &ValidationError) -> ControlAck {
        ControlAck {
            v: CONTROL_SCHEMA_VERSION,
            request_id: fields.request_id.clone(),
            team: fields.team.clone(),
            session_id: fields.session_id.clone(),
            agent_id: fields.agent_id.clone(),
            acked_at: now_rfc3339(),
            result: ResultCode::Rejected,
            duplicate: false,
            detail: Some(err.to_string()),
            error: None,
        }
    }

    // ── Audit helpers ────────────────────────────────────────────────────

    fn base_event(&self, request: &InboundRequest) -> AuditEvent {
        AuditEvent {
            team: Some(request.team().to_string()),
            session_id: Some(request.session_id().to_string()),
            agent_id: Some(request.agent_id().to_string()),
            sender: Some(request.sender().to_string()),
            request_id: Some(request.request_id().to_string()),
            message_text: match request {
                InboundRequest::Stdin(r) => r.content.clone(),
                InboundRequest::Interrupt(_) => None,
            },
            ..Default::default()
        }
    }

    fn emit_ack_event(&self, request: &InboundRequest, ack: &ControlAck) {
        let failed = !matches!(ack.result, ResultCode::Ok);
        self.audit.emit(AuditEvent {
            kind: if failed {
                AuditKind::RequestFailed
            } else {
                AuditKind::AckEmitted
            },
            level: if failed { "warn" } else { "info" },
            action: request.action_name(),
            result: Some(ack.result.to_string()),
            detail: ack.detail.clone(),
            duplicate: Some(ack.duplicate),
            ..self.base_event(request)
        });
    }

    fn audit_rejection(&self, fields: &AckFields, ack: &ControlAck, action: &'static str) {
        self.audit.emit(AuditEvent {
            kind: AuditKind::RequestFailed,
            level: "warn",
            action,
            team: Some(fields.team.clone()),
            session_id: Some(fields.session_id.clone()),
            agent_id: Some(fields.agent_id.clone()),
            request_id: Some(fields.request_id.clone()),
            result: Some(ack.result.to_string()),
            detail: ack.detail.clone(),
            ..Default::default()
        });
    }
}

/// Note recorded when a stdin request carries the advisory embedded
/// interrupt flag, which delivery ignores.
fn embedded_interrupt_note(request: &InboundRequest) -> Option<String> {
    match request {
        InboundRequest::Stdin(r) if r.interrupt == Some(true) => {
            Some("embedded interrupt flag ignored".to_string())
        }
        _ => None,
    }
}

fn map_outcome(
    outcome: Result<Outcome, tokio::time::error::Elapsed>,
    delivered_detail: &str,
) -> (ResultCode, Option<String>, Option<String>) {
    match outcome {
        Ok(Outcome::Delivered) => (ResultCode::Ok, Some(delivered_detail.to_string()), None),
        Ok(Outcome::Busy) => (
            ResultCode::Busy,
            Some("worker cannot accept input right now".to_string()),
            None,
        ),
        Ok(Outcome::Failed(err)) => (ResultCode::InternalError, None, Some(err)),
        Err(_) => (
            ResultCode::Timeout,
            Some("worker did not accept input within the execution bound".to_string()),
            None,
        ),
    }
}

/// Whether a (possibly malformed) payload claims to be an interrupt request,
/// by its wire `type`.
fn payload_is_interrupt(payload: Option<&serde_json::Value>) -> bool {
    payload
        .and_then(|p| p.get("type"))
        .and_then(serde_json::Value::as_str)
        .is_some_and(|t| t.contains("interrupt"))
}

/// Audit action for a payload that failed validation.
fn rejection_action(payload: Option<&serde_json::Value>) -> &'static str {
    if payload_is_interrupt(payload) {
        "control_interrupt"
    } else {
        "control_stdin"
    }
}

/// Pick the ack wire tag from the original payload's `type`, defaulting to
/// the stdin ack when the payload is unrecognizable.
fn ack_message(payload: Option<&serde_json::Value>, ack: ControlAck) -> ControlMessage {
    if payload_is_interrupt(payload) {
        ControlMessage::InterruptAck(ack)
    } else {
        ControlMessage::StdinAck(ack)
    }
}

fn respond(envelope_id: &str, message: ControlMessage) -> ControlEnvelope {
    let payload = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);
    ControlEnvelope::response(envelope_id, payload)
}

fn encode_response(envelope_id: &str, message: ControlMessage) -> String {
    serde_json::to_string(&respond(envelope_id, message)).unwrap_or_else(|_| "{}".to_string())
}
