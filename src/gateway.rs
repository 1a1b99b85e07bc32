//! Payment gateway collaborator.
//!
//! The engine only ever talks to [`PaymentGateway`]; money actions pass
//! an idempotency key with every request so a retried call can never
//! double-move funds. [`SimGateway`] stands in for the real processor:
//! it dedups by key the way production gateways do, and failure modes
//! can be scripted per call for tests and load runs.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::MoneyAction;

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub method_ref: String,
    /// Connected account the funds route to, when configured.
    pub destination: Option<String>,
    pub platform_fee_cents: i64,
    pub booking_id: Ulid,
    pub action: MoneyAction,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub charge_ref: String,
    pub amount_cents: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCharge {
    pub external_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySetup {
    pub setup_ref: String,
    pub client_secret: String,
}

#[derive(Debug)]
pub enum GatewayError {
    Declined(String),
    RequiresAction(String),
    Unavailable(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Declined(r) => write!(f, "declined: {r}"),
            GatewayError::RequiresAction(r) => write!(f, "requires action: {r}"),
            GatewayError::Unavailable(r) => write!(f, "unavailable: {r}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, req: ChargeRequest) -> Result<GatewayCharge, GatewayError>;
    async fn create_refund(&self, req: RefundRequest) -> Result<GatewayCharge, GatewayError>;
    async fn create_setup(&self, booking_id: Ulid) -> Result<GatewaySetup, GatewayError>;
}

/// Next scripted behavior for a [`SimGateway`] call. Consumed per call
/// that reaches the processor (dedup hits consume nothing).
#[derive(Debug, Clone)]
pub enum SimOutcome {
    Succeed,
    Decline(&'static str),
    RequireAction,
    Unavailable,
    /// Stall longer than any caller timeout.
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedCharge {
    pub external_ref: String,
    pub amount_cents: i64,
    pub platform_fee_cents: i64,
    pub refund_of: Option<String>,
    pub idempotency_key: String,
}

/// In-process gateway simulation.
pub struct SimGateway {
    seq: AtomicU64,
    /// Idempotency key → external ref of the already-processed call.
    keyed: Mutex<HashMap<String, String>>,
    charges: Mutex<Vec<RecordedCharge>>,
    script: Mutex<VecDeque<SimOutcome>>,
}

impl SimGateway {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
            keyed: Mutex::new(HashMap::new()),
            charges: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_script(outcomes: Vec<SimOutcome>) -> Self {
        Self {
            seq: AtomicU64::new(1),
            keyed: Mutex::new(HashMap::new()),
            charges: Mutex::new(Vec::new()),
            script: Mutex::new(outcomes.into()),
        }
    }

    pub async fn push_outcome(&self, outcome: SimOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    /// Everything the processor accepted, for assertions.
    pub async fn recorded(&self) -> Vec<RecordedCharge> {
        self.charges.lock().await.clone()
    }

    fn next_ref(&self, prefix: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{n:06}")
    }

    async fn next_outcome(&self) -> SimOutcome {
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(SimOutcome::Succeed)
    }

    async fn run_outcome(&self, outcome: SimOutcome) -> Result<(), GatewayError> {
        match outcome {
            SimOutcome::Succeed => Ok(()),
            SimOutcome::Decline(reason) => Err(GatewayError::Declined(reason.into())),
            SimOutcome::RequireAction => {
                Err(GatewayError::RequiresAction("authentication required".into()))
            }
            SimOutcome::Unavailable => {
                Err(GatewayError::Unavailable("processor offline".into()))
            }
            SimOutcome::Hang => {
                // Outlive any caller timeout; the caller drops us first.
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

impl Default for SimGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for SimGateway {
    async fn create_charge(&self, req: ChargeRequest) -> Result<GatewayCharge, GatewayError> {
        if let Some(existing) = self.keyed.lock().await.get(&req.idempotency_key) {
            return Ok(GatewayCharge {
                external_ref: existing.clone(),
            });
        }
        let outcome = self.next_outcome().await;
        self.run_outcome(outcome).await?;

        let external_ref = self.next_ref("ch");
        self.charges.lock().await.push(RecordedCharge {
            external_ref: external_ref.clone(),
            amount_cents: req.amount_cents,
            platform_fee_cents: req.platform_fee_cents,
            refund_of: None,
            idempotency_key: req.idempotency_key.clone(),
        });
        self.keyed
            .lock()
            .await
            .insert(req.idempotency_key, external_ref.clone());
        Ok(GatewayCharge { external_ref })
    }

    async fn create_refund(&self, req: RefundRequest) -> Result<GatewayCharge, GatewayError> {
        if let Some(existing) = self.keyed.lock().await.get(&req.idempotency_key) {
            return Ok(GatewayCharge {
                external_ref: existing.clone(),
            });
        }
        let outcome = self.next_outcome().await;
        self.run_outcome(outcome).await?;

        let external_ref = self.next_ref("re");
        self.charges.lock().await.push(RecordedCharge {
            external_ref: external_ref.clone(),
            amount_cents: -req.amount_cents,
            platform_fee_cents: 0,
            refund_of: Some(req.charge_ref),
            idempotency_key: req.idempotency_key.clone(),
        });
        self.keyed
            .lock()
            .await
            .insert(req.idempotency_key, external_ref.clone());
        Ok(GatewayCharge { external_ref })
    }

    async fn create_setup(&self, _booking_id: Ulid) -> Result<GatewaySetup, GatewayError> {
        let outcome = self.next_outcome().await;
        self.run_outcome(outcome).await?;
        let setup_ref = self.next_ref("seti");
        let client_secret = format!("{setup_ref}_secret");
        Ok(GatewaySetup {
            setup_ref,
            client_secret,
        })
    }
}
