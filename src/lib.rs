//! # starmeter
//!
//! Balance-gated orchestration of metered generation jobs.
//!
//! A request is priced, reserved against the actor's star balance, sent to a
//! generation back-end, staged, persisted, and delivered. An actor is charged
//! exactly once per successfully delivered unit of work and never for work
//! that failed to materialize; failed work triggers a compensating refund.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use starmeter::{
//!     ArtifactStage, BackendRegistry, ImageBackend, JobRequest, MemoryLedger, Orchestrator,
//!     PriceTable,
//! };
//! use starmeter::types::{ActorId, CanonicalInput, ChannelId, GenerationKind, Locale};
//!
//! # async fn run(store: Arc<dyn starmeter::ArtifactStore>,
//! #              delivery: Arc<dyn starmeter::DeliveryChannel>,
//! #              admin: Arc<dyn starmeter::AdminNotifier>) -> starmeter::Result<()> {
//! let ledger = Arc::new(MemoryLedger::new());
//! let orchestrator = Orchestrator::builder()
//!     .ledger(ledger)
//!     .price_table(PriceTable::default())
//!     .registry(BackendRegistry::new().register(Arc::new(ImageBackend::new(
//!         "https://img.example/v1/images",
//!         "api-key",
//!     ))))
//!     .staging_dir("/tmp/starmeter")
//!     .store(store)
//!     .delivery(delivery)
//!     .admin(admin, ChannelId(-100))
//!     .build()?;
//!
//! let result = orchestrator
//!     .run_generation_job(JobRequest {
//!         actor: ActorId(42),
//!         locale: Locale::En,
//!         channel: ChannelId(42),
//!         kind: GenerationKind::ImageGeneration,
//!         input: CanonicalInput::new("nova-image-2", "a quiet harbor at dawn"),
//!     })
//!     .await;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

pub mod artifact;
pub mod backend;
pub mod dedup;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod pricing;
pub mod types;

// Re-exports for convenience
pub use artifact::{
    Artifact, ArtifactRecord, ArtifactRef, ArtifactStage, ArtifactStore, PersistenceError,
    StagingError,
};
pub use backend::{
    BackendError, BackendRegistry, GenerationBackend, ImageBackend, PromptBackend, SpeechBackend,
    VideoBackend,
};
pub use dedup::{Clock, DedupConfig, ManualClock, MutationKey, OperationDeduplicator, SystemClock};
pub use ledger::{BalanceLedger, BalanceSnapshot, LedgerError, MemoryLedger};
pub use notify::{
    AdminAlert, AdminNotifier, DeliveryChannel, DeliveryContent, DeliveryError,
    NotificationCompensator, Receipt,
};
pub use orchestrator::{
    AdminCreditOutcome, ArtifactSummary, JobResult, Orchestrator, OrchestratorBuilder,
    OrchestratorConfig, Stage,
};
pub use pricing::{CostQuote, CurrencyEquivalent, PriceTable, PriceTableBuilder, PricingError};
pub use types::{ActorId, CanonicalInput, ChannelId, GenerationKind, JobId, JobRequest, Locale};

use rust_decimal::Decimal;

/// Failure taxonomy of the metering pipeline.
///
/// Failures before money is reserved surface only to the user; failures at or
/// after reservation always produce an admin-visible audit entry as well.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Request actor does not resolve to a known identity.
    #[error("unknown actor {0}")]
    ActorNotFound(ActorId),

    /// Cost estimation rejected the request.
    #[error("pricing failed: {0}")]
    Pricing(#[from] PricingError),

    /// Reservation would drive the balance negative.
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },

    /// Ledger failure other than insufficient funds.
    #[error("ledger failure: {0}")]
    Ledger(LedgerError),

    /// Back-end invocation failed or timed out.
    #[error("back-end failure: {0}")]
    Backend(#[from] BackendError),

    /// Raw output could not be staged locally.
    #[error("staging failure: {0}")]
    Staging(#[from] StagingError),

    /// Durable artifact record could not be written. Non-fatal to the user.
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    /// Artifact or summary could not be delivered. Non-fatal to the money flow.
    #[error("delivery failure: {0}")]
    Delivery(#[from] DeliveryError),

    /// A compensating refund itself failed: the actor holds neither artifact
    /// nor refund. Always escalated for manual reconciliation.
    #[error("compensation failed for job {job}: {amount} stars not refunded: {cause}")]
    CompensationFailed {
        job: JobId,
        amount: Decimal,
        #[source]
        cause: LedgerError,
    },

    /// Invalid or missing orchestrator configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { balance, required } => {
                Error::InsufficientFunds { balance, required }
            }
            other => Error::Ledger(other),
        }
    }
}

impl Error {
    /// Short stable name used in admin alerts and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ActorNotFound(_) => "ActorNotFound",
            Error::Pricing(_) => "PricingError",
            Error::InsufficientFunds { .. } => "InsufficientFunds",
            Error::Ledger(_) => "LedgerError",
            Error::Backend(_) => "BackendError",
            Error::Staging(_) => "StagingError",
            Error::Persistence(_) => "PersistenceError",
            Error::Delivery(_) => "DeliveryError",
            Error::CompensationFailed { .. } => "CompensationFailed",
            Error::Config(_) => "ConfigError",
        }
    }

    /// Did this failure occur at or after the point where money moved?
    pub fn touches_money(&self) -> bool {
        matches!(
            self,
            Error::Backend(_)
                | Error::Staging(_)
                | Error::Persistence(_)
                | Error::Delivery(_)
                | Error::CompensationFailed { .. }
        )
    }

    /// Must an admin-visible audit entry be produced?
    pub fn is_admin_visible(&self) -> bool {
        self.touches_money()
    }

    /// Does this failure end the job from the user's point of view?
    /// Persistence and delivery failures do not: the artifact still exists.
    pub fn is_user_fatal(&self) -> bool {
        !matches!(self, Error::Persistence(_) | Error::Delivery(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
