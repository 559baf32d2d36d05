//! The balance-gated generation job state machine.
//!
//! VALIDATING -> PRICING -> RESERVING -> INVOKING -> STAGING -> PERSISTING ->
//! DELIVERING -> DONE, with FAILED reachable from any non-DONE state. Every
//! stage returns an explicit result matched here; failure handling is
//! exhaustive and cannot be bypassed.
//!
//! Money rules: exactly one debit per job, issued before the back-end call;
//! a back-end or staging failure always triggers a compensating credit; a
//! failed compensation is escalated, never dropped. Failures past persisting
//! never reverse the financial operation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span, warn};

use crate::artifact::{ArtifactRecord, ArtifactStage, ArtifactStore};
use crate::backend::BackendRegistry;
use crate::dedup::OperationDeduplicator;
use crate::ledger::BalanceLedger;
use crate::notify::{AdminNotifier, DeliveryChannel, DeliveryContent, NotificationCompensator};
use crate::pricing::{CostQuote, PriceTable};
use crate::types::{ActorId, ChannelId, GenerationKind, IdempotencyKey, JobId, JobRequest, Locale};
use crate::{Error, Result};

const RESERVE_REASON: &str = "generation reserve";
const REFUND_REASON: &str = "generation refund";
const TOPUP_REASON: &str = "administrative top-up";

/// Pipeline stages, in order. `Failed` is terminal alongside `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Pricing,
    Reserving,
    Invoking,
    Staging,
    Persisting,
    Delivering,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Pricing => "pricing",
            Self::Reserving => "reserving",
            Self::Invoking => "invoking",
            Self::Staging => "staging",
            Self::Persisting => "persisting",
            Self::Delivering => "delivering",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a completed job delivered and what it cost.
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    pub job: JobId,
    pub cost: Decimal,
    pub balance_after: Decimal,
    pub artifacts: Vec<PathBuf>,
    /// Durable record ids; may be shorter than `artifacts` if persisting
    /// failed and was left for reconciliation.
    pub persisted: Vec<String>,
    pub delivered: bool,
}

/// Outcome of one generation job.
#[derive(Debug)]
pub enum JobResult {
    Completed(ArtifactSummary),
    Failed {
        job: JobId,
        stage: Stage,
        error: Error,
        user_message: String,
    },
}

impl JobResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Outcome of an administrative credit command.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCreditOutcome {
    Applied { balance: Decimal, level: u32 },
    /// An identical command was already applied inside the suppression window.
    Suppressed,
}

/// Per-kind invocation timeouts and staging retention.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    timeouts: HashMap<GenerationKind, Duration>,
    pub default_timeout: Duration,
    pub staging_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut timeouts = HashMap::new();
        timeouts.insert(GenerationKind::ImageGeneration, Duration::from_secs(120));
        timeouts.insert(GenerationKind::VideoGeneration, Duration::from_secs(600));
        timeouts.insert(GenerationKind::SpeechSynthesis, Duration::from_secs(60));
        timeouts.insert(GenerationKind::PromptExtraction, Duration::from_secs(60));
        Self {
            timeouts,
            default_timeout: Duration::from_secs(120),
            staging_grace: Duration::from_secs(3600),
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout_for(&self, kind: GenerationKind) -> Duration {
        self.timeouts.get(&kind).copied().unwrap_or(self.default_timeout)
    }

    pub fn set_timeout(&mut self, kind: GenerationKind, timeout: Duration) {
        self.timeouts.insert(kind, timeout);
    }
}

/// Stateless-per-invocation orchestrator; many jobs run concurrently sharing
/// only the ledger and the deduplicator.
#[derive(Debug)]
pub struct Orchestrator {
    ledger: Arc<dyn BalanceLedger>,
    price_table: PriceTable,
    registry: BackendRegistry,
    staging: ArtifactStage,
    store: Arc<dyn ArtifactStore>,
    delivery: Arc<dyn DeliveryChannel>,
    admin: Arc<dyn AdminNotifier>,
    compensator: NotificationCompensator,
    dedup: OperationDeduplicator,
    http: reqwest::Client,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Run one metered generation job end to end.
    ///
    /// Once RESERVING succeeds the job runs through PERSISTING even if the
    /// requesting client is long gone; delivery is best-effort and a pending
    /// compensating refund is never skipped.
    pub async fn run_generation_job(&self, request: JobRequest) -> JobResult {
        let job = JobId::new();
        let span = info_span!(
            "generation_job",
            %job,
            actor = %request.actor,
            kind = %request.kind,
        );
        self.drive(job, &request).instrument(span).await
    }

    async fn drive(&self, job: JobId, request: &JobRequest) -> JobResult {
        // VALIDATING: the actor must resolve before anything is priced.
        if let Err(err) = self.ledger.balance(request.actor).await {
            let err = match err {
                crate::LedgerError::UnknownActor(actor) => Error::ActorNotFound(actor),
                other => other.into(),
            };
            return self.fail(job, Stage::Validating, request, None, err).await;
        }

        // PRICING: cost and adapter are both settled before money moves.
        let quote = match self.price_table.estimate(request.kind, &request.input) {
            Ok(quote) => quote,
            Err(err) => return self.fail(job, Stage::Pricing, request, None, err.into()).await,
        };
        let backend = match self.registry.resolve(request.kind) {
            Some(backend) => backend,
            None => {
                let err = Error::Config(format!("no back-end registered for {}", request.kind));
                return self.fail(job, Stage::Pricing, request, None, err).await;
            }
        };

        // RESERVING: the single debit of this job. The key is kept for the
        // compensation leg.
        let reserve_key = IdempotencyKey::for_reserve(job);
        let reserved = match self
            .ledger
            .debit(
                request.actor,
                quote.stars,
                RESERVE_REASON,
                Some(request.channel),
                &reserve_key,
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return self.fail(job, Stage::Reserving, request, None, err.into()).await;
            }
        };
        info!(cost = %quote.stars, balance = %reserved.balance, "funds reserved");

        // INVOKING: bounded by the per-kind timeout; a timeout is a failure.
        let timeout = self.config.timeout_for(request.kind);
        let refs = match backend.invoke(&self.http, &request.input, timeout).await {
            Ok(refs) => refs,
            Err(err) => {
                return self
                    .fail_refunding(job, Stage::Invoking, request, quote.stars, err.into())
                    .await;
            }
        };

        // STAGING: raw output lands in ephemeral local storage.
        let artifacts = match self.staging.stage(&self.http, job, request.kind, &refs).await {
            Ok(artifacts) => artifacts,
            Err(err) => {
                return self
                    .fail_refunding(job, Stage::Staging, request, quote.stars, err.into())
                    .await;
            }
        };

        // PERSISTING: non-fatal. The compute is consumed and the artifact
        // exists; a write failure goes to the admin channel for reconciliation.
        let mut persisted = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let record = ArtifactRecord {
                job,
                actor: request.actor,
                kind: request.kind,
                cost: quote.stars,
                source_url: artifact.source_url.clone(),
                local_path: artifact.local_path.clone(),
                created_at: Utc::now(),
            };
            match self.store.save(&record).await {
                Ok(id) => persisted.push(id),
                Err(err) => {
                    let err = Error::from(err);
                    error!(%err, "artifact record not persisted, delivering anyway");
                    let alert = self.compensator.admin_alert(
                        Some(job),
                        Stage::Persisting.as_str(),
                        request.actor,
                        Some(quote.stars),
                        &err,
                    );
                    self.compensator.escalate(self.admin.as_ref(), &alert).await;
                }
            }
        }

        // DELIVERING: best-effort; money is not reversed on failure.
        let content = DeliveryContent::text(self.summary_text(
            request.locale,
            &quote,
            reserved.balance,
        ))
        .with_attachments(artifacts.iter().map(|a| a.local_path.clone()).collect());
        let delivered = match self.delivery.send(request.actor, content).await {
            Ok(_) => true,
            Err(err) => {
                let err = Error::from(err);
                warn!(%err, "artifact delivery failed");
                let alert = self.compensator.admin_alert(
                    Some(job),
                    Stage::Delivering.as_str(),
                    request.actor,
                    Some(quote.stars),
                    &err,
                );
                self.compensator.escalate(self.admin.as_ref(), &alert).await;
                false
            }
        };

        info!(delivered, persisted = persisted.len(), "generation job done");
        JobResult::Completed(ArtifactSummary {
            job,
            cost: quote.stars,
            balance_after: reserved.balance,
            artifacts: artifacts.into_iter().map(|a| a.local_path).collect(),
            persisted,
            delivered,
        })
    }

    /// Administrative top-up, gated by the duplicate-suppression guard and a
    /// deterministic ledger idempotency key. The issuing channel is recorded
    /// on the resulting ledger operation.
    pub async fn apply_admin_credit(
        &self,
        issuer: ActorId,
        target: ActorId,
        amount: Decimal,
        channel: ChannelId,
    ) -> Result<AdminCreditOutcome> {
        if amount <= Decimal::ZERO {
            return Err(Error::Config("credit amount must be positive".to_string()));
        }
        let key = self.dedup.key(issuer, target, amount);
        if !self.dedup.should_proceed(&key) {
            info!(%issuer, %target, %amount, "duplicate administrative credit suppressed");
            return Ok(AdminCreditOutcome::Suppressed);
        }
        let ledger_key = IdempotencyKey::for_admin(issuer, target, amount, key.bucket);
        let snapshot = self
            .ledger
            .credit(target, amount, TOPUP_REASON, Some(channel), &ledger_key)
            .await?;
        info!(%issuer, %target, %amount, balance = %snapshot.balance, "administrative credit applied");
        Ok(AdminCreditOutcome::Applied {
            balance: snapshot.balance,
            level: snapshot.level,
        })
    }

    /// Delete staged artifacts older than the configured grace period.
    pub async fn sweep_staging(&self) -> Result<usize> {
        Ok(self.staging.sweep(self.config.staging_grace).await?)
    }

    async fn fail_refunding(
        &self,
        job: JobId,
        stage: Stage,
        request: &JobRequest,
        amount: Decimal,
        error: Error,
    ) -> JobResult {
        match self.compensate(job, request, amount).await {
            None => self.fail(job, stage, request, Some(amount), error).await,
            Some(compensation) => {
                // The underlying failure still gets its own admin alert; the
                // job then fails with the compensation error so the user is
                // not told their stars came back.
                let alert = self.compensator.admin_alert(
                    Some(job),
                    stage.as_str(),
                    request.actor,
                    Some(amount),
                    &error,
                );
                self.compensator.escalate(self.admin.as_ref(), &alert).await;
                self.fail(job, stage, request, Some(amount), compensation).await
            }
        }
    }

    /// Credit back the reserved amount. A failed compensation is the most
    /// severe failure class: the actor holds neither artifact nor refund, so
    /// it is returned for escalation, never swallowed.
    async fn compensate(&self, job: JobId, request: &JobRequest, amount: Decimal) -> Option<Error> {
        let key = IdempotencyKey::for_refund(job);
        match self
            .ledger
            .credit(
                request.actor,
                amount,
                REFUND_REASON,
                Some(request.channel),
                &key,
            )
            .await
        {
            Ok(snapshot) => {
                info!(refund = %amount, balance = %snapshot.balance, "compensating credit applied");
                None
            }
            Err(cause) => {
                let err = Error::CompensationFailed { job, amount, cause };
                error!(%err, "refund failed, queued for manual reconciliation");
                Some(err)
            }
        }
    }

    async fn fail(
        &self,
        job: JobId,
        stage: Stage,
        request: &JobRequest,
        amount: Option<Decimal>,
        error: Error,
    ) -> JobResult {
        warn!(%stage, err = %error, "generation job failed");

        let user_message = self.compensator.user_message(request.locale, &error);
        if let Err(send_err) = self
            .delivery
            .send(request.actor, DeliveryContent::text(user_message.clone()))
            .await
        {
            warn!(%send_err, "failure notice could not be delivered");
        }

        if error.is_admin_visible() {
            let alert =
                self.compensator
                    .admin_alert(Some(job), stage.as_str(), request.actor, amount, &error);
            self.compensator.escalate(self.admin.as_ref(), &alert).await;
        }

        JobResult::Failed {
            job,
            stage,
            error,
            user_message,
        }
    }

    fn summary_text(&self, locale: Locale, quote: &CostQuote, balance_after: Decimal) -> String {
        let cost = quote.display_stars();
        let balance = balance_after.round_dp(crate::pricing::DISPLAY_DECIMALS);
        let equivalents = quote
            .equivalents
            .iter()
            .map(|e| format!("{} {}", e.amount, e.code))
            .collect::<Vec<_>>()
            .join(", ");
        match locale {
            Locale::En => format!(
                "Done! Cost: {cost} stars ({equivalents}). Balance: {balance} stars."
            ),
            Locale::Ru => format!(
                "Готово! Стоимость: {cost} звёзд ({equivalents}). Баланс: {balance} звёзд."
            ),
            Locale::Es => format!(
                "¡Listo! Costo: {cost} estrellas ({equivalents}). Saldo: {balance} estrellas."
            ),
        }
    }
}

/// Builder for [`Orchestrator`]. Ledger, registry, staging, store, delivery,
/// and the admin channel are required.
#[derive(Debug, Default)]
pub struct OrchestratorBuilder {
    ledger: Option<Arc<dyn BalanceLedger>>,
    price_table: Option<PriceTable>,
    registry: Option<BackendRegistry>,
    staging: Option<ArtifactStage>,
    store: Option<Arc<dyn ArtifactStore>>,
    delivery: Option<Arc<dyn DeliveryChannel>>,
    admin: Option<(Arc<dyn AdminNotifier>, ChannelId)>,
    dedup: Option<OperationDeduplicator>,
    http: Option<reqwest::Client>,
    config: Option<OrchestratorConfig>,
}

impl OrchestratorBuilder {
    pub fn ledger(mut self, ledger: Arc<dyn BalanceLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn price_table(mut self, table: PriceTable) -> Self {
        self.price_table = Some(table);
        self
    }

    pub fn registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging = Some(ArtifactStage::new(dir));
        self
    }

    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn delivery(mut self, delivery: Arc<dyn DeliveryChannel>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn admin(mut self, notifier: Arc<dyn AdminNotifier>, channel: ChannelId) -> Self {
        self.admin = Some((notifier, channel));
        self
    }

    pub fn dedup(mut self, dedup: OperationDeduplicator) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let missing = |what: &str| Error::Config(format!("orchestrator requires {what}"));
        let (admin, admin_channel) = self.admin.ok_or_else(|| missing("an admin channel"))?;
        Ok(Orchestrator {
            ledger: self.ledger.ok_or_else(|| missing("a balance ledger"))?,
            price_table: self.price_table.unwrap_or_default(),
            registry: self.registry.ok_or_else(|| missing("a backend registry"))?,
            staging: self.staging.ok_or_else(|| missing("a staging directory"))?,
            store: self.store.ok_or_else(|| missing("an artifact store"))?,
            delivery: self.delivery.ok_or_else(|| missing("a delivery channel"))?,
            admin,
            compensator: NotificationCompensator::new(admin_channel),
            dedup: self.dedup.unwrap_or_default(),
            http: self.http.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_missing_collaborators() {
        let err = Orchestrator::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_timeouts_per_kind() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.timeout_for(GenerationKind::VideoGeneration),
            Duration::from_secs(600)
        );
        let mut config = config;
        config.set_timeout(GenerationKind::ImageGeneration, Duration::from_secs(5));
        assert_eq!(
            config.timeout_for(GenerationKind::ImageGeneration),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_stage_names_are_stable() {
        assert_eq!(Stage::Reserving.as_str(), "reserving");
        assert_eq!(Stage::Done.to_string(), "done");
    }
}
