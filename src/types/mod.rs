//! Core data model: actors, ledger operations, job requests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform-specific id of a paying end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub i64);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat channel id used for delivery and admin alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single generation job. Ephemeral, never persisted past the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locales with user-facing message templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Ru,
    Es,
}

/// A paying end user. Created on first contact, never deleted; balance and level
/// are mutated only through ledger operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub balance: Decimal,
    pub level: u32,
    pub locale: Locale,
}

/// Level for a given lifetime income total. Monotone: levels only advance.
pub fn level_for_income(lifetime_income: Decimal) -> u32 {
    const THRESHOLDS: [(u32, Decimal); 4] = [
        (4, dec!(10000)),
        (3, dec!(2500)),
        (2, dec!(500)),
        (1, dec!(100)),
    ];
    for (level, threshold) in THRESHOLDS {
        if lifetime_income >= threshold {
            return level;
        }
    }
    0
}

/// Direction of a ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Income,
    Outcome,
}

/// Lifecycle of a ledger operation. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

/// Deterministic identifier preventing duplicate application of a balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for the single reservation debit of a job.
    pub fn for_reserve(job: JobId) -> Self {
        Self(format!("job:{job}:reserve"))
    }

    /// Key for the compensating refund of a job's reservation.
    pub fn for_refund(job: JobId) -> Self {
        Self(format!("job:{job}:refund"))
    }

    /// Key for an administrative mutation, coarse time bucket included so retried
    /// commands from another process still collapse at the ledger.
    pub fn for_admin(issuer: ActorId, target: ActorId, amount: Decimal, bucket: i64) -> Self {
        Self(format!("admin:{issuer}:{target}:{amount}:{bucket}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub key: IdempotencyKey,
    pub kind: OperationKind,
    pub amount: Decimal,
    pub status: OperationStatus,
    pub actor: ActorId,
    /// None for administrative operations.
    pub job: Option<JobId>,
    pub at: DateTime<Utc>,
    pub channel: Option<ChannelId>,
    pub reason: String,
}

/// The costed operation families this pipeline can meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    ImageGeneration,
    VideoGeneration,
    SpeechSynthesis,
    PromptExtraction,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageGeneration => "image_generation",
            Self::VideoGeneration => "video_generation",
            Self::SpeechSynthesis => "speech_synthesis",
            Self::PromptExtraction => "prompt_extraction",
        }
    }
}

impl std::fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical generation input. Deliberately narrow: the chat-transport context
/// stays outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalInput {
    pub model: String,
    pub prompt: String,
    /// Unit count for unit-scalable kinds (images per request). Minimum 1.
    pub units: u32,
    /// Requested duration for video, in seconds.
    pub duration_secs: Option<u32>,
    pub resolution: Option<String>,
    pub voice: Option<String>,
}

impl CanonicalInput {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            units: 1,
            duration_secs: None,
            resolution: None,
            voice: None,
        }
    }

    pub fn units(mut self, units: u32) -> Self {
        self.units = units;
        self
    }

    pub fn duration_secs(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

/// A metered generation request as handed over by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub actor: ActorId,
    pub locale: Locale,
    pub channel: ChannelId,
    pub kind: GenerationKind,
    pub input: CanonicalInput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds_monotone() {
        assert_eq!(level_for_income(dec!(0)), 0);
        assert_eq!(level_for_income(dec!(99.99)), 0);
        assert_eq!(level_for_income(dec!(100)), 1);
        assert_eq!(level_for_income(dec!(500)), 2);
        assert_eq!(level_for_income(dec!(2500)), 3);
        assert_eq!(level_for_income(dec!(1000000)), 4);
    }

    #[test]
    fn test_idempotency_keys_deterministic() {
        let job = JobId::new();
        assert_eq!(IdempotencyKey::for_reserve(job), IdempotencyKey::for_reserve(job));
        assert_ne!(IdempotencyKey::for_reserve(job), IdempotencyKey::for_refund(job));

        let a = IdempotencyKey::for_admin(ActorId(1), ActorId(2), dec!(1000), 42);
        let b = IdempotencyKey::for_admin(ActorId(1), ActorId(2), dec!(1000), 42);
        let c = IdempotencyKey::for_admin(ActorId(1), ActorId(2), dec!(1000), 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_canonical_input_builder() {
        let input = CanonicalInput::new("nova-image-2", "a quiet harbor at dawn")
            .units(4)
            .resolution("1024x1024");
        assert_eq!(input.units, 4);
        assert_eq!(input.resolution.as_deref(), Some("1024x1024"));
        assert!(input.voice.is_none());
    }
}
