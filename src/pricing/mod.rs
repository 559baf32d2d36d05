//! Cost estimation for metered generation operations.
//!
//! Pure and deterministic: operation parameters in, a star price plus secondary
//! display-currency equivalents out. Prices never default to zero; an unknown
//! kind or model is an explicit error.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use thiserror::Error;

use crate::types::{CanonicalInput, GenerationKind};

/// Decimal places shown to users. Internal math keeps full precision.
pub const DISPLAY_DECIMALS: u32 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("no price configured for operation kind '{0}'")]
    UnknownOperationKind(GenerationKind),

    #[error("no price configured for model '{model}' ({kind})")]
    UnknownModel { kind: GenerationKind, model: String },

    #[error("{kind} request is missing required parameter '{field}'")]
    MissingParameter {
        kind: GenerationKind,
        field: &'static str,
    },

    #[error("unit count must be at least 1")]
    InvalidUnitCount,
}

/// Informational price in a secondary display currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrencyEquivalent {
    pub code: String,
    pub amount: Decimal,
}

/// Estimated cost of one job: the star amount to reserve plus display equivalents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostQuote {
    pub stars: Decimal,
    pub equivalents: Vec<CurrencyEquivalent>,
}

impl CostQuote {
    /// Star amount rounded for display. Reservation always uses `stars` unrounded.
    pub fn display_stars(&self) -> Decimal {
        self.stars.round_dp(DISPLAY_DECIMALS)
    }
}

/// Per-unit star prices, keyed by kind with optional per-model overrides.
#[derive(Debug, Clone)]
pub struct PriceTable {
    kinds: HashMap<GenerationKind, Decimal>,
    models: HashMap<(GenerationKind, String), Decimal>,
    rates: Vec<(String, Decimal)>,
}

impl PriceTable {
    pub fn builder() -> PriceTableBuilder {
        PriceTableBuilder::new()
    }

    /// Price the job before anything is reserved. Multi-unit requests are
    /// N x per-unit, never derived from what the back-end actually produced.
    pub fn estimate(
        &self,
        kind: GenerationKind,
        input: &CanonicalInput,
    ) -> Result<CostQuote, PricingError> {
        let per_unit = self.per_unit(kind, &input.model)?;
        let units = self.unit_count(kind, input)?;
        let stars = per_unit * Decimal::from(units);

        let equivalents = self
            .rates
            .iter()
            .map(|(code, rate)| CurrencyEquivalent {
                code: code.clone(),
                amount: (stars * rate).round_dp(DISPLAY_DECIMALS),
            })
            .collect();

        Ok(CostQuote { stars, equivalents })
    }

    fn per_unit(&self, kind: GenerationKind, model: &str) -> Result<Decimal, PricingError> {
        let normalized = Self::normalize_model(model);
        if let Some(price) = self.models.get(&(kind, normalized)) {
            return Ok(*price);
        }
        self.kinds
            .get(&kind)
            .copied()
            .ok_or(PricingError::UnknownOperationKind(kind))
    }

    fn unit_count(&self, kind: GenerationKind, input: &CanonicalInput) -> Result<u32, PricingError> {
        match kind {
            GenerationKind::ImageGeneration => {
                if input.units == 0 {
                    return Err(PricingError::InvalidUnitCount);
                }
                Ok(input.units)
            }
            GenerationKind::VideoGeneration => {
                let secs = input.duration_secs.ok_or(PricingError::MissingParameter {
                    kind,
                    field: "duration_secs",
                })?;
                if secs == 0 {
                    return Err(PricingError::InvalidUnitCount);
                }
                Ok(secs)
            }
            GenerationKind::SpeechSynthesis | GenerationKind::PromptExtraction => Ok(1),
        }
    }

    fn normalize_model(model: &str) -> String {
        model.trim().to_lowercase()
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        PriceTableBuilder::new().with_defaults().build()
    }
}

#[derive(Debug, Default)]
pub struct PriceTableBuilder {
    kinds: HashMap<GenerationKind, Decimal>,
    models: HashMap<(GenerationKind, String), Decimal>,
    rates: Vec<(String, Decimal)>,
}

impl PriceTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stock prices: stars per image, per second of video, per speech request,
    /// per prompt extraction, plus USD/RUB display rates.
    pub fn with_defaults(mut self) -> Self {
        self.kinds.insert(GenerationKind::ImageGeneration, dec!(5));
        self.kinds.insert(GenerationKind::VideoGeneration, dec!(10));
        self.kinds.insert(GenerationKind::SpeechSynthesis, dec!(3));
        self.kinds.insert(GenerationKind::PromptExtraction, dec!(1));
        self.rates.push(("USD".into(), dec!(0.013)));
        self.rates.push(("RUB".into(), dec!(1.2)));
        self
    }

    pub fn kind(mut self, kind: GenerationKind, per_unit: Decimal) -> Self {
        self.kinds.insert(kind, per_unit);
        self
    }

    pub fn model(
        mut self,
        kind: GenerationKind,
        model: impl Into<String>,
        per_unit: Decimal,
    ) -> Self {
        self.models
            .insert((kind, PriceTable::normalize_model(&model.into())), per_unit);
        self
    }

    pub fn rate(mut self, code: impl Into<String>, per_star: Decimal) -> Self {
        self.rates.push((code.into(), per_star));
        self
    }

    pub fn build(self) -> PriceTable {
        PriceTable {
            kinds: self.kinds,
            models: self.models,
            rates: self.rates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriceTable {
        PriceTable::default()
    }

    #[test]
    fn test_image_cost_is_linear_in_units() {
        let table = table();
        let one = table
            .estimate(
                GenerationKind::ImageGeneration,
                &CanonicalInput::new("nova-image-2", "p"),
            )
            .unwrap();
        let four = table
            .estimate(
                GenerationKind::ImageGeneration,
                &CanonicalInput::new("nova-image-2", "p").units(4),
            )
            .unwrap();
        assert_eq!(four.stars, one.stars * dec!(4));
    }

    #[test]
    fn test_video_priced_per_second() {
        let table = table();
        let quote = table
            .estimate(
                GenerationKind::VideoGeneration,
                &CanonicalInput::new("nova-video-1", "p").duration_secs(8),
            )
            .unwrap();
        assert_eq!(quote.stars, dec!(80));
    }

    #[test]
    fn test_video_without_duration_is_rejected() {
        let err = table()
            .estimate(
                GenerationKind::VideoGeneration,
                &CanonicalInput::new("nova-video-1", "p"),
            )
            .unwrap_err();
        assert!(matches!(err, PricingError::MissingParameter { .. }));
    }

    #[test]
    fn test_unknown_kind_never_defaults_to_zero() {
        let table = PriceTableBuilder::new()
            .kind(GenerationKind::ImageGeneration, dec!(5))
            .build();
        let err = table
            .estimate(
                GenerationKind::SpeechSynthesis,
                &CanonicalInput::new("voice-x", "p"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            PricingError::UnknownOperationKind(GenerationKind::SpeechSynthesis)
        );
    }

    #[test]
    fn test_model_override_wins_over_kind_default() {
        let table = PriceTableBuilder::new()
            .with_defaults()
            .model(GenerationKind::ImageGeneration, "Nova-Image-Pro", dec!(12.5))
            .build();
        let quote = table
            .estimate(
                GenerationKind::ImageGeneration,
                &CanonicalInput::new("nova-image-pro", "p").units(2),
            )
            .unwrap();
        assert_eq!(quote.stars, dec!(25));
    }

    #[test]
    fn test_equivalents_rounded_for_display_only() {
        let quote = table()
            .estimate(
                GenerationKind::ImageGeneration,
                &CanonicalInput::new("nova-image-2", "p").units(3),
            )
            .unwrap();
        let usd = quote.equivalents.iter().find(|e| e.code == "USD").unwrap();
        assert_eq!(usd.amount, dec!(0.20));
        assert_eq!(quote.display_stars(), dec!(15));
    }

    #[test]
    fn test_zero_units_rejected() {
        let err = table()
            .estimate(
                GenerationKind::ImageGeneration,
                &CanonicalInput::new("nova-image-2", "p").units(0),
            )
            .unwrap_err();
        assert_eq!(err, PricingError::InvalidUnitCount);
    }
}
