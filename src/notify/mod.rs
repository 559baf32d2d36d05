//! Failure-to-notification mapping and the outbound channel contracts.
//!
//! Users get a localized, generic message that never carries raw back-end
//! diagnostics. Admins get the full structured payload. Admin notification is
//! best-effort: a failed alert is logged, never propagated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::pricing::DISPLAY_DECIMALS;
use crate::types::{ActorId, ChannelId, JobId, Locale};

#[derive(Debug, Error)]
#[error("delivery failure: {0}")]
pub struct DeliveryError(pub String);

/// Receipt returned by the delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub message_id: Option<String>,
}

/// Outbound content: a text summary plus any staged files to attach.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContent {
    pub text: String,
    pub attachments: Vec<PathBuf>,
}

impl DeliveryContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Sends artifacts and summaries to an actor. Consumed, not implemented here.
#[async_trait]
pub trait DeliveryChannel: Send + Sync + std::fmt::Debug {
    async fn send(&self, actor: ActorId, content: DeliveryContent)
        -> Result<Receipt, DeliveryError>;
}

/// Structured diagnostic payload for the admin channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminAlert {
    pub job: Option<JobId>,
    pub stage: String,
    pub actor: ActorId,
    pub amount: Option<Decimal>,
    pub error_kind: String,
    pub raw_error: String,
    /// Error source chain, outermost first.
    pub context: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Posts alerts to the admin channel. Consumed, not implemented here.
#[async_trait]
pub trait AdminNotifier: Send + Sync + std::fmt::Debug {
    async fn notify(&self, channel: ChannelId, alert: &AdminAlert) -> Result<(), DeliveryError>;
}

/// Maps internal failures to user-safe messages and admin-grade diagnostics.
#[derive(Debug, Clone)]
pub struct NotificationCompensator {
    admin_channel: ChannelId,
}

impl NotificationCompensator {
    pub fn new(admin_channel: ChannelId) -> Self {
        Self { admin_channel }
    }

    pub fn admin_channel(&self) -> ChannelId {
        self.admin_channel
    }

    /// Localized, generic user-facing text. Raw diagnostics never leak here.
    pub fn user_message(&self, locale: Locale, error: &crate::Error) -> String {
        use crate::Error;
        match error {
            Error::ActorNotFound(_) => match locale {
                Locale::En => "We don't know you yet. Please start the bot first.".to_string(),
                Locale::Ru => "Мы вас ещё не знаем. Сначала запустите бота.".to_string(),
                Locale::Es => "Aún no te conocemos. Inicia el bot primero.".to_string(),
            },
            Error::Pricing(_) => match locale {
                Locale::En => "This operation is not available right now.".to_string(),
                Locale::Ru => "Эта операция сейчас недоступна.".to_string(),
                Locale::Es => "Esta operación no está disponible ahora.".to_string(),
            },
            Error::InsufficientFunds { balance, required } => {
                let balance = balance.round_dp(DISPLAY_DECIMALS);
                let required = required.round_dp(DISPLAY_DECIMALS);
                match locale {
                    Locale::En => format!(
                        "Not enough stars: you have {balance}, this needs {required}."
                    ),
                    Locale::Ru => format!(
                        "Недостаточно звёзд: у вас {balance}, нужно {required}."
                    ),
                    Locale::Es => format!(
                        "Estrellas insuficientes: tienes {balance}, se necesitan {required}."
                    ),
                }
            }
            Error::Backend(_) | Error::Staging(_) => match locale {
                Locale::En => "Generation failed, your stars have been returned.".to_string(),
                Locale::Ru => "Генерация не удалась, звёзды возвращены.".to_string(),
                Locale::Es => "La generación falló, tus estrellas fueron devueltas.".to_string(),
            },
            // The refund itself failed: never promise returned stars here.
            Error::CompensationFailed { .. } => match locale {
                Locale::En => {
                    "Generation failed. The refund did not go through automatically; \
                     we are reviewing your balance."
                        .to_string()
                }
                Locale::Ru => {
                    "Генерация не удалась. Автоматический возврат не прошёл, \
                     мы проверяем ваш баланс."
                        .to_string()
                }
                Locale::Es => {
                    "La generación falló. El reembolso automático no se completó; \
                     estamos revisando tu saldo."
                        .to_string()
                }
            },
            _ => match locale {
                Locale::En => "Something went wrong. You were not charged.".to_string(),
                Locale::Ru => "Что-то пошло не так. Средства не списаны.".to_string(),
                Locale::Es => "Algo salió mal. No se te cobró.".to_string(),
            },
        }
    }

    /// Full diagnostic payload for the admin channel.
    pub fn admin_alert(
        &self,
        job: Option<JobId>,
        stage: &'static str,
        actor: ActorId,
        amount: Option<Decimal>,
        error: &crate::Error,
    ) -> AdminAlert {
        let mut context = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            context.push(cause.to_string());
            source = cause.source();
        }
        AdminAlert {
            job,
            stage: stage.to_string(),
            actor,
            amount,
            error_kind: error.kind().to_string(),
            raw_error: error.to_string(),
            context,
            at: Utc::now(),
        }
    }

    /// Post the alert; log and swallow any failure.
    pub async fn escalate(&self, notifier: &dyn AdminNotifier, alert: &AdminAlert) {
        if let Err(err) = notifier.notify(self.admin_channel, alert).await {
            warn!(
                channel = %self.admin_channel,
                error_kind = %alert.error_kind,
                %err,
                "admin alert could not be posted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn compensator() -> NotificationCompensator {
        NotificationCompensator::new(ChannelId(-1001))
    }

    #[test]
    fn test_user_message_never_leaks_raw_error() {
        let error = crate::Error::Backend(BackendError::Api {
            status: 500,
            message: "upstream exploded: secret-token-abc".to_string(),
        });
        for locale in [Locale::En, Locale::Ru, Locale::Es] {
            let message = compensator().user_message(locale, &error);
            assert!(!message.contains("secret-token-abc"));
            assert!(!message.contains("500"));
        }
    }

    #[test]
    fn test_insufficient_funds_message_carries_rounded_amounts() {
        let error = crate::Error::InsufficientFunds {
            balance: dec!(10.333),
            required: dec!(30),
        };
        let message = compensator().user_message(Locale::En, &error);
        assert!(message.contains("10.33"));
        assert!(message.contains("30"));
    }

    #[test]
    fn test_failed_refund_message_does_not_promise_returned_stars() {
        use crate::ledger::LedgerError;

        let refunded = crate::Error::Backend(BackendError::Timeout(Duration::from_secs(90)));
        assert!(
            compensator()
                .user_message(Locale::En, &refunded)
                .contains("returned")
        );

        let stuck = crate::Error::CompensationFailed {
            job: JobId::new(),
            amount: dec!(30),
            cause: LedgerError::Unavailable("credit path down".to_string()),
        };
        for locale in [Locale::En, Locale::Ru, Locale::Es] {
            let message = compensator().user_message(locale, &stuck);
            assert!(!message.contains("returned"));
            assert!(!message.contains("возвращены"));
            assert!(!message.contains("devueltas"));
        }
        assert!(
            compensator()
                .user_message(Locale::En, &stuck)
                .contains("reviewing your balance")
        );
    }

    #[test]
    fn test_admin_alert_carries_full_diagnostics() {
        let job = JobId::new();
        let error = crate::Error::Backend(BackendError::Timeout(Duration::from_secs(90)));
        let alert = compensator().admin_alert(
            Some(job),
            "invoking",
            ActorId(42),
            Some(dec!(30)),
            &error,
        );
        assert_eq!(alert.error_kind, "BackendError");
        assert_eq!(alert.stage, "invoking");
        assert_eq!(alert.amount, Some(dec!(30)));
        assert!(alert.raw_error.contains("90"));
        assert_eq!(alert.context.len(), 1, "source chain captured");
    }

    #[test]
    fn test_alert_serializes_to_json() {
        let error = crate::Error::ActorNotFound(ActorId(7));
        let alert = compensator().admin_alert(None, "validating", ActorId(7), None, &error);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["stage"], "validating");
        assert_eq!(json["error_kind"], "ActorNotFound");
    }
}
