//! Классификация результатов отправки сообщений пользователям.

use serde::Serialize;
use teloxide::{ApiError, RequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Пользователь недостижим (заблокировал бота, удалён, чат не найден).
    Skipped,
    Failed,
}

/// Ошибки, после которых писать пользователю бессмысленно.
pub fn is_unreachable(error: &RequestError) -> bool {
    matches!(
        error,
        RequestError::Api(
            ApiError::BotBlocked
                | ApiError::ChatNotFound
                | ApiError::UserDeactivated
                | ApiError::BotKicked
                | ApiError::CantInitiateConversation
        )
    )
}

pub fn classify<T>(result: &Result<T, RequestError>) -> DeliveryOutcome {
    match result {
        Ok(_) => DeliveryOutcome::Sent,
        Err(error) if is_unreachable(error) => DeliveryOutcome::Skipped,
        Err(_) => DeliveryOutcome::Failed,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub total: i64,
    pub sent: i64,
    pub skipped: i64,
    pub failed: i64,
    /// Получатели, которым это уже отправлялось (только для опросов).
    pub already_sent: i64,
}

impl DeliveryReport {
    pub fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
            DeliveryOutcome::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_and_missing_chats_are_skips() {
        let blocked: Result<(), RequestError> = Err(RequestError::Api(ApiError::BotBlocked));
        let missing: Result<(), RequestError> = Err(RequestError::Api(ApiError::ChatNotFound));
        let gone: Result<(), RequestError> = Err(RequestError::Api(ApiError::UserDeactivated));
        assert_eq!(classify(&blocked), DeliveryOutcome::Skipped);
        assert_eq!(classify(&missing), DeliveryOutcome::Skipped);
        assert_eq!(classify(&gone), DeliveryOutcome::Skipped);
    }

    #[test]
    fn other_errors_are_failures() {
        let unknown: Result<(), RequestError> =
            Err(RequestError::Api(ApiError::Unknown("Bad Request: boom".to_string())));
        let not_modified: Result<(), RequestError> =
            Err(RequestError::Api(ApiError::MessageNotModified));
        assert_eq!(classify(&unknown), DeliveryOutcome::Failed);
        assert_eq!(classify(&not_modified), DeliveryOutcome::Failed);
        assert_eq!(classify(&Ok::<_, RequestError>(())), DeliveryOutcome::Sent);
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = DeliveryReport {
            total: 3,
            ..Default::default()
        };
        report.record(DeliveryOutcome::Sent);
        report.record(DeliveryOutcome::Skipped);
        report.record(DeliveryOutcome::Failed);
        assert_eq!((report.sent, report.skipped, report.failed), (1, 1, 1));
    }
}
