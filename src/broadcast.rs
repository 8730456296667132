//! Рассылки по аудитории и закреп сообщений у пользователей.

use crate::db::{Audience, BroadcastRecord, BroadcastStatus, Db, PinnedMessage};
use crate::delivery::{classify, DeliveryOutcome, DeliveryReport};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{FileId, InputFile, Message};
use teloxide::RequestError;

#[derive(Clone)]
pub struct Broadcaster {
    db: Arc<Db>,
    bot: Bot,
}

impl Broadcaster {
    pub fn new(db: Arc<Db>, bot: Bot) -> Self {
        Self { db, bot }
    }

    /// Записывает рассылку в историю и запускает отправку в фоне.
    pub async fn queue(
        &self,
        audience: Audience,
        text: &str,
        created_by: Option<&str>,
    ) -> Result<BroadcastRecord, anyhow::Error> {
        let record = self
            .db
            .create_broadcast(audience.as_str(), text, created_by)
            .await?;
        let this = self.clone();
        let id = record.id;
        let text = text.to_string();
        tokio::spawn(async move {
            let mut report = DeliveryReport::default();
            let outcome = this.run(id, audience, &text, &mut report).await;
            if let Err(e) = this.conclude(id, &report, outcome).await {
                tracing::error!(broadcast_id = id, error = %e, "Failed to record broadcast result");
            }
        });
        Ok(record)
    }

    async fn run(
        &self,
        id: i64,
        audience: Audience,
        text: &str,
        report: &mut DeliveryReport,
    ) -> Result<(), anyhow::Error> {
        let members = self.db.list_audience(audience).await?;
        self.db
            .mark_broadcast_in_progress(id, members.len() as i64)
            .await?;
        report.total = members.len() as i64;

        for member in members {
            let result = self
                .bot
                .send_message(ChatId(member.telegram_id), text)
                .await;
            let outcome = classify(&result);
            report.record(outcome);
            match outcome {
                DeliveryOutcome::Sent => {}
                DeliveryOutcome::Skipped => self.db.mark_user_blocked(member.user_id).await?,
                DeliveryOutcome::Failed => {
                    if let Err(e) = result {
                        tracing::warn!(
                            broadcast_id = id,
                            telegram_id = member.telegram_id,
                            error = %e,
                            "Broadcast delivery failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Итог рассылки в историю. Прерванная рассылка сохраняет набранные счётчики.
    async fn conclude(
        &self,
        id: i64,
        report: &DeliveryReport,
        outcome: Result<(), anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        let status = match outcome {
            Ok(()) => {
                tracing::info!(
                    broadcast_id = id,
                    total = report.total,
                    sent = report.sent,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Broadcast finished"
                );
                BroadcastStatus::Completed
            }
            Err(e) => {
                tracing::error!(
                    broadcast_id = id,
                    sent = report.sent,
                    error = %e,
                    "Broadcast aborted"
                );
                BroadcastStatus::Failed
            }
        };
        self.db
            .finish_broadcast(id, status, report.sent, report.failed, report.skipped)
            .await
    }

    pub async fn send_pinned(
        &self,
        chat_id: ChatId,
        pinned: &PinnedMessage,
    ) -> Result<Message, RequestError> {
        let file_id = pinned
            .media_file_id
            .as_deref()
            .filter(|id| !id.trim().is_empty());
        match (pinned.media_type.as_deref(), file_id) {
            (Some("photo"), Some(id)) => {
                self.bot
                    .send_photo(chat_id, InputFile::file_id(FileId(id.to_string())))
                    .caption(pinned.content.clone())
                    .await
            }
            (Some("video"), Some(id)) => {
                self.bot
                    .send_video(chat_id, InputFile::file_id(FileId(id.to_string())))
                    .caption(pinned.content.clone())
                    .await
            }
            (Some("document"), Some(id)) => {
                self.bot
                    .send_document(chat_id, InputFile::file_id(FileId(id.to_string())))
                    .caption(pinned.content.clone())
                    .await
            }
            _ => self.bot.send_message(chat_id, pinned.content.clone()).await,
        }
    }

    /// Отправляет закреплённое сообщение всем активным пользователям и закрепляет его.
    pub async fn broadcast_pinned(&self, pinned: &PinnedMessage) -> Result<DeliveryReport, anyhow::Error> {
        let members = self.db.list_audience(Audience::All).await?;
        let mut report = DeliveryReport {
            total: members.len() as i64,
            ..Default::default()
        };

        for member in members {
            let chat_id = ChatId(member.telegram_id);
            let result = self.send_pinned(chat_id, pinned).await;
            let outcome = classify(&result);
            report.record(outcome);
            match result {
                Ok(message) => {
                    if let Err(e) = self
                        .bot
                        .pin_chat_message(chat_id, message.id)
                        .disable_notification(true)
                        .await
                    {
                        tracing::warn!(telegram_id = member.telegram_id, error = %e, "Failed to pin message");
                    }
                }
                Err(_) if outcome == DeliveryOutcome::Skipped => {
                    self.db.mark_user_blocked(member.user_id).await?;
                }
                Err(e) => {
                    tracing::warn!(
                        pinned_id = pinned.id,
                        telegram_id = member.telegram_id,
                        error = %e,
                        "Pinned message delivery failed"
                    );
                }
            }
        }

        tracing::info!(
            pinned_id = pinned.id,
            total = report.total,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            "Pinned message broadcast finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broadcaster() -> Broadcaster {
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        Broadcaster::new(db, Bot::new("123456:TEST"))
    }

    #[tokio::test]
    async fn aborted_broadcast_keeps_partial_counts() {
        let broadcaster = broadcaster().await;
        let record = broadcaster
            .db
            .create_broadcast("all", "Привет", None)
            .await
            .unwrap();
        let report = DeliveryReport {
            total: 10,
            sent: 4,
            skipped: 1,
            failed: 2,
            already_sent: 0,
        };

        broadcaster
            .conclude(record.id, &report, Err(anyhow::anyhow!("database is locked")))
            .await
            .unwrap();

        let stored = broadcaster.db.get_broadcast(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Failed.as_str());
        assert_eq!(
            (stored.sent_count, stored.skipped_count, stored.failed_count),
            (4, 1, 2)
        );
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn empty_audience_completes() {
        let broadcaster = broadcaster().await;
        let record = broadcaster
            .db
            .create_broadcast("all", "Привет", None)
            .await
            .unwrap();
        let mut report = DeliveryReport::default();
        let outcome = broadcaster
            .run(record.id, Audience::All, "Привет", &mut report)
            .await;
        broadcaster.conclude(record.id, &report, outcome).await.unwrap();

        let stored = broadcaster.db.get_broadcast(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Completed.as_str());
        assert_eq!(stored.total_count, 0);
    }
}
