//! Прохождение опросов: рассылка, показ следующего вопроса, завершение с наградой.

use crate::bot::format::render_poll_intro;
use crate::bot::keyboards::poll_start_button;
use crate::db::{
    Audience, Db, PollAnswerError, PollCompletion, PollDetail, PollQuestionDetail, PollResponse,
};
use crate::delivery::{classify, DeliveryOutcome, DeliveryReport};
use std::sync::Arc;
use teloxide::prelude::*;

/// Первый неотвеченный вопрос: по `order_index`, при равенстве по id.
pub fn next_question<'a>(
    questions: &'a [PollQuestionDetail],
    answered: &[i64],
) -> Option<&'a PollQuestionDetail> {
    questions
        .iter()
        .filter(|q| !answered.contains(&q.question.id))
        .min_by_key(|q| (q.question.order_index, q.question.id))
}

/// Недоставленное приглашение не считается отправленным: запись ответа
/// удаляется, недостижимый пользователь помечается `blocked`.
async fn settle_delivery(
    db: &Db,
    response: &PollResponse,
    outcome: DeliveryOutcome,
) -> Result<(), anyhow::Error> {
    match outcome {
        DeliveryOutcome::Sent => {}
        DeliveryOutcome::Skipped => {
            db.delete_poll_response(response.id).await?;
            db.mark_user_blocked(response.user_id).await?;
        }
        DeliveryOutcome::Failed => {
            db.delete_poll_response(response.id).await?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub enum PollStep {
    Question {
        question: PollQuestionDetail,
        position: usize,
        total: usize,
    },
    Completed(PollCompletion),
}

#[derive(Clone)]
pub struct PollService {
    db: Arc<Db>,
    bot: Bot,
}

impl PollService {
    pub fn new(db: Arc<Db>, bot: Bot) -> Self {
        Self { db, bot }
    }

    /// Рассылает приглашение пройти опрос. Тем, кому опрос уже отправлялся,
    /// повторно ничего не уходит.
    pub async fn distribute(
        &self,
        poll: &PollDetail,
        audience: Audience,
    ) -> Result<DeliveryReport, anyhow::Error> {
        let members = self.db.list_audience(audience).await?;
        let text = render_poll_intro(&poll.poll);
        let mut report = DeliveryReport {
            total: members.len() as i64,
            ..Default::default()
        };

        for member in members {
            let Some(response) = self.db.create_poll_response(poll.poll.id, member.user_id).await?
            else {
                report.already_sent += 1;
                continue;
            };

            let result = self
                .bot
                .send_message(ChatId(member.telegram_id), text.clone())
                .reply_markup(poll_start_button(response.id))
                .await;
            let outcome = classify(&result);
            report.record(outcome);
            if let Err(error) = &result
                && outcome == DeliveryOutcome::Failed
            {
                tracing::warn!(
                    poll_id = poll.poll.id,
                    telegram_id = member.telegram_id,
                    error = %error,
                    "Poll delivery failed"
                );
            }
            settle_delivery(&self.db, &response, outcome).await?;
        }

        tracing::info!(
            poll_id = poll.poll.id,
            audience = audience.as_str(),
            total = report.total,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed,
            already_sent = report.already_sent,
            "Poll distribution finished"
        );
        Ok(report)
    }

    async fn advance(&self, response: &PollResponse) -> Result<PollStep, PollAnswerError> {
        let questions = self.db.list_poll_questions(response.poll_id).await?;
        let answered = self.db.answered_question_ids(response.id).await?;
        match next_question(&questions, &answered) {
            Some(question) => Ok(PollStep::Question {
                question: question.clone(),
                position: answered.len() + 1,
                total: questions.len(),
            }),
            None => {
                let completion = self.db.complete_poll_response(response.id).await?;
                Ok(PollStep::Completed(completion))
            }
        }
    }

    pub async fn response(&self, response_id: i64) -> Result<PollResponse, PollAnswerError> {
        self.db
            .get_poll_response(response_id)
            .await?
            .ok_or(PollAnswerError::ResponseNotFound)
    }

    /// Начало прохождения: первый неотвеченный вопрос.
    pub async fn start(&self, response_id: i64) -> Result<PollStep, PollAnswerError> {
        let response = self
            .db
            .start_poll_response(response_id)
            .await?
            .ok_or(PollAnswerError::ResponseNotFound)?;
        if response.completed_at.is_some() {
            return Err(PollAnswerError::AlreadyCompleted);
        }
        self.advance(&response).await
    }

    /// Записывает ответ и возвращает следующий шаг.
    pub async fn answer(
        &self,
        response_id: i64,
        question_id: i64,
        option_id: i64,
    ) -> Result<PollStep, PollAnswerError> {
        self.db
            .record_poll_answer(response_id, question_id, option_id)
            .await?;
        let response = self.response(response_id).await?;
        self.advance(&response).await
    }
}
