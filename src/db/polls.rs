use super::transactions::apply_balance_change;
use super::{current_unix_timestamp, BalanceChange, BalanceError, Db, TransactionType};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use thiserror::Error;

const POLL_COLUMNS: &str =
    "id, title, description, reward_enabled, reward_amount_kopeks, created_by, created_at, updated_at";
const RESPONSE_COLUMNS: &str =
    "id, poll_id, user_id, sent_at, started_at, completed_at, reward_given, reward_amount_kopeks";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Poll {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub reward_enabled: bool,
    pub reward_amount_kopeks: i64,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Poll {
    /// Сумма награды, если она настроена.
    pub fn reward(&self) -> Option<i64> {
        (self.reward_enabled && self.reward_amount_kopeks > 0).then_some(self.reward_amount_kopeks)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PollQuestion {
    pub id: i64,
    pub poll_id: i64,
    pub text: String,
    pub order_index: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PollOption {
    pub id: i64,
    pub question_id: i64,
    pub text: String,
    pub order_index: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PollResponse {
    pub id: i64,
    pub poll_id: i64,
    pub user_id: i64,
    pub sent_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub reward_given: bool,
    pub reward_amount_kopeks: i64,
}

#[cfg(test)]
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PollAnswer {
    pub id: i64,
    pub response_id: i64,
    pub question_id: i64,
    pub option_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollQuestionDetail {
    #[serde(flatten)]
    pub question: PollQuestion,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollDetail {
    #[serde(flatten)]
    pub poll: Poll,
    pub questions: Vec<PollQuestionDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollSummary {
    #[serde(flatten)]
    pub poll: Poll,
    pub questions_count: i64,
    pub responses_count: i64,
    pub completed_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPollQuestion {
    pub text: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPoll {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reward_enabled: bool,
    #[serde(default)]
    pub reward_amount_kopeks: i64,
    pub questions: Vec<NewPollQuestion>,
}

impl NewPoll {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Название опроса не может быть пустым".to_string());
        }
        if self.questions.is_empty() {
            return Err("Нужен хотя бы один вопрос".to_string());
        }
        if self.reward_amount_kopeks < 0 {
            return Err("reward_amount_kopeks не может быть отрицательным".to_string());
        }
        if self.reward_enabled && self.reward_amount_kopeks == 0 {
            return Err("Награда включена, но сумма не задана".to_string());
        }
        for (idx, question) in self.questions.iter().enumerate() {
            if question.text.trim().is_empty() {
                return Err(format!("Вопрос #{}: пустой текст", idx + 1));
            }
            let options = question
                .options
                .iter()
                .filter(|opt| !opt.trim().is_empty())
                .count();
            if options < 2 {
                return Err(format!("Вопрос #{}: нужно минимум два варианта", idx + 1));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OptionStats {
    pub option_id: i64,
    pub text: String,
    pub answers: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionStats {
    pub question_id: i64,
    pub text: String,
    pub options: Vec<OptionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollStats {
    pub poll_id: i64,
    pub sent_count: i64,
    pub started_count: i64,
    pub completed_count: i64,
    pub rewards_paid_kopeks: i64,
    pub questions: Vec<QuestionStats>,
}

/// Итог завершения опроса.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCompletion {
    pub reward_kopeks: Option<i64>,
}

#[derive(Debug, Error)]
pub enum PollAnswerError {
    #[error("Ответ на опрос не найден")]
    ResponseNotFound,
    #[error("Опрос уже завершён")]
    AlreadyCompleted,
    #[error("Вопрос не относится к опросу")]
    QuestionMismatch,
    #[error("Вариант не относится к вопросу")]
    OptionMismatch,
    #[error("Ошибка БД: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BalanceError> for PollAnswerError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::Database(err) => PollAnswerError::Database(err),
            other => PollAnswerError::Other(anyhow::anyhow!(other)),
        }
    }
}

async fn fetch_response(
    conn: &mut SqliteConnection,
    response_id: i64,
) -> Result<Option<PollResponse>, sqlx::Error> {
    sqlx::query_as::<_, PollResponse>(&format!(
        "SELECT {} FROM poll_responses WHERE id = ?",
        RESPONSE_COLUMNS
    ))
    .bind(response_id)
    .fetch_optional(&mut *conn)
    .await
}

impl Db {
    pub async fn create_poll(
        &self,
        new: &NewPoll,
        created_by: Option<&str>,
    ) -> Result<PollDetail, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let poll_id = sqlx::query(
            "INSERT INTO polls (title, description, reward_enabled, reward_amount_kopeks, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.title.trim())
        .bind(new.description.as_deref())
        .bind(new.reward_enabled)
        .bind(new.reward_amount_kopeks)
        .bind(created_by)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (q_idx, question) in new.questions.iter().enumerate() {
            let question_id = sqlx::query(
                "INSERT INTO poll_questions (poll_id, text, order_index) VALUES (?, ?, ?)",
            )
            .bind(poll_id)
            .bind(question.text.trim())
            .bind(q_idx as i64)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            let options = question.options.iter().filter(|opt| !opt.trim().is_empty());
            for (o_idx, option) in options.enumerate() {
                sqlx::query("INSERT INTO poll_options (question_id, text, order_index) VALUES (?, ?, ?)")
                    .bind(question_id)
                    .bind(option.trim())
                    .bind(o_idx as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        self.get_poll_detail(poll_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("только что создали опрос"))
    }

    pub async fn get_poll(&self, id: i64) -> Result<Option<Poll>, anyhow::Error> {
        let row = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {} FROM polls WHERE id = ?",
            POLL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Вопросы в порядке показа, с вариантами.
    pub async fn list_poll_questions(
        &self,
        poll_id: i64,
    ) -> Result<Vec<PollQuestionDetail>, anyhow::Error> {
        let questions = sqlx::query_as::<_, PollQuestion>(
            "SELECT id, poll_id, text, order_index FROM poll_questions WHERE poll_id = ? ORDER BY order_index ASC, id ASC",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        let options = sqlx::query_as::<_, PollOption>(
            "SELECT o.id, o.question_id, o.text, o.order_index
             FROM poll_options o JOIN poll_questions q ON q.id = o.question_id
             WHERE q.poll_id = ?
             ORDER BY o.order_index ASC, o.id ASC",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(questions
            .into_iter()
            .map(|question| {
                let options = options
                    .iter()
                    .filter(|opt| opt.question_id == question.id)
                    .cloned()
                    .collect();
                PollQuestionDetail { question, options }
            })
            .collect())
    }

    pub async fn get_poll_detail(&self, id: i64) -> Result<Option<PollDetail>, anyhow::Error> {
        let Some(poll) = self.get_poll(id).await? else {
            return Ok(None);
        };
        let questions = self.list_poll_questions(id).await?;
        Ok(Some(PollDetail { poll, questions }))
    }

    pub async fn list_polls(&self, limit: i64, offset: i64) -> Result<Vec<PollSummary>, anyhow::Error> {
        let polls = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {} FROM polls ORDER BY id DESC LIMIT ? OFFSET ?",
            POLL_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(polls.len());
        for poll in polls {
            let (questions_count, responses_count, completed_count) =
                sqlx::query_as::<_, (i64, i64, i64)>(
                    "SELECT
                        (SELECT COUNT(*) FROM poll_questions WHERE poll_id = ?1),
                        (SELECT COUNT(*) FROM poll_responses WHERE poll_id = ?1),
                        (SELECT COUNT(*) FROM poll_responses WHERE poll_id = ?1 AND completed_at IS NOT NULL)",
                )
                .bind(poll.id)
                .fetch_one(&self.pool)
                .await?;
            summaries.push(PollSummary {
                poll,
                questions_count,
                responses_count,
                completed_count,
            });
        }
        Ok(summaries)
    }

    pub async fn count_polls(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM polls")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn delete_poll(&self, id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM polls WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Строка ответа для рассылки. `None`, если пользователю опрос уже отправлялся.
    pub async fn create_poll_response(
        &self,
        poll_id: i64,
        user_id: i64,
    ) -> Result<Option<PollResponse>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO poll_responses (poll_id, user_id, sent_at) VALUES (?, ?, ?)",
        )
        .bind(poll_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_poll_response(result.last_insert_rowid()).await
    }

    /// Убирает строку ответа, если сообщение с опросом так и не дошло.
    pub async fn delete_poll_response(&self, response_id: i64) -> Result<(), anyhow::Error> {
        sqlx::query("DELETE FROM poll_responses WHERE id = ? AND started_at IS NULL")
            .bind(response_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_poll_response(&self, id: i64) -> Result<Option<PollResponse>, anyhow::Error> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_response(&mut conn, id).await?)
    }

    /// Отмечает начало прохождения (только первый раз).
    pub async fn start_poll_response(
        &self,
        response_id: i64,
    ) -> Result<Option<PollResponse>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query("UPDATE poll_responses SET started_at = COALESCE(started_at, ?) WHERE id = ?")
            .bind(now)
            .bind(response_id)
            .execute(&self.pool)
            .await?;
        self.get_poll_response(response_id).await
    }

    pub async fn answered_question_ids(&self, response_id: i64) -> Result<Vec<i64>, anyhow::Error> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT question_id FROM poll_answers WHERE response_id = ?",
        )
        .bind(response_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    #[cfg(test)]
    pub async fn list_poll_answers(&self, response_id: i64) -> Result<Vec<PollAnswer>, anyhow::Error> {
        let rows = sqlx::query_as::<_, PollAnswer>(
            "SELECT id, response_id, question_id, option_id, created_at FROM poll_answers WHERE response_id = ? ORDER BY id",
        )
        .bind(response_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Записывает ответ; повторный ответ на тот же вопрос перезаписывает выбор.
    pub async fn record_poll_answer(
        &self,
        response_id: i64,
        question_id: i64,
        option_id: i64,
    ) -> Result<(), PollAnswerError> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let response = fetch_response(&mut tx, response_id)
            .await?
            .ok_or(PollAnswerError::ResponseNotFound)?;
        if response.completed_at.is_some() {
            return Err(PollAnswerError::AlreadyCompleted);
        }

        let question_poll = sqlx::query_scalar::<_, i64>("SELECT poll_id FROM poll_questions WHERE id = ?")
            .bind(question_id)
            .fetch_optional(&mut *tx)
            .await?;
        if question_poll != Some(response.poll_id) {
            return Err(PollAnswerError::QuestionMismatch);
        }

        let option_question = sqlx::query_scalar::<_, i64>("SELECT question_id FROM poll_options WHERE id = ?")
            .bind(option_id)
            .fetch_optional(&mut *tx)
            .await?;
        if option_question != Some(question_id) {
            return Err(PollAnswerError::OptionMismatch);
        }

        sqlx::query(
            "INSERT INTO poll_answers (response_id, question_id, option_id, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(response_id, question_id) DO UPDATE SET option_id = excluded.option_id, created_at = excluded.created_at",
        )
        .bind(response_id)
        .bind(question_id)
        .bind(option_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE poll_responses SET started_at = COALESCE(started_at, ?) WHERE id = ?")
            .bind(now)
            .bind(response_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Завершает прохождение. Награда начисляется ровно один раз: флаг
    /// `reward_given` захватывается условным UPDATE в той же транзакции,
    /// что и зачисление на баланс.
    pub async fn complete_poll_response(
        &self,
        response_id: i64,
    ) -> Result<PollCompletion, PollAnswerError> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let response = fetch_response(&mut tx, response_id)
            .await?
            .ok_or(PollAnswerError::ResponseNotFound)?;

        sqlx::query("UPDATE poll_responses SET completed_at = COALESCE(completed_at, ?) WHERE id = ?")
            .bind(now)
            .bind(response_id)
            .execute(&mut *tx)
            .await?;

        let poll = sqlx::query_as::<_, Poll>(&format!(
            "SELECT {} FROM polls WHERE id = ?",
            POLL_COLUMNS
        ))
        .bind(response.poll_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut reward_kopeks = None;
        if let Some(amount) = poll.reward() {
            let claimed = sqlx::query(
                "UPDATE poll_responses SET reward_given = 1, reward_amount_kopeks = ? WHERE id = ? AND reward_given = 0",
            )
            .bind(amount)
            .bind(response_id)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 1 {
                let description = format!("Награда за опрос «{}»", poll.title);
                let change = BalanceChange::new(response.user_id, amount, TransactionType::PollReward)
                    .description(&description);
                apply_balance_change(&mut tx, &change, now).await?;
                reward_kopeks = Some(amount);
            }
        }
        tx.commit().await?;

        if let Some(amount) = reward_kopeks {
            tracing::info!(
                poll_id = poll.id,
                user_id = response.user_id,
                reward_kopeks = amount,
                "Poll reward credited"
            );
        }
        Ok(PollCompletion { reward_kopeks })
    }

    pub async fn poll_stats(&self, poll_id: i64) -> Result<Option<PollStats>, anyhow::Error> {
        if self.get_poll(poll_id).await?.is_none() {
            return Ok(None);
        }
        let (sent_count, started_count, completed_count, rewards_paid_kopeks) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                "SELECT COUNT(*),
                        COUNT(started_at),
                        COUNT(completed_at),
                        COALESCE(SUM(CASE WHEN reward_given = 1 THEN reward_amount_kopeks ELSE 0 END), 0)
                 FROM poll_responses WHERE poll_id = ?",
            )
            .bind(poll_id)
            .fetch_one(&self.pool)
            .await?;

        let option_counts = sqlx::query_as::<_, (i64, i64, String, i64)>(
            "SELECT q.id, o.id, o.text, COUNT(a.id)
             FROM poll_questions q
             JOIN poll_options o ON o.question_id = q.id
             LEFT JOIN poll_answers a ON a.option_id = o.id
             WHERE q.poll_id = ?
             GROUP BY q.id, o.id
             ORDER BY q.order_index, q.id, o.order_index, o.id",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        let questions = self
            .list_poll_questions(poll_id)
            .await?
            .into_iter()
            .map(|detail| QuestionStats {
                question_id: detail.question.id,
                text: detail.question.text,
                options: option_counts
                    .iter()
                    .filter(|(question_id, ..)| *question_id == detail.question.id)
                    .map(|(_, option_id, text, answers)| OptionStats {
                        option_id: *option_id,
                        text: text.clone(),
                        answers: *answers,
                    })
                    .collect(),
            })
            .collect();

        Ok(Some(PollStats {
            poll_id,
            sent_count,
            started_count,
            completed_count,
            rewards_paid_kopeks,
            questions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewUser;

    fn new_poll(reward: i64) -> NewPoll {
        NewPoll {
            title: "Как вам сервис?".to_string(),
            description: None,
            reward_enabled: reward > 0,
            reward_amount_kopeks: reward,
            questions: vec![
                NewPollQuestion {
                    text: "Скорость".to_string(),
                    options: vec!["Хорошо".to_string(), "Плохо".to_string()],
                },
                NewPollQuestion {
                    text: "Порекомендуете?".to_string(),
                    options: vec!["Да".to_string(), "Нет".to_string(), " ".to_string()],
                },
            ],
        }
    }

    async fn setup(reward: i64) -> (Db, PollDetail, i64) {
        let db = Db::open_in_memory().await.unwrap();
        let (user, _) = db
            .get_or_create_user(&NewUser {
                telegram_id: 42,
                ..Default::default()
            })
            .await
            .unwrap();
        let poll = db.create_poll(&new_poll(reward), Some("admin")).await.unwrap();
        (db, poll, user.id)
    }

    #[tokio::test]
    async fn create_poll_keeps_question_order_and_skips_blank_options() {
        let (_db, poll, _) = setup(0).await;
        assert_eq!(poll.questions.len(), 2);
        assert_eq!(poll.questions[0].question.text, "Скорость");
        assert_eq!(poll.questions[1].options.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_response_is_a_noop() {
        let (db, poll, user_id) = setup(0).await;
        assert!(db.create_poll_response(poll.poll.id, user_id).await.unwrap().is_some());
        assert!(db.create_poll_response(poll.poll.id, user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn answer_overwrites_previous_choice() {
        let (db, poll, user_id) = setup(0).await;
        let response = db.create_poll_response(poll.poll.id, user_id).await.unwrap().unwrap();
        let question = &poll.questions[0];

        db.record_poll_answer(response.id, question.question.id, question.options[0].id)
            .await
            .unwrap();
        db.record_poll_answer(response.id, question.question.id, question.options[1].id)
            .await
            .unwrap();

        let answers = db.list_poll_answers(response.id).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].option_id, question.options[1].id);
    }

    #[tokio::test]
    async fn option_from_other_question_is_rejected() {
        let (db, poll, user_id) = setup(0).await;
        let response = db.create_poll_response(poll.poll.id, user_id).await.unwrap().unwrap();
        let err = db
            .record_poll_answer(
                response.id,
                poll.questions[0].question.id,
                poll.questions[1].options[0].id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PollAnswerError::OptionMismatch));
    }

    #[tokio::test]
    async fn reward_is_paid_exactly_once() {
        let (db, poll, user_id) = setup(1_500).await;
        let response = db.create_poll_response(poll.poll.id, user_id).await.unwrap().unwrap();

        let first = db.complete_poll_response(response.id).await.unwrap();
        let second = db.complete_poll_response(response.id).await.unwrap();
        assert_eq!(first.reward_kopeks, Some(1_500));
        assert_eq!(second.reward_kopeks, None);
        assert_eq!(db.get_user(user_id).await.unwrap().unwrap().balance_kopeks, 1_500);

        let stats = db.poll_stats(poll.poll.id).await.unwrap().unwrap();
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.rewards_paid_kopeks, 1_500);

        let err = db
            .record_poll_answer(
                response.id,
                poll.questions[0].question.id,
                poll.questions[0].options[0].id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PollAnswerError::AlreadyCompleted));
    }

    #[tokio::test]
    async fn stats_count_answers_per_option() {
        let (db, poll, user_id) = setup(0).await;
        let response = db.create_poll_response(poll.poll.id, user_id).await.unwrap().unwrap();
        let question = &poll.questions[0];
        db.record_poll_answer(response.id, question.question.id, question.options[0].id)
            .await
            .unwrap();

        let stats = db.poll_stats(poll.poll.id).await.unwrap().unwrap();
        assert_eq!(stats.sent_count, 1);
        assert_eq!(stats.started_count, 1);
        assert_eq!(stats.questions[0].options[0].answers, 1);
        assert_eq!(stats.questions[0].options[1].answers, 0);
        assert!(db.poll_stats(999).await.unwrap().is_none());
    }

    #[test]
    fn validation_requires_two_options() {
        let mut poll = new_poll(0);
        assert!(poll.validate().is_ok());
        poll.questions[0].options.truncate(1);
        assert!(poll.validate().is_err());
        poll.questions.clear();
        assert!(poll.validate().is_err());
    }
}
