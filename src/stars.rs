//! Курс Telegram Stars в рублях.
//!
//! Курс вытаскивается эвристикой из JSON произвольной формы: ищем прямые поля
//! курса или пару «количество звёзд + цена» в одном объекте. Результат
//! кешируется; обновление сериализовано одним мьютексом, так что параллельные
//! вызовы не делают параллельных запросов.

use crate::config::StarsConfig;
use crate::db::current_unix_timestamp;
use crate::settings::{RuntimeSettings, STARS_RATE_RUB};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const MIN_RATE_RUB: f64 = 0.01;
pub const MAX_RATE_RUB: f64 = 50.0;
const MAX_NORMALIZATION_STEPS: u32 = 3;

const DIRECT_RATE_KEYS: &[&str] = &[
    "rate",
    "star_rate",
    "stars_rate",
    "rate_per_star",
    "price_per_star",
    "rub_per_star",
    "exchange_rate",
];
const STARS_COUNT_KEYS: &[&str] = &["stars", "star_count", "stars_count", "stars_amount"];
const PRICE_KEYS: &[&str] = &[
    "price",
    "cost",
    "total",
    "price_rub",
    "amount_rub",
    "total_price",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    Direct,
    Derived,
}

/// Число из JSON: number или строка вида `"1.79"` / `"1,79"`.
pub fn parse_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .replace(',', ".");
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    number.is_finite().then_some(number)
}

/// Курс выше верхней границы делится на 100 (не больше трёх раз);
/// всё, что не попало в `[MIN_RATE_RUB, MAX_RATE_RUB]`, отбрасывается.
pub fn normalize_rate(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let mut rate = raw;
    let mut steps = 0;
    while rate > MAX_RATE_RUB && steps < MAX_NORMALIZATION_STEPS {
        rate /= 100.0;
        steps += 1;
    }
    (MIN_RATE_RUB..=MAX_RATE_RUB).contains(&rate).then_some(rate)
}

fn first_number(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(parse_number))
}

fn collect_candidates(value: &Value, out: &mut Vec<(CandidateKind, f64)>) {
    match value {
        Value::Object(map) => {
            for key in DIRECT_RATE_KEYS {
                if let Some(rate) = map.get(*key).and_then(parse_number).and_then(normalize_rate) {
                    out.push((CandidateKind::Direct, rate));
                }
            }
            if let (Some(stars), Some(price)) =
                (first_number(map, STARS_COUNT_KEYS), first_number(map, PRICE_KEYS))
                && stars > 0.0
                && let Some(rate) = normalize_rate(price / stars)
            {
                out.push((CandidateKind::Derived, rate));
            }
            for nested in map.values() {
                collect_candidates(nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_candidates(item, out);
            }
        }
        _ => {}
    }
}

/// Лучший кандидат: прямое поле важнее вычисленного, дальше порядок в документе.
pub fn extract_rate(payload: &Value) -> Option<f64> {
    let mut candidates = Vec::new();
    collect_candidates(payload, &mut candidates);
    candidates
        .iter()
        .find(|(kind, _)| *kind == CandidateKind::Direct)
        .or_else(|| candidates.first())
        .map(|(_, rate)| *rate)
}

pub fn stars_to_kopeks(stars: u32, rate_rub: f64) -> i64 {
    (f64::from(stars) * rate_rub * 100.0).round() as i64
}

#[derive(Debug, Default)]
struct CacheState {
    rate: Option<f64>,
    fetched_at: Option<Instant>,
    fetched_at_unix: Option<i64>,
    last_attempt: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct RefreshPolicy {
    interval: Duration,
    retry_backoff: Duration,
}

impl RefreshPolicy {
    fn should_refresh(&self, state: &CacheState, now: Instant) -> bool {
        if state
            .fetched_at
            .is_some_and(|at| now.duration_since(at) < self.interval)
        {
            return false;
        }
        !state
            .last_attempt
            .is_some_and(|at| now.duration_since(at) < self.retry_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateSource {
    Setting,
    Scraped,
    Fallback,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateQuote {
    pub rate_rub: f64,
    pub source: RateSource,
    pub fetched_at: Option<i64>,
}

pub struct StarsRateService {
    client: reqwest::Client,
    rate_url: Option<String>,
    fallback_rate_rub: f64,
    policy: RefreshPolicy,
    settings: Arc<RuntimeSettings>,
    state: Mutex<CacheState>,
}

impl StarsRateService {
    pub fn new(config: &StarsConfig, settings: Arc<RuntimeSettings>) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("HTTP-клиент для курса звёзд: {}", e))?;
        Ok(Self {
            client,
            rate_url: config
                .rate_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            fallback_rate_rub: config.fallback_rate_rub,
            policy: RefreshPolicy {
                interval: Duration::from_secs(config.refresh_interval_secs),
                retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            },
            settings,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Текущий курс. Настройка `stars_rate_rub` перекрывает всё остальное.
    pub async fn current_rate(&self) -> RateQuote {
        if let Some(rate) = self.settings.get_float(STARS_RATE_RUB).await {
            return RateQuote {
                rate_rub: rate,
                source: RateSource::Setting,
                fetched_at: None,
            };
        }

        let mut state = self.state.lock().await;
        if let Some(url) = self.rate_url.as_deref() {
            let now = Instant::now();
            if self.policy.should_refresh(&state, now) {
                state.last_attempt = Some(now);
                match self.fetch_rate(url).await {
                    Ok(rate) => {
                        tracing::info!(rate_rub = rate, "Stars rate refreshed");
                        state.rate = Some(rate);
                        state.fetched_at = Some(now);
                        state.fetched_at_unix = current_unix_timestamp().ok();
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, url = %url, "Stars rate refresh failed");
                    }
                }
            }
        }

        match state.rate {
            Some(rate) => RateQuote {
                rate_rub: rate,
                source: RateSource::Scraped,
                fetched_at: state.fetched_at_unix,
            },
            None => RateQuote {
                rate_rub: self.fallback_rate_rub,
                source: RateSource::Fallback,
                fetched_at: None,
            },
        }
    }

    async fn fetch_rate(&self, url: &str) -> Result<f64, anyhow::Error> {
        let payload = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        extract_rate(&payload).ok_or_else(|| anyhow::anyhow!("в ответе не найден курс звезды"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Db;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn direct_rate_field() {
        assert_eq!(extract_rate(&json!({"rate": 1.79})), Some(1.79));
        assert_eq!(extract_rate(&json!({"data": {"rub_per_star": "1,85"}})), Some(1.85));
    }

    #[test]
    fn derived_from_stars_and_price() {
        let payload = json!({"packages": [{"stars": 100, "price": "179"}]});
        assert_eq!(extract_rate(&payload), Some(1.79));
    }

    #[test]
    fn direct_beats_derived_even_when_later() {
        let payload = json!({
            "packages": [{"stars": 50, "price": 100}],
            "meta": {"exchange_rate": 1.5}
        });
        assert_eq!(extract_rate(&payload), Some(1.5));
    }

    #[test]
    fn first_derived_candidate_in_document_order() {
        let payload = json!([
            {"star_count": 100, "total": 200},
            {"star_count": 100, "total": 300}
        ]);
        assert_eq!(extract_rate(&payload), Some(2.0));
    }

    #[test]
    fn kopeks_are_normalized_into_rubles() {
        // 179 коп. за звезду
        assert_eq!(extract_rate(&json!({"rate": 179})), Some(1.79));
        assert_eq!(normalize_rate(17_900.0), Some(1.79));
        assert_eq!(normalize_rate(1_790_000.0), Some(1.79));
        assert_eq!(normalize_rate(179_000_000.0), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(extract_rate(&json!({"rate": "abc"})), None);
        assert_eq!(extract_rate(&json!({"rate": -1})), None);
        assert_eq!(extract_rate(&json!({"rate": 0.001})), None);
        assert_eq!(extract_rate(&json!({"stars": 0, "price": 100})), None);
        assert_eq!(extract_rate(&json!("1.79")), None);
        assert_eq!(parse_number(&json!(" 2,5 ")), Some(2.5));
    }

    #[test]
    fn refresh_policy_respects_interval_and_backoff() {
        let policy = RefreshPolicy {
            interval: Duration::from_secs(900),
            retry_backoff: Duration::from_secs(60),
        };
        let start = Instant::now();
        let mut state = CacheState::default();
        assert!(policy.should_refresh(&state, start));

        state.last_attempt = Some(start);
        assert!(!policy.should_refresh(&state, start + Duration::from_secs(30)));
        assert!(policy.should_refresh(&state, start + Duration::from_secs(61)));

        state.fetched_at = Some(start);
        assert!(!policy.should_refresh(&state, start + Duration::from_secs(600)));
        assert!(policy.should_refresh(&state, start + Duration::from_secs(901)));
    }

    #[test]
    fn stars_conversion_rounds_to_kopeks() {
        assert_eq!(stars_to_kopeks(100, 1.79), 17_900);
        assert_eq!(stars_to_kopeks(3, 1.333), 400);
    }

    async fn service(config_raw: &str) -> StarsRateService {
        let config = Config::parse(config_raw).unwrap();
        let db = Arc::new(Db::open_in_memory().await.unwrap());
        let settings = Arc::new(RuntimeSettings::load(db, &config).await.unwrap());
        StarsRateService::new(&config.stars, settings).unwrap()
    }

    #[tokio::test]
    async fn fallback_without_url() {
        let service = service("[stars]\nfallback_rate_rub = 1.5\n").await;
        let quote = service.current_rate().await;
        assert_eq!(quote.source, RateSource::Fallback);
        assert_eq!(quote.rate_rub, 1.5);
    }

    async fn rate_stub(status: StatusCode, body: Value) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/rate",
            get(move || {
                let counter = counter.clone();
                let body = body.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, Json(body))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/rate", addr), hits)
    }

    fn scraping_config(url: &str) -> String {
        format!("[stars]\nrate_url = \"{}\"\nfallback_rate_rub = 1.5\n", url)
    }

    #[tokio::test]
    async fn scraped_rate_is_cached_between_calls() {
        let (url, hits) = rate_stub(StatusCode::OK, json!({"data": {"rate": "1,79"}})).await;
        let service = service(&scraping_config(&url)).await;

        let quote = service.current_rate().await;
        assert_eq!(quote.source, RateSource::Scraped);
        assert_eq!(quote.rate_rub, 1.79);
        assert!(quote.fetched_at.is_some());

        let again = service.current_rate().await;
        assert_eq!(again.rate_rub, 1.79);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_falls_back_and_waits_for_backoff() {
        let (url, hits) = rate_stub(StatusCode::INTERNAL_SERVER_ERROR, json!({})).await;
        let service = service(&scraping_config(&url)).await;

        let quote = service.current_rate().await;
        assert_eq!(quote.source, RateSource::Fallback);
        assert_eq!(quote.rate_rub, 1.5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let quote = service.current_rate().await;
        assert_eq!(quote.source, RateSource::Fallback);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let (url, hits) = rate_stub(StatusCode::OK, json!({"rate": 2.0})).await;
        let service = service(&scraping_config(&url)).await;

        let (a, b, c) = tokio::join!(
            service.current_rate(),
            service.current_rate(),
            service.current_rate()
        );
        for quote in [a, b, c] {
            assert_eq!(quote.source, RateSource::Scraped);
            assert_eq!(quote.rate_rub, 2.0);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn setting_overrides_everything() {
        let service = service("[settings]\nstars_rate_rub = 2.1\n").await;
        let quote = service.current_rate().await;
        assert_eq!(quote.source, RateSource::Setting);
        assert_eq!(quote.rate_rub, 2.1);
    }
}
