use crate::auth;
use crate::db;
use crate::db::alerts::AlertType;
use crate::db::webhook_deliveries::WebhookDelivery;
use crate::db::SqlitePool;
use crate::settings::Settings;
use anyhow::Context;
use anyhow::Result;
use tokio::task::spawn_blocking;

/// Deliveries claimed per batch.
const BATCH_SIZE: i64 = 20;
/// Backoff exponent cap; retries never wait longer than base * 2^10.
const MAX_BACKOFF_EXPONENT: u32 = 10;
/// Stored response bytes are capped so a chatty receiver cannot bloat rows.
const RESPONSE_SNIPPET_BYTES: usize = 500;

/// Outcome of resolving the merchant-side webhook configuration for one
/// delivery. Terminal reasons mark the delivery failed without retries and
/// without an alert; the merchant opted out or never finished setup.
enum Resolution {
    Send { url: String, secret: String },
    Terminal { reason: &'static str },
}

pub struct WebhookWorker {
    pool: SqlitePool,
    client: reqwest::Client,
    settings: Settings,
}

impl WebhookWorker {
    pub fn new(pool: SqlitePool, settings: Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.webhook_timeout())
            .build()
            .context("Failed to build webhook client")?;

        Ok(Self {
            pool,
            client,
            settings,
        })
    }

    /// Claim and process one batch of due deliveries. Per-delivery failures
    /// are recorded on the row and never abort the batch.
    pub async fn run_batch(&self, now: i64) -> Result<usize> {
        let due = {
            let pool = self.pool.clone();
            spawn_blocking(move || {
                let mut conn = pool.get()?;
                db::webhook_deliveries::list_due(&mut conn, now, BATCH_SIZE)
                    .context("Failed to list due deliveries")
            })
            .await
            .expect("task to complete")?
        };

        let claimed = due.len();
        for delivery in due {
            let delivery_id = delivery.id.clone();
            if let Err(e) = self.process(delivery, now).await {
                tracing::error!(
                    delivery_id = %delivery_id,
                    "Could not process webhook delivery: {e:#}"
                );
            }
        }

        Ok(claimed)
    }

    async fn process(&self, delivery: WebhookDelivery, now: i64) -> Result<()> {
        let resolution = {
            let pool = self.pool.clone();
            let merchant_id = delivery.merchant_id.clone();
            let environment = delivery.environment;
            spawn_blocking(move || -> Result<Resolution> {
                let mut conn = pool.get()?;

                let merchant = db::merchants::get(&mut conn, &merchant_id)?
                    .context("Merchant of queued delivery is gone")?;
                let config = merchant.webhook_config(environment);
                let url = match config.url {
                    Some(url) if config.enabled && !url.trim().is_empty() => url,
                    _ => {
                        return Ok(Resolution::Terminal {
                            reason: "WebhookDisabled",
                        })
                    }
                };
                if url::Url::parse(&url).is_err() {
                    return Ok(Resolution::Terminal {
                        reason: "InvalidUrl",
                    });
                }

                let secret = match db::credentials::get(&mut conn, &merchant_id, environment)? {
                    Some(credentials) => credentials.webhook_secret,
                    None => {
                        return Ok(Resolution::Terminal {
                            reason: "MissingCredentials",
                        })
                    }
                };

                Ok(Resolution::Send { url, secret })
            })
            .await
            .expect("task to complete")?
        };

        let (url, secret) = match resolution {
            Resolution::Send { url, secret } => (url, secret),
            Resolution::Terminal { reason } => {
                tracing::warn!(
                    delivery_id = %delivery.id,
                    merchant_id = %delivery.merchant_id,
                    reason,
                    "Dropping webhook delivery"
                );
                let pool = self.pool.clone();
                let delivery_id = delivery.id.clone();
                let attempt_count = delivery.attempt_count;
                return spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    db::webhook_deliveries::mark_failed(
                        &mut conn,
                        &delivery_id,
                        attempt_count,
                        None,
                        reason,
                        now,
                    )
                })
                .await
                .expect("task to complete");
            }
        };

        // Signature covers "<timestamp>.<payload>" with the env-scoped
        // webhook secret. The payload bytes were fixed at enqueue time.
        let message = format!("{now}.{}", delivery.payload);
        let signature = auth::sign(&secret, message.as_bytes());

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Event-Type", delivery.event_type.as_str())
            .header("X-Webhook-Timestamp", now.to_string())
            .header("X-Webhook-Signature", signature)
            .body(delivery.payload.clone())
            .send()
            .await;

        let attempt_count = delivery.attempt_count + 1;
        let pool = self.pool.clone();

        match response {
            Ok(response) if response.status().is_success() => {
                let http_status = i32::from(response.status().as_u16());
                let body = response.text().await.unwrap_or_default();
                let snippet = truncate_snippet(&body);

                tracing::debug!(
                    delivery_id = %delivery.id,
                    attempt_count,
                    "Webhook delivered"
                );

                let delivery_id = delivery.id.clone();
                spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    db::webhook_deliveries::mark_delivered(
                        &mut conn,
                        &delivery_id,
                        attempt_count,
                        http_status,
                        &snippet,
                        now,
                    )
                })
                .await
                .expect("task to complete")
            }
            Ok(response) => {
                let http_status = i32::from(response.status().as_u16());
                self.record_failure(
                    &delivery,
                    attempt_count,
                    Some(http_status),
                    format!("HTTP {http_status}"),
                    now,
                )
                .await
            }
            Err(e) => {
                self.record_failure(&delivery, attempt_count, None, format!("{e:#}"), now)
                    .await
            }
        }
    }

    /// Either schedule the next exponential-backoff attempt or, once the
    /// attempt budget is spent, fail the delivery terminally and raise an
    /// alert for the operator.
    async fn record_failure(
        &self,
        delivery: &WebhookDelivery,
        attempt_count: i32,
        http_status: Option<i32>,
        error: String,
        now: i64,
    ) -> Result<()> {
        let exhausted = attempt_count >= self.settings.webhook_max_attempts;
        let backoff_base = self.settings.webhook_backoff_base_secs;

        tracing::warn!(
            delivery_id = %delivery.id,
            attempt_count,
            exhausted,
            "Webhook attempt failed: {error}"
        );

        let pool = self.pool.clone();
        let delivery_id = delivery.id.clone();
        let merchant_id = delivery.merchant_id.clone();
        let event_type = delivery.event_type;

        spawn_blocking(move || {
            let mut conn = pool.get()?;

            if exhausted {
                db::webhook_deliveries::mark_failed(
                    &mut conn,
                    &delivery_id,
                    attempt_count,
                    http_status,
                    &error,
                    now,
                )?;
                db::alerts::insert(
                    &mut conn,
                    Some(&merchant_id),
                    AlertType::WebhookFailed,
                    &format!(
                        "Webhook for {event_type} failed after {attempt_count} attempts: {error}"
                    ),
                    now,
                )?;
            } else {
                let exponent = u32::try_from(attempt_count - 1)
                    .unwrap_or(0)
                    .min(MAX_BACKOFF_EXPONENT);
                let next_retry_at = now + backoff_base * i64::from(2u32.pow(exponent));
                db::webhook_deliveries::schedule_retry(
                    &mut conn,
                    &delivery_id,
                    attempt_count,
                    next_retry_at,
                    http_status,
                    &error,
                    now,
                )?;
            }

            anyhow::Ok(())
        })
        .await
        .expect("task to complete")
    }
}

fn truncate_snippet(body: &str) -> String {
    if body.len() <= RESPONSE_SNIPPET_BYTES {
        return body.to_string();
    }

    let mut end = RESPONSE_SNIPPET_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_is_capped_at_500_bytes() {
        let long = "x".repeat(2000);
        assert_eq!(truncate_snippet(&long).len(), 500);
        assert_eq!(truncate_snippet("short"), "short");
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let multibyte = "é".repeat(400);
        let snippet = truncate_snippet(&multibyte);
        assert!(snippet.len() <= 500);
        assert!(multibyte.starts_with(&snippet));
    }
}
