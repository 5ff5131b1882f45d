use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditDirection {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

/// One mutation row of the principal's account history, as reported by the
/// upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct Credit {
    pub amount: i64,
    pub status: CreditDirection,
    #[serde(default)]
    pub note: Option<String>,
}

/// An inbound credit that settles an invoice must match the final amount
/// exactly; that is the whole point of the unique suffix.
pub fn find_matching_credit(credits: &[Credit], final_amount: i64) -> Option<&Credit> {
    credits
        .iter()
        .find(|credit| credit.status == CreditDirection::In && credit.amount == final_amount)
}

/// The only component aware of the upstream transport. Implementations must
/// be deterministic for a given response body.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    async fn fetch_credits(
        &self,
        principal: &str,
        token: &str,
    ) -> Result<Vec<Credit>, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct MutationsResponse {
    data: Vec<Credit>,
}

pub struct HttpUpstream {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUpstream {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstream {
    async fn fetch_credits(
        &self,
        principal: &str,
        token: &str,
    ) -> Result<Vec<Credit>, UpstreamError> {
        let response = self
            .client
            .get(format!("{}/api/mutations", self.endpoint))
            .query(&[("username", principal)])
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("{e:#}")))?;

        let response = response
            .error_for_status()
            .map_err(|e| UpstreamError::Unavailable(format!("{e:#}")))?;

        let mutations: MutationsResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Unavailable(format!("{e:#}")))?;

        Ok(mutations.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_the_mutation_list() {
        let body = r#"{"data":[
            {"amount":10001,"status":"IN","note":"transfer"},
            {"amount":5000,"status":"OUT"}
        ]}"#;

        let response: MutationsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[0].amount, 10001);
        assert_eq!(response.data[0].status, CreditDirection::In);
        assert_eq!(response.data[1].status, CreditDirection::Out);
    }

    #[test]
    fn matching_requires_exact_amount_and_inbound_direction() {
        let credits = vec![
            Credit {
                amount: 10001,
                status: CreditDirection::Out,
                note: None,
            },
            Credit {
                amount: 10002,
                status: CreditDirection::In,
                note: None,
            },
        ];

        assert!(find_matching_credit(&credits, 10001).is_none());
        assert!(find_matching_credit(&credits, 10002).is_some());
        assert!(find_matching_credit(&credits, 10000).is_none());
    }
}
