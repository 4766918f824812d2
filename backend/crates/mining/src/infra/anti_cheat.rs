//! Anti-cheat classifier clients

use std::net::IpAddr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::repository::{AntiCheatClassifier, AntiCheatVerdict};
use crate::domain::value_objects::UserId;
use crate::error::{MiningError, MiningResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest<'a> {
    user_id: &'a str,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyResponse {
    efficiency_multiplier: Decimal,
    #[serde(default)]
    penalty_level: u8,
}

/// Classifier reached over HTTP.
///
/// `POST {endpoint}` with `{"userId", "ip"}`; expects
/// `{"efficiencyMultiplier", "penaltyLevel"}`. Callers bound the call with
/// their own timeout.
#[derive(Debug, Clone)]
pub struct HttpAntiCheatClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAntiCheatClassifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

impl AntiCheatClassifier for HttpAntiCheatClassifier {
    async fn classify(&self, user_id: &UserId, ip: Option<IpAddr>) -> MiningResult<AntiCheatVerdict> {
        let request = ClassifyRequest {
            user_id: user_id.as_str(),
            ip: ip.map(|ip| ip.to_string()),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| MiningError::Internal(format!("anti-cheat request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(MiningError::Internal(format!(
                "anti-cheat returned status: {}",
                response.status()
            )));
        }

        let body: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| MiningError::Internal(format!("anti-cheat response invalid: {e}")))?;

        if body.penalty_level > 0 {
            tracing::info!(
                user_id = %user_id,
                penalty_level = body.penalty_level,
                efficiency = %body.efficiency_multiplier,
                "Anti-cheat penalty applied"
            );
        }

        Ok(AntiCheatVerdict::new(body.efficiency_multiplier, body.penalty_level))
    }
}

/// Classifier that never penalizes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPenaltyClassifier;

impl AntiCheatClassifier for NoPenaltyClassifier {
    async fn classify(&self, _user_id: &UserId, _ip: Option<IpAddr>) -> MiningResult<AntiCheatVerdict> {
        Ok(AntiCheatVerdict::CLEAN)
    }
}

/// Classifier chosen at startup from configuration
#[derive(Debug, Clone)]
pub enum ConfiguredAntiCheat {
    Http(HttpAntiCheatClassifier),
    Disabled(NoPenaltyClassifier),
}

impl ConfiguredAntiCheat {
    /// HTTP classifier if an endpoint is configured
    pub fn from_endpoint(endpoint: Option<String>) -> Self {
        match endpoint.filter(|url| !url.trim().is_empty()) {
            Some(url) => ConfiguredAntiCheat::Http(HttpAntiCheatClassifier::new(url)),
            None => ConfiguredAntiCheat::Disabled(NoPenaltyClassifier),
        }
    }
}

impl AntiCheatClassifier for ConfiguredAntiCheat {
    async fn classify(&self, user_id: &UserId, ip: Option<IpAddr>) -> MiningResult<AntiCheatVerdict> {
        match self {
            ConfiguredAntiCheat::Http(client) => client.classify(user_id, ip).await,
            ConfiguredAntiCheat::Disabled(client) => client.classify(user_id, ip).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_response_parsing() {
        let body: ClassifyResponse =
            serde_json::from_str(r#"{"efficiencyMultiplier": 0.25, "penaltyLevel": 3}"#).unwrap();
        let verdict = AntiCheatVerdict::new(body.efficiency_multiplier, body.penalty_level);
        assert_eq!(verdict.efficiency.value(), dec!(0.25));
        assert_eq!(verdict.penalty_level, 3);
    }

    #[test]
    fn test_from_endpoint() {
        assert!(matches!(
            ConfiguredAntiCheat::from_endpoint(None),
            ConfiguredAntiCheat::Disabled(_)
        ));
        assert!(matches!(
            ConfiguredAntiCheat::from_endpoint(Some("  ".to_string())),
            ConfiguredAntiCheat::Disabled(_)
        ));
        assert!(matches!(
            ConfiguredAntiCheat::from_endpoint(Some("http://localhost:9000/classify".to_string())),
            ConfiguredAntiCheat::Http(_)
        ));
    }

    #[tokio::test]
    async fn test_no_penalty() {
        let verdict = NoPenaltyClassifier
            .classify(&UserId::new("u1").unwrap(), None)
            .await
            .unwrap();
        assert_eq!(verdict, AntiCheatVerdict::CLEAN);
    }
}
