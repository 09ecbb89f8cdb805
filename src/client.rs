use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::models::{
    Factor, PredictionMethod, PredictionRecord, Probabilities, RiskLevel, StudentRecord,
};
use crate::risk;

/// Result of probing `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    success: bool,
    prediction: Option<RemotePrediction>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePrediction {
    risk_level: RiskLevel,
    probabilities: Probabilities,
    confidence: f64,
    #[serde(default)]
    factors: Option<Vec<Factor>>,
    #[serde(default)]
    recommendations: Option<Vec<String>>,
    #[serde(default)]
    english_average: Option<f64>,
    #[serde(default)]
    model_version: Option<String>,
}

/// HTTP client for the remote prediction service.
#[derive(Debug, Clone)]
pub struct PredictionClient {
    http: reqwest::Client,
    base_url: String,
}

impl PredictionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Never fails: transport and status problems are reported in the result.
    pub async fn health(&self) -> ConnectionStatus {
        let url = format!("{}/health", self.base_url);
        debug!(%url, "testing connection");

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, error = %err, "connection failed");
                return self.status(false, None, Some(err.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(%url, %status, "backend returned error status");
            return self.status(false, None, Some(format!("HTTP {}", status.as_u16())));
        }

        let data = response.json::<serde_json::Value>().await.ok();
        info!(%url, "backend connected");
        self.status(true, data, None)
    }

    pub async fn predict(&self, student: &StudentRecord) -> Result<PredictionRecord, ClientError> {
        let url = format!("{}/predict", self.base_url);
        debug!(%url, student_id = %student.id, "sending prediction request");

        let response = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(student)
            .send()
            .await
            .map_err(ClientError::Transport)?;

        if !response.status().is_success() {
            return Err(ClientError::Status(response.status()));
        }

        let body: PredictResponse = response.json().await.map_err(ClientError::Decode)?;
        let remote = match (body.success, body.prediction) {
            (true, Some(prediction)) => prediction,
            (_, _) => {
                return Err(ClientError::Rejected(
                    body.error.unwrap_or_else(|| "Prediction failed".to_string()),
                ))
            }
        };

        Ok(PredictionRecord {
            student_id: student.id.clone(),
            risk_level: remote.risk_level,
            probabilities: remote.probabilities,
            confidence: remote.confidence,
            factors: remote.factors,
            recommendations: remote.recommendations,
            prediction_method: PredictionMethod::RemoteModel,
            english_average: remote.english_average,
            model_version: remote.model_version,
            corrected: false,
            created_at: Utc::now(),
        })
    }

    fn status(
        &self,
        connected: bool,
        data: Option<serde_json::Value>,
        error: Option<String>,
    ) -> ConnectionStatus {
        ConnectionStatus {
            connected,
            url: self.base_url.clone(),
            data,
            error,
        }
    }
}

/// Remote-first prediction with the local classifier as fallback.
#[derive(Debug, Clone, Default)]
pub struct Predictor {
    client: Option<PredictionClient>,
}

impl Predictor {
    pub fn local() -> Self {
        Self { client: None }
    }

    pub fn remote(client: PredictionClient) -> Self {
        Self {
            client: Some(client),
        }
    }

    pub fn client(&self) -> Option<&PredictionClient> {
        self.client.as_ref()
    }

    pub async fn predict(&self, student: &StudentRecord) -> PredictionRecord {
        if let Some(client) = &self.client {
            match client.predict(student).await {
                Ok(prediction) => return prediction,
                Err(err) => {
                    warn!(student_id = %student.id, error = %err, "remote prediction failed, using fallback");
                }
            }
        }

        risk::fallback_prediction(student, Utc::now())
    }
}
