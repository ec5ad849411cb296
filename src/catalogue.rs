use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};

use crate::error::GateError;
use crate::verdict::{Catalogue, Verdict};

/// Registers verdicts with a metadata catalogue over HTTP. Registration is a
/// `PUT` keyed by pathogen and artifact, so repeating it is harmless.
#[derive(Clone)]
pub struct HttpCatalogue {
    client: Client,
    base_url: String,
}

impl HttpCatalogue {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seqgate/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GateError::Catalogue(err.to_string()))?,
        );

        if let Ok(token) = std::env::var("SEQGATE_CATALOGUE_TOKEN")
            && !token.trim().is_empty()
        {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|err| GateError::Catalogue(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| GateError::Catalogue(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn artifact_url(&self, verdict: &Verdict) -> String {
        format!(
            "{}/projects/{}/artifacts/{}",
            self.base_url, verdict.pathogen, verdict.artifact
        )
    }
}

impl Catalogue for HttpCatalogue {
    fn register(&self, verdict: &Verdict) -> Result<(), GateError> {
        let url = self.artifact_url(verdict);
        let body = serde_json::to_vec(verdict).map_err(|err| GateError::Encode(err.to_string()))?;
        let response = self
            .client
            .put(&url)
            .header("Idempotency-Key", verdict.submission_id.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|err| GateError::Catalogue(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalogue request failed".to_string());
            return Err(GateError::CatalogueStatus { status, message });
        }
        tracing::debug!(url = %url, "artifact registered");
        Ok(())
    }
}

/// Catalogue that accepts everything; used when no catalogue is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCatalogue;

impl Catalogue for NullCatalogue {
    fn register(&self, _verdict: &Verdict) -> Result<(), GateError> {
        Ok(())
    }
}
