#![allow(dead_code)]
//! Minimal Home Assistant REST client.
//!
//! Implements only the two calls the [`Adapter`](super::Adapter) needs
//! (`get_state`, `call_service`). Event subscriptions, the websocket API,
//! and publishing our own entities back into Home Assistant are out of
//! scope (original_source/evse_manager/app/ha_api.py covers far more than
//! this controller uses).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::DataSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

pub struct HomeAssistantClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HomeAssistantClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Home Assistant HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }
}

#[async_trait]
impl DataSource for HomeAssistantClient {
    async fn get_state(&self, entity_id: &str) -> Result<Option<String>> {
        let url = format!("{}/api/states/{entity_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("GET {url} returned {}", response.status()));
        }

        let parsed: StateResponse = response
            .json()
            .await
            .with_context(|| format!("malformed state payload for {entity_id}"))?;
        debug!(entity_id, state = %parsed.state, "read entity state");
        Ok(Some(parsed.state))
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        value: Option<f64>,
    ) -> Result<()> {
        let url = format!("{}/api/services/{domain}/{service}", self.base_url);
        let mut body = json!({ "entity_id": entity_id });
        if let Some(value) = value {
            body["value"] = json!(value);
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        if !response.status().is_success() {
            return Err(anyhow!("POST {url} returned {}", response.status()));
        }
        debug!(domain, service, entity_id, ?value, "called service");
        Ok(())
    }
}
