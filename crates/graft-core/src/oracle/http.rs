//! HTTP-backed planner.
//!
//! Treats the planner as a remote service: `POST {base}/plan` with the
//! prompt, `POST {base}/correct` with the correction context. Whatever
//! model or cache sits behind those endpoints is invisible to the engine;
//! any transport or decode failure maps to `PlanError::Unavailable` and
//! is terminal for the workflow being planned.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{CorrectionContext, CorrectionPlan, PlanError, PlannedTask, Planner};

pub struct HttpPlanner {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    tasks: Vec<PlannedTask>,
}

impl HttpPlanner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan_initial(&self, prompt: &str) -> Result<Vec<PlannedTask>, PlanError> {
        let url = format!("{}/plan", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| PlanError::Unavailable(format!("POST {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PlanError::Unavailable(format!(
                "POST {url}: http status {}",
                response.status()
            )));
        }

        let plan: PlanResponse = response
            .json()
            .await
            .map_err(|e| PlanError::Invalid(format!("undecodable plan response: {e}")))?;
        Ok(plan.tasks)
    }

    async fn plan_correction(
        &self,
        context: &CorrectionContext,
    ) -> Result<CorrectionPlan, PlanError> {
        let url = format!("{}/correct", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(context)
            .send()
            .await
            .map_err(|e| PlanError::Unavailable(format!("POST {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PlanError::Unavailable(format!(
                "POST {url}: http status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PlanError::Invalid(format!("undecodable correction response: {e}")))
    }
}
