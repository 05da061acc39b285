//! A scripted planner: canned plans served in order.
//!
//! Backs tests and local demos. Initial plans are consumed per
//! `plan_initial` call; correction plans are consumed per
//! `plan_correction` call. When a queue runs dry the planner reports
//! itself unavailable, which exercises the engine's terminal-failure path.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CorrectionContext, CorrectionPlan, PlanError, PlannedTask, Planner};

#[derive(Default)]
pub struct ScriptedPlanner {
    initial: Mutex<VecDeque<Vec<PlannedTask>>>,
    corrections: Mutex<VecDeque<CorrectionPlan>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plan for the next `plan_initial` call.
    pub fn push_initial(&self, plan: Vec<PlannedTask>) {
        self.initial.lock().unwrap().push_back(plan);
    }

    /// Queue a plan for the next `plan_correction` call.
    pub fn push_correction(&self, plan: CorrectionPlan) {
        self.corrections.lock().unwrap().push_back(plan);
    }

    /// Number of queued correction plans not yet consumed.
    pub fn corrections_remaining(&self) -> usize {
        self.corrections.lock().unwrap().len()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan_initial(&self, _prompt: &str) -> Result<Vec<PlannedTask>, PlanError> {
        self.initial
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PlanError::Unavailable("no scripted initial plan queued".into()))
    }

    async fn plan_correction(
        &self,
        _context: &CorrectionContext,
    ) -> Result<CorrectionPlan, PlanError> {
        self.corrections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PlanError::Unavailable("no scripted correction plan queued".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn serves_plans_in_order_then_runs_dry() {
        let planner = ScriptedPlanner::new();
        planner.push_initial(vec![PlannedTask {
            description: "first".into(),
            executor_type: "generic".into(),
            parameters: json!({}),
            dependencies: vec![],
        }]);

        let plan = planner.plan_initial("anything").await.unwrap();
        assert_eq!(plan[0].description, "first");

        let err = planner.plan_initial("anything").await.unwrap_err();
        assert!(matches!(err, PlanError::Unavailable(_)));
    }
}
