//! The pool of job plans waiting for an agent.

use cadence_core::Result;
use cadence_core::ids::JobId;
use cadence_core::job::JobPlan;
use cadence_core::ports::JobRepository;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of a reload: what the pool held before and after.
#[derive(Debug, Clone, Default)]
pub struct PoolReload {
    pub previous: Vec<JobPlan>,
    pub current: Vec<JobPlan>,
}

/// Ordered pending job plans.
///
/// Reload swaps in a freshly loaded list; match-then-remove happens under
/// the same lock so a plan is handed out at most once.
pub struct JobPlanPool {
    jobs: Arc<dyn JobRepository>,
    plans: Mutex<Vec<JobPlan>>,
}

impl JobPlanPool {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            plans: Mutex::new(Vec::new()),
        }
    }

    /// Replace the pool with the persisted pending plans.
    pub async fn reload(&self) -> Result<PoolReload> {
        let loaded = self.jobs.load_pending_job_plans().await?;
        let mut seen = HashSet::new();
        let current: Vec<JobPlan> = loaded
            .into_iter()
            .filter(|plan| plan.agent_id.is_none() && seen.insert(plan.job_id()))
            .collect();

        let previous = {
            let mut plans = self.plans.lock().await;
            std::mem::replace(&mut *plans, current.clone())
        };
        debug!(
            previous = previous.len(),
            current = current.len(),
            "Reloaded job plan pool"
        );
        Ok(PoolReload { previous, current })
    }

    /// Snapshot of the pool in order.
    pub async fn job_plans(&self) -> Vec<JobPlan> {
        self.plans.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.plans.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plans.lock().await.is_empty()
    }

    pub async fn contains(&self, job_id: JobId) -> bool {
        self.plans.lock().await.iter().any(|p| p.job_id() == job_id)
    }

    /// Remove and return the first plan satisfying `predicate`.
    pub async fn take_first<F>(&self, predicate: F) -> Option<JobPlan>
    where
        F: Fn(&JobPlan) -> bool,
    {
        let mut plans = self.plans.lock().await;
        let index = plans.iter().position(predicate)?;
        Some(plans.remove(index))
    }

    /// Remove and return a specific plan, if still pooled.
    pub async fn take(&self, job_id: JobId) -> Option<JobPlan> {
        let mut plans = self.plans.lock().await;
        let index = plans.iter().position(|p| p.job_id() == job_id)?;
        Some(plans.remove(index))
    }

    pub async fn remove(&self, job_id: JobId) -> bool {
        self.take(job_id).await.is_some()
    }

    /// Put a plan back after a failed hand-out, keeping schedule order.
    pub async fn restore(&self, plan: JobPlan) {
        let mut plans = self.plans.lock().await;
        if plans.iter().any(|p| p.job_id() == plan.job_id()) {
            return;
        }
        let index = plans
            .iter()
            .position(|p| (p.scheduled_at, p.job_id()) > (plan.scheduled_at, plan.job_id()))
            .unwrap_or(plans.len());
        plans.insert(index, plan);
    }

    /// Remove every plan `keep` rejects and return them.
    pub async fn drain_where<F>(&self, reject: F) -> Vec<JobPlan>
    where
        F: Fn(&JobPlan) -> bool,
    {
        let mut plans = self.plans.lock().await;
        let (rejected, kept): (Vec<_>, Vec<_>) = plans.drain(..).partition(|p| reject(p));
        *plans = kept;
        rejected
    }
}
