//! Environment and resource matching between agents and job plans.

use cadence_core::agent::Agent;
use cadence_core::config::CruiseConfig;
use cadence_core::job::JobPlan;

/// Whether the agent's environment membership allows it to run the plan.
///
/// A job whose pipeline belongs to environment `E` only runs on agents in
/// `E`. A job outside every environment only runs on agents outside every
/// environment.
pub fn environment_matches(plan: &JobPlan, agent: &Agent, config: &CruiseConfig) -> bool {
    match config.environment_for_pipeline(plan.pipeline_name()) {
        Some(environment) => agent.environments.contains(&environment.name),
        None => agent.environments.is_empty(),
    }
}

/// Whether every resource the plan needs is offered by the agent.
pub fn resources_match(plan: &JobPlan, agent: &Agent) -> bool {
    plan.resources.is_subset(&agent.resources)
}

/// Plans the agent may run as far as environments go, in pool order.
pub fn filter_by_agent<'a>(
    plans: &'a [JobPlan],
    agent: &Agent,
    config: &CruiseConfig,
) -> Vec<&'a JobPlan> {
    plans
        .iter()
        .filter(|plan| environment_matches(plan, agent, config))
        .collect()
}

/// Whether a static agent can take the plan.
pub fn static_assignment_matches(plan: &JobPlan, agent: &Agent) -> bool {
    !agent.is_elastic() && !plan.requires_elastic_agent() && resources_match(plan, agent)
}

/// First plan, in pool order, a static agent can take.
pub fn first_matching<'a>(agent: &Agent, plans: &[&'a JobPlan]) -> Option<&'a JobPlan> {
    plans
        .iter()
        .copied()
        .find(|plan| static_assignment_matches(plan, agent))
}
