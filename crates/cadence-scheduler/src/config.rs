//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Intervals and thresholds used by the scheduling loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the job plan pool is reloaded from persistence.
    #[serde(default = "default_job_plan_reload_interval_ms")]
    pub job_plan_reload_interval_ms: u64,
    /// How often queued build causes are turned into pipeline instances.
    #[serde(default = "default_auto_schedule_interval_ms")]
    pub auto_schedule_interval_ms: u64,
    /// How often idle pipelines are checked for new build causes.
    #[serde(default = "default_schedule_check_interval_ms")]
    pub schedule_check_interval_ms: u64,
    #[serde(default = "default_elastic_heartbeat_interval_secs")]
    pub elastic_heartbeat_interval_secs: u64,
    /// Age after which an elastic job gets a fresh create-agent request.
    #[serde(default = "default_elastic_starvation_threshold_secs")]
    pub elastic_starvation_threshold_secs: u64,
    #[serde(default = "default_agent_stuck_in_cancel_timeout_secs")]
    pub agent_stuck_in_cancel_timeout_secs: u64,
    #[serde(default = "default_agent_lost_contact_timeout_secs")]
    pub agent_lost_contact_timeout_secs: u64,
    #[serde(default = "default_unresponsive_job_warning_minutes")]
    pub unresponsive_job_warning_minutes: u64,
    /// Timeout for jobs configured with the default timeout. `None` never
    /// cancels them.
    #[serde(default)]
    pub default_job_timeout_minutes: Option<u64>,
    #[serde(default = "default_scheduled_job_warning_minutes")]
    pub scheduled_job_warning_minutes: u64,
    #[serde(default = "default_hang_check_interval_secs")]
    pub hang_check_interval_secs: u64,
    #[serde(default = "default_hung_job_check_interval_secs")]
    pub hung_job_check_interval_secs: u64,
    /// Scheduling stops below this much free artifact space.
    #[serde(default = "default_minimum_free_disk_bytes")]
    pub minimum_free_disk_bytes: u64,
    /// Approve agents on first contact.
    #[serde(default)]
    pub auto_register_agents: bool,
    #[serde(default = "default_working_directory_root")]
    pub working_directory_root: String,
}

fn default_job_plan_reload_interval_ms() -> u64 {
    5_000
}

fn default_auto_schedule_interval_ms() -> u64 {
    5_000
}

fn default_schedule_check_interval_ms() -> u64 {
    10_000
}

fn default_elastic_heartbeat_interval_secs() -> u64 {
    60
}

fn default_elastic_starvation_threshold_secs() -> u64 {
    600
}

fn default_agent_stuck_in_cancel_timeout_secs() -> u64 {
    600
}

fn default_agent_lost_contact_timeout_secs() -> u64 {
    300
}

fn default_unresponsive_job_warning_minutes() -> u64 {
    5
}

fn default_scheduled_job_warning_minutes() -> u64 {
    15
}

fn default_hang_check_interval_secs() -> u64 {
    60
}

fn default_hung_job_check_interval_secs() -> u64 {
    60
}

fn default_minimum_free_disk_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_working_directory_root() -> String {
    "pipelines".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_plan_reload_interval_ms: default_job_plan_reload_interval_ms(),
            auto_schedule_interval_ms: default_auto_schedule_interval_ms(),
            schedule_check_interval_ms: default_schedule_check_interval_ms(),
            elastic_heartbeat_interval_secs: default_elastic_heartbeat_interval_secs(),
            elastic_starvation_threshold_secs: default_elastic_starvation_threshold_secs(),
            agent_stuck_in_cancel_timeout_secs: default_agent_stuck_in_cancel_timeout_secs(),
            agent_lost_contact_timeout_secs: default_agent_lost_contact_timeout_secs(),
            unresponsive_job_warning_minutes: default_unresponsive_job_warning_minutes(),
            default_job_timeout_minutes: None,
            scheduled_job_warning_minutes: default_scheduled_job_warning_minutes(),
            hang_check_interval_secs: default_hang_check_interval_secs(),
            hung_job_check_interval_secs: default_hung_job_check_interval_secs(),
            minimum_free_disk_bytes: default_minimum_free_disk_bytes(),
            auto_register_agents: false,
            working_directory_root: default_working_directory_root(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_auto_register(mut self, enabled: bool) -> Self {
        self.auto_register_agents = enabled;
        self
    }

    pub fn with_default_job_timeout_minutes(mut self, minutes: u64) -> Self {
        self.default_job_timeout_minutes = Some(minutes);
        self
    }

    pub fn with_starvation_threshold_secs(mut self, secs: u64) -> Self {
        self.elastic_starvation_threshold_secs = secs;
        self
    }

    pub fn starvation_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.elastic_starvation_threshold_secs as i64)
    }

    /// Lifetime of a create-agent request. Shorter than the starvation
    /// threshold so a stale request expires before the next one is posted.
    pub fn create_agent_message_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.elastic_starvation_threshold_secs * 900) as i64)
    }

    pub fn server_ping_message_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.elastic_heartbeat_interval_secs as i64)
    }

    pub fn stuck_in_cancel_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent_stuck_in_cancel_timeout_secs as i64)
    }

    pub fn lost_contact_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent_lost_contact_timeout_secs as i64)
    }

    pub fn unresponsive_job_warning(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.unresponsive_job_warning_minutes as i64)
    }

    pub fn scheduled_job_warning(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.scheduled_job_warning_minutes as i64)
    }

    pub fn job_plan_reload_interval(&self) -> Duration {
        Duration::from_millis(self.job_plan_reload_interval_ms)
    }

    pub fn auto_schedule_interval(&self) -> Duration {
        Duration::from_millis(self.auto_schedule_interval_ms)
    }

    pub fn schedule_check_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_check_interval_ms)
    }

    pub fn elastic_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.elastic_heartbeat_interval_secs)
    }

    pub fn hang_check_interval(&self) -> Duration {
        Duration::from_secs(self.hang_check_interval_secs)
    }

    pub fn hung_job_check_interval(&self) -> Duration {
        Duration::from_secs(self.hung_job_check_interval_secs)
    }
}
