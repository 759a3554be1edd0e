//! Materials and the build causes produced from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source of changes a pipeline listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaterialKind {
    Scm {
        url: String,
        branch: Option<String>,
    },
    Dependency {
        pipeline: String,
        stage: String,
    },
    Package {
        repository: String,
        package: String,
    },
    PluggableScm {
        plugin_id: String,
        scm_id: String,
    },
}

impl MaterialKind {
    pub fn display_name(&self) -> String {
        match self {
            MaterialKind::Scm { url, branch } => match branch {
                Some(branch) => format!("{url} [{branch}]"),
                None => url.clone(),
            },
            MaterialKind::Dependency { pipeline, stage } => format!("{pipeline} / {stage}"),
            MaterialKind::Package {
                repository,
                package,
            } => format!("{repository}:{package}"),
            MaterialKind::PluggableScm { plugin_id, scm_id } => format!("{plugin_id}:{scm_id}"),
        }
    }

    /// Upstream pipeline name for dependency materials.
    pub fn upstream_pipeline(&self) -> Option<&str> {
        match self {
            MaterialKind::Dependency { pipeline, .. } => Some(pipeline),
            MaterialKind::Scm { .. }
            | MaterialKind::Package { .. }
            | MaterialKind::PluggableScm { .. } => None,
        }
    }
}

/// A material at a particular revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRevision {
    pub material: MaterialKind,
    pub revision: String,
    pub changed: bool,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Why a pipeline instance was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCause {
    pub revisions: Vec<MaterialRevision>,
    pub approver: String,
    pub forced: bool,
}

impl BuildCause {
    pub const CHANGES_APPROVER: &'static str = "changes";
    pub const TIMER_APPROVER: &'static str = "timer";

    /// Cause for an automatic trigger from material changes.
    pub fn from_modifications(revisions: Vec<MaterialRevision>) -> Self {
        Self {
            revisions,
            approver: Self::CHANGES_APPROVER.to_string(),
            forced: false,
        }
    }

    /// Cause for a user-initiated trigger.
    pub fn forced_by(user: impl Into<String>, revisions: Vec<MaterialRevision>) -> Self {
        Self {
            revisions,
            approver: user.into(),
            forced: true,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.revisions.iter().any(|r| r.changed)
    }

    /// Same revisions, regardless of who asked.
    pub fn same_revisions(&self, other: &BuildCause) -> bool {
        self.revisions.len() == other.revisions.len()
            && self
                .revisions
                .iter()
                .zip(other.revisions.iter())
                .all(|(a, b)| a.material == b.material && a.revision == b.revision)
    }

    pub fn describe(&self) -> String {
        if self.forced {
            return format!("Forced by {}", self.approver);
        }
        let changed: Vec<_> = self
            .revisions
            .iter()
            .filter(|r| r.changed)
            .map(|r| r.material.display_name())
            .collect();
        if changed.is_empty() {
            "Triggered without changes".to_string()
        } else {
            format!("Modified: {}", changed.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scm(revision: &str, changed: bool) -> MaterialRevision {
        MaterialRevision {
            material: MaterialKind::Scm {
                url: "https://git.example.com/app.git".to_string(),
                branch: Some("main".to_string()),
            },
            revision: revision.to_string(),
            changed,
            modified_at: None,
        }
    }

    #[test]
    fn test_describe_build_cause() {
        let cause = BuildCause::from_modifications(vec![scm("abc123", true)]);
        assert_eq!(
            cause.describe(),
            "Modified: https://git.example.com/app.git [main]"
        );

        let forced = BuildCause::forced_by("admin", vec![scm("abc123", false)]);
        assert_eq!(forced.describe(), "Forced by admin");
        assert!(!forced.has_changes());
    }

    #[test]
    fn test_same_revisions_ignores_approver() {
        let a = BuildCause::from_modifications(vec![scm("abc123", true)]);
        let b = BuildCause::forced_by("admin", vec![scm("abc123", false)]);
        let c = BuildCause::from_modifications(vec![scm("def456", true)]);

        assert!(a.same_revisions(&b));
        assert!(!a.same_revisions(&c));
    }

    #[test]
    fn test_dependency_upstream() {
        let dep = MaterialKind::Dependency {
            pipeline: "upstream".to_string(),
            stage: "dist".to_string(),
        };
        assert_eq!(dep.upstream_pipeline(), Some("upstream"));
        assert_eq!(dep.display_name(), "upstream / dist");
    }
}
