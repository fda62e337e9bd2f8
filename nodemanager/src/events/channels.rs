//! Channel naming
//!
//! All channel names are built here. Observers written before multi-app
//! support listen on `log:<project>`, so output of the `default` app is
//! mirrored there.

use crate::launch::DEFAULT_APP;

/// Qualified log channel of one app
pub fn log(project_id: &str, app_name: &str) -> String {
    format!("log:{}:{}", project_id, app_name)
}

/// Unqualified log channel of a project
pub fn legacy_log(project_id: &str) -> String {
    format!("log:{}", project_id)
}

/// Lifecycle event channel of a project
pub fn lifecycle(project_id: &str) -> String {
    format!("lifecycle:{}", project_id)
}

/// Every channel that output of `(project_id, app_name)` is published to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRoute {
    targets: Vec<String>,
}

impl LogRoute {
    pub fn new(project_id: &str, app_name: &str) -> Self {
        let mut targets = vec![log(project_id, app_name)];
        if app_name == DEFAULT_APP {
            targets.push(legacy_log(project_id));
        }
        Self { targets }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}
