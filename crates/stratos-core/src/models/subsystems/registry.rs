// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image registry objects used by custom deployments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Projection, delegate_projection};

/// A registry project (one per custom deployment).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryProject {
    /// Registry id.
    #[serde(default)]
    pub id: String,
    /// Project name.
    pub name: String,
    /// Whether anonymous pulls are allowed.
    pub public: bool,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A robot account that can push to and pull from one project.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRobot {
    /// Registry id.
    #[serde(default)]
    pub id: String,
    /// Robot name.
    pub name: String,
    /// Project the robot is scoped to.
    pub project_name: String,
    /// Generated credential, only known after creation.
    #[serde(default)]
    pub secret: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A repository inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRepository {
    /// Registry id.
    #[serde(default)]
    pub id: String,
    /// Repository name.
    pub name: String,
    /// Owning project.
    pub project_name: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A webhook fired when an image is pushed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryWebhook {
    /// Registry id.
    #[serde(default)]
    pub id: String,
    /// Webhook name.
    pub name: String,
    /// Owning project.
    pub project_name: String,
    /// Endpoint notified on push.
    pub target_url: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

macro_rules! id_projection {
    ($($ty:ident),+) => {
        $(
            impl Projection for $ty {
                fn id(&self) -> &str {
                    &self.id
                }

                fn name(&self) -> &str {
                    &self.name
                }

                fn clear_timestamps(&mut self) {
                    self.created_at = None;
                }

                fn adopt_identity(&mut self, observed: &Self) {
                    self.id = observed.id.clone();
                }
            }
        )+
    };
}

id_projection!(RegistryProject, RegistryRepository, RegistryWebhook);

impl Projection for RegistryRobot {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clear_timestamps(&mut self) {
        self.created_at = None;
    }

    fn adopt_identity(&mut self, observed: &Self) {
        self.id = observed.id.clone();
        self.secret = observed.secret.clone();
    }
}

/// Any object a deployment projects into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RegistryObject {
    /// Project.
    Project(RegistryProject),
    /// Robot account.
    Robot(RegistryRobot),
    /// Repository.
    Repository(RegistryRepository),
    /// Push webhook.
    Webhook(RegistryWebhook),
}

delegate_projection!(RegistryObject {
    Project,
    Robot,
    Repository,
    Webhook,
});

impl RegistryObject {
    /// Teardown order: the project goes last.
    pub fn delete_rank(&self) -> u8 {
        match self {
            RegistryObject::Webhook(_) => 0,
            RegistryObject::Robot(_) | RegistryObject::Repository(_) => 1,
            RegistryObject::Project(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robot_adopts_generated_secret() {
        let observed = RegistryRobot {
            id: "7".to_string(),
            name: "web-robot".to_string(),
            project_name: "web".to_string(),
            secret: "s3cr3t".to_string(),
            created_at: Some(Utc::now()),
        };
        let mut desired = RegistryRobot {
            name: "web-robot".to_string(),
            project_name: "web".to_string(),
            ..Default::default()
        };
        desired.adopt_identity(&observed);
        assert!(desired.matches(&observed));
    }
}
