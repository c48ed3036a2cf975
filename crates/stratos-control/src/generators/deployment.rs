// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster, registry, and DNS objects of a deployment.
//!
//! Names follow `<deployment>` for the primary objects and
//! `<deployment>-<suffix>` for auxiliaries. Custom deployments get a
//! registry project of their own, and their cluster workload pulls from it
//! through a docker-config secret built from the project's robot account.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use stratos_core::models::Deployment;
use stratos_core::models::deployment::{App, DeploymentType};
use stratos_core::models::subsystems::{Labels, Projection};
use stratos_core::models::subsystems::dns::{DnsRecord, DnsRecordType};
use stratos_core::models::subsystems::k8s::{
    Hpa, Ingress, K8sObject, NetworkPolicy, PersistentVolume, PersistentVolumeClaim, Secret,
    Service, VolumeMount, Workload,
};
use stratos_core::models::subsystems::registry::{
    RegistryObject, RegistryProject, RegistryRepository, RegistryRobot, RegistryWebhook,
};

use super::GenContext;
use crate::error::{Error, Result};

/// Suffix of the image pull secret.
pub const IMAGE_PULL_SECRET_SUFFIX: &str = "image-pull-secret";

const DNS_TTL: u32 = 300;
const VOLUME_CAPACITY: &str = "10Gi";
const HPA_CPU_TARGET: u32 = 80;

fn main_app(deployment: &Deployment) -> Result<&App> {
    deployment.spec.main_app().ok_or_else(|| {
        Error::Invariant(format!("deployment {} has no apps", deployment.id))
    })
}

fn selector(deployment: &Deployment) -> Labels {
    Labels::from([("app".to_string(), deployment.name.clone())])
}

/// Image a custom deployment runs after a build tagged `tag`.
pub fn custom_image(deployment: &Deployment, registry_url: &str, tag: &str) -> String {
    format!(
        "{}/{}/{}:{}",
        registry_url,
        registry_project_name(deployment),
        deployment.name,
        tag
    )
}

/// Registry project owned by a custom deployment.
pub fn registry_project_name(deployment: &Deployment) -> String {
    deployment.name.clone()
}

/// Name of the image pull secret.
pub fn image_pull_secret_name(deployment: &Deployment) -> String {
    format!("{}-{}", deployment.name, IMAGE_PULL_SECRET_SUFFIX)
}

/// Public hostname of a deployment.
pub fn public_host(deployment: &Deployment, ctx: &GenContext<'_>) -> String {
    ctx.public_host(&deployment.name)
}

fn docker_config(registry_url: &str, robot: &RegistryRobot) -> Result<String> {
    let auth = STANDARD.encode(format!("{}:{}", robot.name, robot.secret));
    let config = json!({
        "auths": {
            registry_url: {
                "username": robot.name,
                "password": robot.secret,
                "auth": auth,
            }
        }
    });
    Ok(serde_json::to_string(&config)?)
}

/// Desired `subsystems.k8s` map.
///
/// Custom deployments need their robot account, as observed, for the pull secret.
pub fn k8s_objects(
    deployment: &Deployment,
    ctx: &GenContext<'_>,
    robot: Option<&RegistryRobot>,
) -> Result<BTreeMap<String, K8sObject>> {
    let app = main_app(deployment)?;
    let namespace = ctx.zone.deployment_namespace.clone();
    let labels = ctx.labels(&deployment.name, &deployment.owner_id);
    let mut objects = Vec::new();

    let mut mounts = Vec::new();
    for volume in &app.volumes {
        let name = format!("{}-{}", deployment.name, volume.name);
        objects.push(K8sObject::PersistentVolume(PersistentVolume {
            name: name.clone(),
            uid: String::new(),
            labels: labels.clone(),
            capacity: VOLUME_CAPACITY.to_string(),
            nfs_server: ctx.zone.nfs_server.clone(),
            nfs_path: format!(
                "{}/{}/{}",
                ctx.zone.nfs_base_path,
                deployment.owner_id,
                volume.server_path.trim_start_matches('/')
            ),
            created_at: None,
        }));
        objects.push(K8sObject::PersistentVolumeClaim(PersistentVolumeClaim {
            name: name.clone(),
            namespace: namespace.clone(),
            uid: String::new(),
            labels: labels.clone(),
            capacity: VOLUME_CAPACITY.to_string(),
            volume_name: name.clone(),
            created_at: None,
        }));
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            claim_name: name,
            mount_path: volume.app_path.clone(),
        });
    }

    let mut image_pull_secrets = Vec::new();
    if deployment.spec.deployment_type == DeploymentType::Custom {
        let robot = robot.filter(|r| !r.secret.is_empty()).ok_or_else(|| {
            Error::Invariant(format!(
                "pull secret for deployment {} needs a created registry robot",
                deployment.id
            ))
        })?;
        let secret_name = image_pull_secret_name(deployment);
        objects.push(K8sObject::Secret(Secret {
            name: secret_name.clone(),
            namespace: namespace.clone(),
            uid: String::new(),
            labels: labels.clone(),
            secret_type: "kubernetes.io/dockerconfigjson".to_string(),
            data: BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                docker_config(ctx.registry_url, robot)?,
            )]),
            created_at: None,
        }));
        image_pull_secrets.push(secret_name);
    }

    let mut env: BTreeMap<String, String> = app
        .env
        .iter()
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect();
    env.entry("PORT".to_string())
        .or_insert_with(|| app.internal_port.to_string());

    let mut workload_labels = labels.clone();
    workload_labels.extend(selector(deployment));
    objects.push(K8sObject::Deployment(Workload {
        name: deployment.name.clone(),
        namespace: namespace.clone(),
        uid: String::new(),
        labels: workload_labels,
        image: app.image.clone(),
        args: app.args.clone(),
        env,
        port: app.internal_port,
        replicas: app.replicas,
        volumes: mounts,
        image_pull_secrets,
        created_at: None,
    }));

    objects.push(K8sObject::Service(Service {
        name: deployment.name.clone(),
        namespace: namespace.clone(),
        uid: String::new(),
        labels: labels.clone(),
        selector: selector(deployment),
        port: app.internal_port,
        target_port: app.internal_port,
        created_at: None,
    }));

    if app.replicas > 1 {
        objects.push(K8sObject::Hpa(Hpa {
            name: deployment.name.clone(),
            namespace: namespace.clone(),
            uid: String::new(),
            labels: labels.clone(),
            target: deployment.name.clone(),
            min_replicas: app.replicas,
            max_replicas: app.replicas * 2,
            cpu_average_utilization: HPA_CPU_TARGET,
            created_at: None,
        }));
    }

    if deployment.spec.private {
        objects.push(K8sObject::NetworkPolicy(NetworkPolicy {
            name: deployment.name.clone(),
            namespace: namespace.clone(),
            uid: String::new(),
            labels: labels.clone(),
            pod_selector: selector(deployment),
            allow_from_namespaces: vec![namespace.clone()],
            created_at: None,
        }));
    } else {
        objects.push(K8sObject::Ingress(Ingress {
            name: deployment.name.clone(),
            namespace,
            uid: String::new(),
            labels,
            hosts: vec![public_host(deployment, ctx)],
            service_name: deployment.name.clone(),
            service_port: app.internal_port,
            created_at: None,
        }));
    }

    Ok(objects.into_iter().map(|o| (o.key(), o)).collect())
}

/// Desired `subsystems.registry` map. Empty for prebuilt deployments.
pub fn registry_objects(
    deployment: &Deployment,
    ctx: &GenContext<'_>,
) -> BTreeMap<String, RegistryObject> {
    if deployment.spec.deployment_type != DeploymentType::Custom {
        return BTreeMap::new();
    }

    let project = registry_project_name(deployment);
    let objects = [
        RegistryObject::Project(RegistryProject {
            id: String::new(),
            name: project.clone(),
            public: false,
            created_at: None,
        }),
        RegistryObject::Robot(RegistryRobot {
            id: String::new(),
            name: deployment.name.clone(),
            project_name: project.clone(),
            secret: String::new(),
            created_at: None,
        }),
        RegistryObject::Repository(RegistryRepository {
            id: String::new(),
            name: deployment.name.clone(),
            project_name: project.clone(),
            created_at: None,
        }),
        RegistryObject::Webhook(RegistryWebhook {
            id: String::new(),
            name: deployment.name.clone(),
            project_name: project,
            target_url: format!("https://{}/hooks/registry", ctx.deployer_id),
            created_at: None,
        }),
    ];

    objects
        .into_iter()
        .map(|o| (registry_key(&o), o))
        .collect()
}

/// Key of a registry object in `subsystems.registry`.
pub fn registry_key(obj: &RegistryObject) -> String {
    let kind = match obj {
        RegistryObject::Project(_) => "project",
        RegistryObject::Robot(_) => "robot",
        RegistryObject::Repository(_) => "repository",
        RegistryObject::Webhook(_) => "webhook",
    };
    format!("{}/{}", kind, obj.name())
}

/// Key of the robot account in `subsystems.registry`.
pub fn robot_key(deployment: &Deployment) -> String {
    format!("robot/{}", deployment.name)
}

/// Desired `subsystems.dns` map: a CNAME to the zone's ingress for public deployments.
pub fn dns_records(deployment: &Deployment, ctx: &GenContext<'_>) -> BTreeMap<String, DnsRecord> {
    if deployment.spec.private {
        return BTreeMap::new();
    }
    let hostname = public_host(deployment, ctx);
    let record = DnsRecord {
        id: String::new(),
        zone: ctx.zone.domain.clone(),
        hostname: hostname.clone(),
        record_type: DnsRecordType::Cname,
        content: ctx.zone.ingress_endpoint.clone(),
        ttl: DNS_TTL,
        created_at: None,
    };
    BTreeMap::from([(format!("cname/{}", hostname), record)])
}

/// CI workflow that builds and pushes a custom deployment's image.
///
/// Rendered as JSON, which every YAML-based CI runner accepts.
pub fn ci_config(deployment: &Deployment, ctx: &GenContext<'_>, robot: &RegistryRobot) -> Value {
    let image = format!(
        "{}/{}/{}",
        ctx.registry_url,
        registry_project_name(deployment),
        deployment.name
    );
    json!({
        "name": format!("deploy-{}", deployment.name),
        "on": { "push": { "branches": ["main"] } },
        "jobs": {
            "build": {
                "runs-on": "ubuntu-latest",
                "steps": [
                    {
                        "name": "Login to registry",
                        "uses": "docker/login-action@v3",
                        "with": {
                            "registry": ctx.registry_url,
                            "username": robot.name,
                            "password": robot.secret,
                        }
                    },
                    {
                        "name": "Build and push",
                        "uses": "docker/build-push-action@v5",
                        "with": {
                            "push": true,
                            "tags": format!("{}:latest", image),
                        }
                    }
                ]
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use stratos_core::models::deployment::{DeploymentSpec, EnvVar, Volume};

    use super::*;
    use crate::generators::fixtures;

    fn deployment(kind: DeploymentType, private: bool, replicas: u32) -> Deployment {
        Deployment::new(
            "d1",
            "web",
            "u1",
            "se-1",
            DeploymentSpec {
                deployment_type: kind,
                private,
                apps: vec![App {
                    name: "main".to_string(),
                    image: "nginx:1.27".to_string(),
                    internal_port: 8080,
                    env: vec![EnvVar {
                        name: "MODE".to_string(),
                        value: "prod".to_string(),
                    }],
                    volumes: vec![Volume {
                        name: "data".to_string(),
                        app_path: "/data".to_string(),
                        server_path: "/web/data".to_string(),
                    }],
                    args: Vec::new(),
                    replicas,
                }],
            },
        )
    }

    fn ctx(zone: &crate::config::ZoneConfig) -> GenContext<'_> {
        GenContext {
            deployer_id: "stratos-se1",
            registry_url: "registry.local",
            admin_ssh_keys: &[],
            zone,
        }
    }

    #[test]
    fn test_public_prebuilt_objects() {
        let zone = fixtures::zone();
        let d = deployment(DeploymentType::Prebuilt, false, 1);
        let objects = k8s_objects(&d, &ctx(&zone), None).unwrap();

        let keys: Vec<&str> = objects.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "deployment/web",
                "ingress/web",
                "pv/web-data",
                "pvc/web-data",
                "service/web"
            ]
        );

        match &objects["deployment/web"] {
            K8sObject::Deployment(w) => {
                assert_eq!(w.env["PORT"], "8080");
                assert_eq!(w.env["MODE"], "prod");
                assert_eq!(w.volumes[0].claim_name, "web-data");
                assert!(w.image_pull_secrets.is_empty());
            }
            other => panic!("unexpected object: {:?}", other),
        }
        match &objects["pv/web-data"] {
            K8sObject::PersistentVolume(pv) => {
                assert_eq!(pv.nfs_path, "/mnt/cloud/u1/web/data");
            }
            other => panic!("unexpected object: {:?}", other),
        }

        let dns = dns_records(&d, &ctx(&zone));
        let record = &dns["cname/web.app.example.net"];
        assert_eq!(record.content, "ingress.se-1.example.net");
        assert!(registry_objects(&d, &ctx(&zone)).is_empty());
    }

    #[test]
    fn test_private_replicated_objects() {
        let zone = fixtures::zone();
        let d = deployment(DeploymentType::Prebuilt, true, 3);
        let objects = k8s_objects(&d, &ctx(&zone), None).unwrap();

        assert!(objects.contains_key("networkpolicy/web"));
        assert!(!objects.contains_key("ingress/web"));
        match &objects["hpa/web"] {
            K8sObject::Hpa(hpa) => {
                assert_eq!(hpa.min_replicas, 3);
                assert_eq!(hpa.max_replicas, 6);
            }
            other => panic!("unexpected object: {:?}", other),
        }
        assert!(dns_records(&d, &ctx(&zone)).is_empty());
    }

    #[test]
    fn test_custom_requires_robot_and_renders_pull_secret() {
        let zone = fixtures::zone();
        let d = deployment(DeploymentType::Custom, false, 1);

        assert!(matches!(
            k8s_objects(&d, &ctx(&zone), None),
            Err(Error::Invariant(_))
        ));

        let registry = registry_objects(&d, &ctx(&zone));
        assert_eq!(registry.len(), 4);
        assert!(registry.contains_key(&robot_key(&d)));

        let robot = RegistryRobot {
            id: "r1".to_string(),
            name: "web".to_string(),
            project_name: "web".to_string(),
            secret: "s3cret".to_string(),
            created_at: None,
        };
        let objects = k8s_objects(&d, &ctx(&zone), Some(&robot)).unwrap();
        match &objects["secret/web-image-pull-secret"] {
            K8sObject::Secret(secret) => {
                let config: Value =
                    serde_json::from_str(&secret.data[".dockerconfigjson"]).unwrap();
                assert_eq!(
                    config["auths"]["registry.local"]["auth"],
                    STANDARD.encode("web:s3cret")
                );
            }
            other => panic!("unexpected object: {:?}", other),
        }

        let ci = ci_config(&d, &ctx(&zone), &robot);
        assert_eq!(ci["jobs"]["build"]["steps"][0]["with"]["password"], "s3cret");
        assert_eq!(
            custom_image(&d, "registry.local", "v2"),
            "registry.local/web/web:v2"
        );
    }
}
