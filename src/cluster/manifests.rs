//! Kubernetes objects generated from container recipes

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar as K8sEnvVar, Namespace, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::location::Location;
use crate::recipe::ContainerRecipe;

/// Standard app name label
pub const APP_LABEL: &str = "app.kubernetes.io/name";
/// Standard managed-by label
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`] on everything this crate creates
pub const MANAGED_BY_VALUE: &str = "kube-workflow";
/// Label selecting the pods of one deployment
pub const DEPLOYMENT_LABEL: &str = "kube-workflow.dev/deployment";
/// Label carrying the workflow number
pub const WORKFLOW_LABEL: &str = "kube-workflow.dev/workflow";

/// Deployment name of a workflow
pub fn deployment_name(workflow_number: u64) -> String {
    format!("deploy-{}", workflow_number)
}

/// Service name of a workflow
pub fn service_name(workflow_number: u64) -> String {
    format!("service-{}", workflow_number)
}

/// Labels that select the pods of `deployment_name`
pub fn selector_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(DEPLOYMENT_LABEL.to_string(), deployment_name.to_string())])
}

/// Render labels as a label selector query (`k=v,k2=v2`)
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn resource_labels(workflow_number: u64) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (WORKFLOW_LABEL.to_string(), workflow_number.to_string()),
    ])
}

/// The test namespace object
pub fn build_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([
                ("name".to_string(), name.to_string()),
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// One deployment whose single pod runs every recipe as a container
pub fn build_deployment(
    name: &str,
    namespace: &str,
    workflow_number: u64,
    recipes: &[ContainerRecipe],
    location: &Location,
) -> Deployment {
    let selector = selector_labels(name);

    let mut pod_labels = resource_labels(workflow_number);
    if let Some(first) = recipes.first() {
        pod_labels.insert(APP_LABEL.to_string(), first.app_name().to_string());
    }
    let mut pod_annotations = BTreeMap::new();
    for recipe in recipes {
        pod_labels.extend(recipe.pod_labels().clone());
        pod_annotations.extend(recipe.pod_annotations().clone());
    }
    // Recipe labels must not detach the pod from its deployment
    pod_labels.extend(selector.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(resource_labels(workflow_number)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: if pod_annotations.is_empty() {
                        None
                    } else {
                        Some(pod_annotations)
                    },
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: recipes.iter().map(build_container).collect(),
                    node_selector: location.node_selector(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_container(recipe: &ContainerRecipe) -> Container {
    let ports: Vec<ContainerPort> = recipe
        .all_ports()
        .map(|port| ContainerPort {
            container_port: i32::from(port.number),
            name: Some(port.k8s_name()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    let env: Vec<K8sEnvVar> = recipe
        .env_vars()
        .iter()
        .map(|var| K8sEnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            ..Default::default()
        })
        .collect();

    Container {
        name: recipe.name(),
        image: Some(recipe.image().to_string()),
        ports: if ports.is_empty() { None } else { Some(ports) },
        env: if env.is_empty() { None } else { Some(env) },
        ..Default::default()
    }
}

/// A NodePort service exposing the union of the recipes' exposed ports
///
/// Returns `None` when no recipe exposes a port; Kubernetes rejects
/// services without ports.
pub fn build_service(
    name: &str,
    namespace: &str,
    deployment_name: &str,
    workflow_number: u64,
    recipes: &[ContainerRecipe],
) -> Option<Service> {
    let ports: Vec<ServicePort> = recipes
        .iter()
        .flat_map(|recipe| recipe.exposed_ports())
        .map(|port| ServicePort {
            name: Some(port.k8s_name()),
            protocol: Some("TCP".to_string()),
            port: i32::from(port.number),
            target_port: Some(IntOrString::String(port.k8s_name())),
            ..Default::default()
        })
        .collect();

    if ports.is_empty() {
        return None;
    }

    Some(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(resource_labels(workflow_number)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector_labels(deployment_name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Node ports assigned by the API server, keyed by service port number
pub fn node_ports(service: &Service) -> BTreeMap<u16, u16> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    let port = u16::try_from(p.port).ok()?;
                    let node_port = u16::try_from(p.node_port?).ok()?;
                    Some((port, node_port))
                })
                .collect()
        })
        .unwrap_or_default()
}
