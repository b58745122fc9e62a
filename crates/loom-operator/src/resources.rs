//! Kubernetes resource builders
//!
//! This module generates the workload manifests (Deployment, Service,
//! Ingress, backend Deployments) for a LoomHostController. The generated
//! objects carry owner references back to the controller resource so the
//! cluster garbage-collects them on delete.

use crate::crd::{LoomHostController, API_GROUP, API_VERSION};
use crate::error::{Error, Result};
use crate::store::BackendRef;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Port the server container listens on
const SERVER_PORT: i32 = 8080;

/// Builder for generating Kubernetes resources from a LoomHostController
pub struct WorkloadBuilder<'a> {
    controller: &'a LoomHostController,
    name: String,
    namespace: String,
}

impl<'a> WorkloadBuilder<'a> {
    /// Create a new workload builder
    pub fn new(controller: &'a LoomHostController) -> Result<Self> {
        let name = controller
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::InvalidSpec("host controller name is required".to_string()))?;

        let namespace = controller
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            controller,
            name,
            namespace,
        })
    }

    /// Name prefix for generated resources
    fn resource_name(&self) -> String {
        format!("loom-{}", self.name)
    }

    /// Owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: format!("{}/{}", API_GROUP, API_VERSION),
            kind: "LoomHostController".to_string(),
            name: self.name.clone(),
            uid: self.controller.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    fn probe(path: &str) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(SERVER_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }
    }

    /// Build the server Deployment
    pub fn build_deployment(&self) -> Deployment {
        let spec = &self.controller.spec;
        let labels = spec.get_labels(&self.name);
        let selector_labels = spec.get_selector_labels(&self.name);

        let container = Container {
            name: "loom-server".to_string(),
            image: Some(spec.server_image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: SERVER_PORT,
                ..Default::default()
            }]),
            resources: spec.resources.clone(),
            liveness_probe: Some(Self::probe("/healthz")),
            readiness_probe: Some(Self::probe("/readyz")),
            ..Default::default()
        };

        let mut pod_labels = selector_labels.clone();
        pod_labels.extend(spec.pod_labels.clone());

        let pod_spec = PodSpec {
            containers: vec![container],
            node_selector: if spec.node_selector.is_empty() {
                None
            } else {
                Some(spec.node_selector.clone())
            },
            tolerations: if spec.tolerations.is_empty() {
                None
            } else {
                Some(spec.tolerations.clone())
            },
            service_account_name: spec.service_account.clone(),
            security_context: Some(k8s_openapi::api::core::v1::PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                run_as_group: Some(1000),
                seccomp_profile: Some(k8s_openapi::api::core::v1::SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(self.resource_name(), labels),
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector_labels),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: if spec.pod_annotations.is_empty() {
                            None
                        } else {
                            Some(spec.pod_annotations.clone())
                        },
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the Service in front of the server Deployment
    pub fn build_service(&self) -> Service {
        let spec = &self.controller.spec;
        let labels = spec.get_labels(&self.name);
        let selector_labels = spec.get_selector_labels(&self.name);

        Service {
            metadata: self.metadata(self.resource_name(), labels),
            spec: Some(ServiceSpec {
                selector: Some(selector_labels),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(SERVER_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the Ingress routing every selected hostname to the Service
    ///
    /// Returns `None` when the ingress is disabled or no hostnames are
    /// selected.
    pub fn build_ingress(&self, hostnames: &[String]) -> Option<Ingress> {
        let spec = &self.controller.spec;
        if !spec.ingress.enabled || hostnames.is_empty() {
            return None;
        }

        let backend = IngressBackend {
            service: Some(IngressServiceBackend {
                name: self.resource_name(),
                port: Some(ServiceBackendPort {
                    number: Some(80),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };

        let rules: Vec<IngressRule> = hostnames
            .iter()
            .map(|hostname| IngressRule {
                host: Some(hostname.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: backend.clone(),
                    }],
                }),
            })
            .collect();

        let tls = spec.ingress.tls_secret_name.as_ref().map(|secret| {
            vec![IngressTLS {
                hosts: Some(hostnames.to_vec()),
                secret_name: Some(secret.clone()),
            }]
        });

        Some(Ingress {
            metadata: self.metadata(self.resource_name(), spec.get_labels(&self.name)),
            spec: Some(IngressSpec {
                ingress_class_name: spec.ingress.class_name.clone(),
                rules: Some(rules),
                tls,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Build the Deployment for one required non-default backend
    pub fn build_backend_deployment(&self, backend: &BackendRef) -> Deployment {
        let spec = &self.controller.spec;
        let mut labels = spec.get_labels(&self.name);
        labels.insert(
            "app.kubernetes.io/component".to_string(),
            "backend".to_string(),
        );

        let mut selector_labels = BTreeMap::new();
        selector_labels.insert(
            "app.kubernetes.io/name".to_string(),
            "loom-backend".to_string(),
        );
        selector_labels.insert(
            "app.kubernetes.io/instance".to_string(),
            backend.name.clone(),
        );

        let container = Container {
            name: "backend".to_string(),
            image: Some(backend.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: SERVER_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(format!("loom-backend-{}", backend.name), labels),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        automount_service_account_token: Some(false),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LoomHostControllerSpec;

    fn controller() -> LoomHostController {
        LoomHostController {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some("tenant-a".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: serde_json::from_value(serde_json::json!({
                "replicas": 2,
                "serverImage": "ghcr.io/loom-sh/loom-server:1.2.3"
            }))
            .unwrap(),
            status: None,
        }
    }

    #[test]
    fn test_deployment_basics() {
        let c = controller();
        let builder = WorkloadBuilder::new(&c).unwrap();
        let deployment = builder.build_deployment();

        assert_eq!(deployment.metadata.name.as_deref(), Some("loom-main"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/loom-sh/loom-server:1.2.3")
        );
    }

    #[test]
    fn test_owner_reference_points_at_controller() {
        let c = controller();
        let builder = WorkloadBuilder::new(&c).unwrap();
        let deployment = builder.build_deployment();

        let owners = deployment.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "LoomHostController");
        assert_eq!(owners[0].name, "main");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_ingress_routes_all_hostnames() {
        let c = controller();
        let builder = WorkloadBuilder::new(&c).unwrap();
        let ingress = builder
            .build_ingress(&["a.example.org".to_string(), "b.example.org".to_string()])
            .unwrap();

        let rules = ingress.spec.unwrap().rules.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].host.as_deref(), Some("a.example.org"));
    }

    #[test]
    fn test_ingress_skipped_without_hosts() {
        let c = controller();
        let builder = WorkloadBuilder::new(&c).unwrap();
        assert!(builder.build_ingress(&[]).is_none());
    }

    #[test]
    fn test_backend_deployment_uses_backend_image() {
        let c = controller();
        let builder = WorkloadBuilder::new(&c).unwrap();
        let backend = BackendRef {
            kind: "LoomApp".to_string(),
            name: "shop".to_string(),
            namespace: "tenant-a".to_string(),
            image: "registry.example.org/shop-backend:2".to_string(),
        };

        let deployment = builder.build_backend_deployment(&backend);
        assert_eq!(
            deployment.metadata.name.as_deref(),
            Some("loom-backend-shop")
        );
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("registry.example.org/shop-backend:2")
        );
    }
}
