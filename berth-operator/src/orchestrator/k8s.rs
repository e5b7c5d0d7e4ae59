//! An orchestrator backed by a Kubernetes cluster.
//!
//! Data sources run as StatefulSets, applications run as Deployments. Each service is paired with
//! a headless Service object of the same name, giving its replicas a stable DNS name within the
//! namespace.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::client::Client;
use kube::Resource;

use crate::config::Config;
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult, ServiceHandle, ServiceSpec, Workload};

/// The pod container name of a Berth service.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME: &str = "service";
/// The canonical Berth label identifying a service.
const LABEL_BERTH_RS_SERVICE: &str = "berth.rs/service";

/// An orchestrator which runs services as Kubernetes workloads.
pub struct KubeOrchestrator {
    /// K8s client.
    client: Client,
    /// The namespace in which all services live.
    namespace: String,
}

impl KubeOrchestrator {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
        }
    }

    /// Await the given API call, mapping its errors.
    ///
    /// Callers bound each orchestrator call with their own timeout.
    async fn call<T, F>(&self, name: &str, fut: F) -> OrchestratorResult<T>
    where
        F: Future<Output = kube::Result<T>> + Send,
    {
        fut.await.map_err(|err| map_kube_error(name, err))
    }

    /// Ensure the headless Service object fronting the given service exists.
    async fn ensure_network_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let service = build_network_service(&self.namespace, spec);
        match self.call(&spec.name, api.create(&PostParams::default(), &service)).await {
            Ok(_) | Err(OrchestratorError::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn inspect_service(&self, name: &str, workload: Workload) -> OrchestratorResult<Option<ServiceHandle>> {
        match workload {
            Workload::Stateful => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
                let sts = self.call(name, api.get_opt(name)).await?;
                Ok(sts.as_ref().map(statefulset_handle))
            }
            Workload::Stateless => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                let deployment = self.call(name, api.get_opt(name)).await?;
                Ok(deployment.as_ref().map(deployment_handle))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, spec), fields(name = %spec.name))]
    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<ServiceHandle> {
        tracing::info!(name = %spec.name, workload = ?spec.workload, "creating service");
        self.ensure_network_service(spec).await?;
        let params = PostParams::default();
        match spec.workload {
            Workload::Stateful => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
                let sts = build_statefulset(&self.namespace, spec)?;
                let sts = self.call(&spec.name, api.create(&params, &sts)).await?;
                Ok(statefulset_handle(&sts))
            }
            Workload::Stateless => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                let deployment = build_deployment(&self.namespace, spec)?;
                let deployment = self.call(&spec.name, api.create(&params, &deployment)).await?;
                Ok(deployment_handle(&deployment))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, spec, current), fields(name = %spec.name))]
    async fn update_service(&self, spec: &ServiceSpec, current: &ServiceHandle) -> OrchestratorResult<ServiceHandle> {
        tracing::info!(name = %spec.name, replicas = spec.replicas, image = %spec.image, "updating service");
        // The API server rejects the replacement if the given resource version is stale.
        let params = PostParams::default();
        match spec.workload {
            Workload::Stateful => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
                let mut sts = build_statefulset(&self.namespace, spec)?;
                sts.metadata.resource_version = current.resource_version.clone();
                let sts = self.call(&spec.name, api.replace(&spec.name, &params, &sts)).await?;
                Ok(statefulset_handle(&sts))
            }
            Workload::Stateless => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                let mut deployment = build_deployment(&self.namespace, spec)?;
                deployment.metadata.resource_version = current.resource_version.clone();
                let deployment = self.call(&spec.name, api.replace(&spec.name, &params, &deployment)).await?;
                Ok(deployment_handle(&deployment))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn remove_service(&self, name: &str, workload: Workload) -> OrchestratorResult<()> {
        tracing::info!(name, "removing service");
        let params = DeleteParams::default();
        let res = match workload {
            Workload::Stateful => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
                self.call(name, api.delete(name, &params)).await.map(|_| ())
            }
            Workload::Stateless => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                self.call(name, api.delete(name, &params)).await.map(|_| ())
            }
        };

        // The network service is removed even when the workload is already gone.
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        match self.call(name, services.delete(name, &params)).await {
            Ok(_) | Err(OrchestratorError::NotFound(_)) => (),
            Err(err) => return Err(err),
        }
        res
    }
}

pub(crate) fn build_network_service(namespace: &str, spec: &ServiceSpec) -> Service {
    let mut service = Service::default();
    let labels = service.meta_mut().labels.get_or_insert_with(Default::default);
    set_cannonical_labels(labels);
    labels.insert(LABEL_BERTH_RS_SERVICE.into(), spec.name.clone());
    service.meta_mut().namespace = Some(namespace.into());
    service.meta_mut().name = spec.name.clone().into();

    let svc_spec = service.spec.get_or_insert_with(Default::default);
    let selector = svc_spec.selector.get_or_insert_with(Default::default);
    set_cannonical_labels(selector);
    selector.insert(LABEL_BERTH_RS_SERVICE.into(), spec.name.clone());
    svc_spec.cluster_ip = Some("None".into());
    svc_spec.type_ = Some("ClusterIP".into());
    service
}

/// Build the labels, metadata & pod template shared by all workloads.
fn build_workload_parts(namespace: &str, spec: &ServiceSpec) -> (ObjectMeta, LabelSelector, PodTemplateSpec) {
    let mut labels = spec.labels.clone();
    set_cannonical_labels(&mut labels);
    labels.insert(LABEL_BERTH_RS_SERVICE.into(), spec.name.clone());
    let meta = ObjectMeta {
        name: Some(spec.name.clone()),
        namespace: Some(namespace.into()),
        labels: Some(labels.clone()),
        ..Default::default()
    };

    let mut selector_labels = BTreeMap::new();
    set_cannonical_labels(&mut selector_labels);
    selector_labels.insert(LABEL_BERTH_RS_SERVICE.into(), spec.name.clone());
    let selector = LabelSelector {
        match_labels: Some(selector_labels),
        ..Default::default()
    };

    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
        spec: Some(PodSpec {
            termination_grace_period_seconds: Some(30),
            containers: vec![Container {
                name: CONTAINER_NAME.into(),
                image: Some(spec.image.clone()),
                image_pull_policy: Some("Always".into()),
                env: Some(env),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };
    (meta, selector, template)
}

pub(crate) fn build_statefulset(namespace: &str, spec: &ServiceSpec) -> OrchestratorResult<StatefulSet> {
    tracing::debug!(name = %spec.name, "building statefulset for service");
    let (metadata, selector, template) = build_workload_parts(namespace, spec);
    let mut sts = StatefulSet { metadata, ..Default::default() };
    let sts_spec = sts.spec.get_or_insert_with(Default::default);
    sts_spec.update_strategy = Some(StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".into()),
        rolling_update: None,
    });
    sts_spec.service_name = spec.name.clone();
    sts_spec.replicas = Some(replica_count(spec)?);
    sts_spec.selector = selector;
    sts_spec.template = template;
    Ok(sts)
}

pub(crate) fn build_deployment(namespace: &str, spec: &ServiceSpec) -> OrchestratorResult<Deployment> {
    tracing::debug!(name = %spec.name, "building deployment for service");
    let (metadata, selector, template) = build_workload_parts(namespace, spec);
    let mut deployment = Deployment { metadata, ..Default::default() };
    let deploy_spec = deployment.spec.get_or_insert_with(Default::default);
    deploy_spec.replicas = Some(replica_count(spec)?);
    deploy_spec.selector = selector;
    deploy_spec.template = template;
    Ok(deployment)
}

/// The replica count of the given spec as the API server expects it.
fn replica_count(spec: &ServiceSpec) -> OrchestratorResult<i32> {
    i32::try_from(spec.replicas)
        .map_err(|_| OrchestratorError::Fatal(anyhow::anyhow!("service {} requests {} replicas, more than the API server accepts", spec.name, spec.replicas)))
}

/// Map a K8s client error into an orchestrator error.
pub(crate) fn map_kube_error(name: &str, err: kube::Error) -> OrchestratorError {
    let code = match &err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    };
    match code {
        Some(404) => OrchestratorError::NotFound(name.into()),
        Some(409) => OrchestratorError::Conflict(name.into()),
        Some(code) if code == 429 || code >= 500 => OrchestratorError::Transient(anyhow::Error::from(err)),
        Some(_) => OrchestratorError::Fatal(anyhow::Error::from(err)),
        // Transport level errors.
        None => OrchestratorError::Transient(anyhow::Error::from(err)),
    }
}

fn statefulset_handle(sts: &StatefulSet) -> ServiceHandle {
    let spec = sts.spec.as_ref();
    ServiceHandle {
        name: sts.metadata.name.clone().unwrap_or_default(),
        resource_version: sts.metadata.resource_version.clone(),
        replicas: spec.and_then(|spec| spec.replicas).unwrap_or(0).max(0) as u32,
        image: spec.and_then(|spec| template_image(&spec.template)),
    }
}

fn deployment_handle(deployment: &Deployment) -> ServiceHandle {
    let spec = deployment.spec.as_ref();
    ServiceHandle {
        name: deployment.metadata.name.clone().unwrap_or_default(),
        resource_version: deployment.metadata.resource_version.clone(),
        replicas: spec.and_then(|spec| spec.replicas).unwrap_or(0).max(0) as u32,
        image: spec.and_then(|spec| template_image(&spec.template)),
    }
}

fn template_image(template: &PodTemplateSpec) -> Option<String> {
    template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|container| container.name == CONTAINER_NAME)
        .and_then(|container| container.image.clone())
}

fn set_cannonical_labels(labels: &mut BTreeMap<String, String>) {
    labels.insert("app".into(), "berth".into());
    labels.insert("berth.rs/controlled-by".into(), "berth-operator".into());
}
