use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonwebtoken::EncodingKey;

use crate::config::Config;
use crate::database::{Database, NodeWrite};
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorResult, ServiceHandle, ServiceSpec, Workload};
use berth_core::auth::SessionClaims;
use berth_core::models::{Application, DataSource, DataSourceKind, DataSourceNode, DataSourceSpec, NodeRole};

/// A call observed by the fake orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestratorCall {
    Create(ServiceSpec),
    Update(ServiceSpec),
    Remove(String),
}

/// A failure to inject into the next matching orchestrator call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Fatal,
    Conflict,
    /// Stall the call well past any reasonable timeout.
    Hang,
}

/// The kind of orchestrator call a failure applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    Inspect,
    Create,
    Update,
    Remove,
}

/// An in-memory orchestrator which records every mutating call.
#[derive(Default)]
pub struct FakeOrchestrator {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    services: HashMap<String, (ServiceSpec, u64)>,
    calls: Vec<OrchestratorCall>,
    failures: HashMap<CallKind, VecDeque<Failure>>,
}

impl FakeOrchestrator {
    /// All mutating calls observed so far.
    pub fn calls(&self) -> Vec<OrchestratorCall> {
        self.lock().calls.clone()
    }

    /// The current spec of the given service, if it exists.
    pub fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.lock().services.get(name).map(|(spec, _)| spec.clone())
    }

    /// Queue a failure for the next call of the given kind.
    pub fn fail_next(&self, kind: CallKind, failure: Failure) {
        self.lock().failures.entry(kind).or_default().push_back(failure);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn maybe_fail(&self, kind: CallKind, name: &str) -> OrchestratorResult<()> {
        let failure = self.lock().failures.get_mut(&kind).and_then(|queue| queue.pop_front());
        match failure {
            None => Ok(()),
            Some(Failure::Transient) => Err(OrchestratorError::Transient(anyhow!("injected transient failure"))),
            Some(Failure::Fatal) => Err(OrchestratorError::Fatal(anyhow!("injected fatal failure"))),
            Some(Failure::Conflict) => Err(OrchestratorError::Conflict(name.into())),
            Some(Failure::Hang) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn inspect_service(&self, name: &str, _workload: Workload) -> OrchestratorResult<Option<ServiceHandle>> {
        self.maybe_fail(CallKind::Inspect, name).await?;
        Ok(self.lock().services.get(name).map(|(spec, version)| handle(spec, *version)))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<ServiceHandle> {
        self.maybe_fail(CallKind::Create, &spec.name).await?;
        let mut state = self.lock();
        if state.services.contains_key(&spec.name) {
            return Err(OrchestratorError::Conflict(spec.name.clone()));
        }
        state.calls.push(OrchestratorCall::Create(spec.clone()));
        state.services.insert(spec.name.clone(), (spec.clone(), 1));
        Ok(handle(spec, 1))
    }

    async fn update_service(&self, spec: &ServiceSpec, current: &ServiceHandle) -> OrchestratorResult<ServiceHandle> {
        self.maybe_fail(CallKind::Update, &spec.name).await?;
        let mut state = self.lock();
        let version = match state.services.get(&spec.name) {
            Some((_, version)) => *version,
            None => return Err(OrchestratorError::NotFound(spec.name.clone())),
        };
        if current.resource_version.as_deref() != Some(version.to_string().as_str()) {
            return Err(OrchestratorError::Conflict(spec.name.clone()));
        }
        state.calls.push(OrchestratorCall::Update(spec.clone()));
        state.services.insert(spec.name.clone(), (spec.clone(), version + 1));
        Ok(handle(spec, version + 1))
    }

    async fn remove_service(&self, name: &str, _workload: Workload) -> OrchestratorResult<()> {
        self.maybe_fail(CallKind::Remove, name).await?;
        let mut state = self.lock();
        state.calls.push(OrchestratorCall::Remove(name.into()));
        match state.services.remove(name) {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::NotFound(name.into())),
        }
    }
}

fn handle(spec: &ServiceSpec, version: u64) -> ServiceHandle {
    ServiceHandle {
        name: spec.name.clone(),
        resource_version: Some(version.to_string()),
        replicas: spec.replicas,
        image: Some(spec.image.clone()),
    }
}

/// Setup a redis data source with the given nodes, the first of which is the master.
///
/// Returns the stored data source & nodes.
pub async fn setup_data_source(db: &Database, name: &str, owner: &str, hosts: &[&str]) -> Result<(DataSource, Vec<DataSourceNode>)> {
    let spec = DataSourceSpec {
        name: name.into(),
        kind: DataSourceKind::Redis.to_string(),
        instances: Some(hosts.len().max(1) as i64),
    };
    let ds = DataSource::from_spec(spec, owner)?;
    db.insert_data_source(&ds).await?;
    if hosts.is_empty() {
        return Ok((ds, vec![]));
    }
    let writes: Vec<NodeWrite> = hosts
        .iter()
        .enumerate()
        .map(|(idx, host)| {
            let role = if idx == 0 { NodeRole::Master } else { NodeRole::Replica };
            NodeWrite::Create(DataSourceNode::new(name, host, role, Some(hosts[0])))
        })
        .collect();
    db.commit_cluster_writes(&ds, &writes).await
}

/// Setup an application owned by the given account.
pub async fn setup_app(db: &Database, name: &str, owner: &str, version: &str) -> Result<Application> {
    let app = Application::new(name, owner, version);
    db.put_app(&app).await?;
    Ok(app)
}

/// Mint a session token for the given account.
pub fn session_token(config: &Config, account: &str) -> Result<String> {
    Ok(SessionClaims::new(account).encode(&EncodingKey::from_secret(config.session_secret.as_bytes()))?)
}
