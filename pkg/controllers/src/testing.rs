//! Fixtures shared by the controller tests.

use async_trait::async_trait;
use pkg_state::{Client, ObjectBackend, PropagationPolicy, StateStore, StoreBackend, StoreError};
use pkg_types::deployment::DeploymentSpec;
use pkg_types::meta::{ObjectMeta, OwnerReference};
use pkg_types::pod::{ContainerSpec, PodSpec, PodTemplateSpec, TemplateMeta};
use pkg_types::registry::KindInfo;
use pkg_types::selector::LabelSelector;
use pkg_types::statefulset::StatefulSetSpec;
use pkg_types::united::{
    DeploymentTemplateSpec, PoolSpec, StatefulSetTemplateSpec, Topology, UnitedDeployment,
    UnitedDeploymentSpec, WorkloadTemplate,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn client() -> Client {
    Client::for_store(StateStore::in_memory())
}

pub fn owner_ref(uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps.udm.dev/v1alpha1".to_string(),
        kind: "UnitedDeployment".to_string(),
        name: format!("owner-{}", uid),
        uid: uid.to_string(),
        controller: true,
        block_owner_deletion: true,
    }
}

fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

fn pod_template(app: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: TemplateMeta {
            labels: app_labels(app),
            annotations: BTreeMap::new(),
        },
        spec: PodSpec {
            containers: vec![ContainerSpec {
                name: "nginx".to_string(),
                image: "nginx:1.27".to_string(),
                command: vec![],
                args: vec![],
                env: Default::default(),
                resources: Default::default(),
            }],
            ..Default::default()
        },
    }
}

fn pools() -> Vec<PoolSpec> {
    vec![
        PoolSpec {
            name: "beijing".to_string(),
            replicas: Some(1),
            ..Default::default()
        },
        PoolSpec {
            name: "hangzhou".to_string(),
            replicas: Some(2),
            ..Default::default()
        },
    ]
}

fn united(name: &str, workload_template: WorkloadTemplate) -> UnitedDeployment {
    UnitedDeployment {
        metadata: ObjectMeta::new("default", name),
        spec: UnitedDeploymentSpec {
            selector: LabelSelector::from_labels([("app", name)]),
            workload_template,
            topology: Topology { pools: pools() },
            revision_history_limit: None,
        },
        status: Default::default(),
    }
}

/// `name` running as Deployments in pools `beijing` (1) and `hangzhou` (2).
pub fn deployment_united(name: &str) -> UnitedDeployment {
    united(
        name,
        WorkloadTemplate {
            deployment_template: Some(DeploymentTemplateSpec {
                metadata: TemplateMeta {
                    labels: app_labels(name),
                    annotations: BTreeMap::new(),
                },
                spec: DeploymentSpec {
                    selector: LabelSelector::from_labels([("app", name)]),
                    template: pod_template(name),
                    ..Default::default()
                },
            }),
            stateful_set_template: None,
        },
    )
}

/// Same topology as [`deployment_united`], running as StatefulSets.
pub fn statefulset_united(name: &str) -> UnitedDeployment {
    united(
        name,
        WorkloadTemplate {
            deployment_template: None,
            stateful_set_template: Some(StatefulSetTemplateSpec {
                metadata: TemplateMeta {
                    labels: app_labels(name),
                    annotations: BTreeMap::new(),
                },
                spec: StatefulSetSpec {
                    selector: LabelSelector::from_labels([("app", name)]),
                    template: pod_template(name),
                    service_name: name.to_string(),
                    ..Default::default()
                },
            }),
        },
    )
}

pub async fn create_united(client: &Client, ud: UnitedDeployment) -> UnitedDeployment {
    client.create(&ud).await.unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Get,
    Create,
    Update,
    Delete,
}

struct Fault {
    op: Op,
    kind: &'static str,
    remaining: usize,
    error: fn(&str) -> StoreError,
}

pub fn timeout(_: &str) -> StoreError {
    StoreError::Timeout(Duration::from_secs(30))
}

pub fn backend_down(kind: &str) -> StoreError {
    StoreError::Backend(anyhow::anyhow!("{} backend unavailable", kind))
}

pub fn conflict(kind: &str) -> StoreError {
    StoreError::Conflict {
        kind: kind.to_string(),
        name: "injected".to_string(),
        stored: 0,
        given: 0,
    }
}

/// Object backend that fails chosen calls before reaching the store.
#[derive(Clone)]
pub struct FaultyBackend {
    inner: StoreBackend,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl FaultyBackend {
    pub fn new() -> Self {
        Self {
            inner: StoreBackend::new(StateStore::in_memory()),
            faults: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn client(&self) -> Client {
        Client::new(Arc::new(self.clone()))
    }

    /// Fail the next `times` calls of `op` on `kind` with `error`.
    pub fn fail(&self, op: Op, kind: &'static str, times: usize, error: fn(&str) -> StoreError) {
        self.faults.lock().unwrap().push(Fault {
            op,
            kind,
            remaining: times,
            error,
        });
    }

    pub fn clear(&self) {
        self.faults.lock().unwrap().clear();
    }

    fn check(&self, op: Op, kind: &KindInfo) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap();
        if let Some(fault) = faults
            .iter_mut()
            .find(|f| f.op == op && f.kind == kind.kind && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err((fault.error)(kind.kind));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for FaultyBackend {
    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        self.check(Op::List, kind)?;
        self.inner.list(kind, namespace).await
    }

    async fn get(&self, kind: &KindInfo, namespace: &str, name: &str) -> Result<Value, StoreError> {
        self.check(Op::Get, kind)?;
        self.inner.get(kind, namespace, name).await
    }

    async fn create(&self, kind: &KindInfo, object: Value) -> Result<Value, StoreError> {
        self.check(Op::Create, kind)?;
        self.inner.create(kind, object).await
    }

    async fn update(&self, kind: &KindInfo, object: Value) -> Result<Value, StoreError> {
        self.check(Op::Update, kind)?;
        self.inner.update(kind, object).await
    }

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), StoreError> {
        self.check(Op::Delete, kind)?;
        self.inner.delete(kind, namespace, name, propagation).await
    }
}
