use futures_util::StreamExt;
use pkg_constants::controller::{
    DEFAULT_CONCURRENT_RECONCILES, DEFAULT_RESYNC_INTERVAL_SECS, MAX_REVISION_NAME_COLLISIONS,
    POOL_UPDATE_RETRIES, SLOW_START_INITIAL_BATCH_SIZE, STATUS_UPDATE_RETRIES,
};
use pkg_state::Client;
use pkg_types::condition::{Condition, ConditionStatus, remove_condition, set_condition};
use pkg_types::config::ControllerConfigFile;
use pkg_types::event::EventType;
use pkg_types::meta::Resource;
use pkg_types::united::{
    TemplateType, UnitedDeployment, UnitedDeploymentConditionType, UnitedDeploymentStatus,
};
use pkg_types::validate::validate_topology;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::{DeploymentAdapter, StatefulSetAdapter, WorkloadAdapter};
use crate::events::{EventRecorder, REVISION_PROVISION, TEMPLATE_CONTROLLER, failed};
use crate::pool::Pool;
use crate::pool_control::{PoolCleaner, PoolControl};
use crate::provision::{PoolManager, PoolTarget, next_pool_targets};
use crate::revision::{RevisionManager, Revisions};

/// Tunables of [`UnitedDeploymentController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub resync_interval: Duration,
    pub concurrent_reconciles: usize,
    pub max_revision_name_collisions: u32,
    pub update_retries: usize,
    pub initial_batch_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            concurrent_reconciles: DEFAULT_CONCURRENT_RECONCILES,
            max_revision_name_collisions: MAX_REVISION_NAME_COLLISIONS,
            update_retries: POOL_UPDATE_RETRIES,
            initial_batch_size: SLOW_START_INITIAL_BATCH_SIZE,
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by whatever the file sets.
    pub fn from_file(file: &ControllerConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            resync_interval: file
                .resync_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.resync_interval),
            concurrent_reconciles: file
                .concurrent_reconciles
                .unwrap_or(defaults.concurrent_reconciles)
                .max(1),
            max_revision_name_collisions: file
                .max_revision_name_collisions
                .unwrap_or(defaults.max_revision_name_collisions),
            update_retries: file.update_retries.unwrap_or(defaults.update_retries),
            initial_batch_size: file
                .initial_batch_size
                .unwrap_or(defaults.initial_batch_size),
        }
    }
}

/// Controller that reconciles UnitedDeployments into one workload per pool.
/// Each pass resolves the template revision, converges the pool set and
/// writes the observed state back into the resource's status.
pub struct UnitedDeploymentController {
    client: Client,
    recorder: Arc<dyn EventRecorder>,
    revisions: RevisionManager,
    deployments: PoolControl<DeploymentAdapter>,
    statefulsets: PoolControl<StatefulSetAdapter>,
    config: ControllerConfig,
}

impl UnitedDeploymentController {
    pub fn new(client: Client, recorder: Arc<dyn EventRecorder>, config: ControllerConfig) -> Self {
        Self {
            revisions: RevisionManager::new(client.clone())
                .with_max_collisions(config.max_revision_name_collisions),
            deployments: PoolControl::new(client.clone(), DeploymentAdapter)
                .with_update_retries(config.update_retries),
            statefulsets: PoolControl::new(client.clone(), StatefulSetAdapter::new(client.clone()))
                .with_update_retries(config.update_retries),
            client,
            recorder,
            config,
        }
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "UnitedDeploymentController started (interval={}s, workers={})",
                self.config.resync_interval.as_secs(),
                self.config.concurrent_reconciles
            );
            let mut interval = tokio::time::interval(self.config.resync_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile_all().await {
                    warn!("UnitedDeploymentController reconcile error: {}", e);
                }
            }
        })
    }

    /// Reconcile every UnitedDeployment once. Errors of single resources
    /// are logged and do not stop the others.
    pub async fn reconcile_all(&self) -> anyhow::Result<()> {
        let all: Vec<UnitedDeployment> = self.client.list(None).await?;
        debug!("UnitedDeploymentController: {} resources to reconcile", all.len());
        futures_util::stream::iter(all)
            .for_each_concurrent(self.config.concurrent_reconciles, |ud| async move {
                let key = ud.metadata.key();
                if let Err(e) = self.reconcile(&ud.metadata.namespace, &ud.metadata.name).await {
                    warn!("UnitedDeployment {}: reconcile failed: {:#}", key, e);
                }
            })
            .await;
        Ok(())
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let ud: UnitedDeployment = match self.client.get(namespace, name).await {
            Ok(ud) => ud,
            Err(e) if e.is_not_found() => {
                debug!("UnitedDeployment {}/{} is gone", namespace, name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if ud.metadata.is_deleting() {
            debug!("UnitedDeployment {} is being deleted", ud.metadata.key());
            return Ok(());
        }

        validate_topology(&ud)?;
        let template_type = self.check_template(&ud)?;

        let mut status = ud.status.clone();
        let outcome = self.revisions.reconcile_revisions(&ud).await;
        status.collision_count = Some(outcome.collision_count);
        let revisions = match outcome.result {
            Ok(revisions) => revisions,
            Err(e) => {
                self.recorder.record(
                    &ud.object_reference(),
                    EventType::Warning,
                    &failed(REVISION_PROVISION),
                    &format!("Fail to construct revisions: {}", e),
                );
                if let Err(status_err) = self.update_status(&ud, status).await {
                    warn!(
                        "UnitedDeployment {}: failed to persist collision count: {}",
                        ud.metadata.key(),
                        status_err
                    );
                }
                return Err(e.context("fail to construct controller revisions"));
            }
        };
        debug!(
            "UnitedDeployment {}: current revision {}, update revision {}",
            ud.metadata.key(),
            revisions.current.metadata.name,
            revisions.update.metadata.name
        );

        let targets = next_pool_targets(&ud);
        let result = match template_type {
            TemplateType::Deployment => {
                self.manage(&self.deployments, &ud, &revisions, &targets, &mut status)
                    .await
            }
            TemplateType::StatefulSet => {
                self.manage(&self.statefulsets, &ud, &revisions, &targets, &mut status)
                    .await
            }
        };
        status.template_type = Some(template_type);

        self.update_status(&ud, status).await?;
        result
    }

    /// Exactly one workload template must be set. Anything else is a
    /// configuration error that no retry will fix.
    fn check_template(&self, ud: &UnitedDeployment) -> anyhow::Result<TemplateType> {
        let template = &ud.spec.workload_template;
        let problem = match (&template.deployment_template, &template.stateful_set_template) {
            (None, None) => "no workload template is set",
            (Some(_), Some(_)) => "both deploymentTemplate and statefulSetTemplate are set",
            _ => "",
        };
        match template.template_type() {
            Some(template_type) if problem.is_empty() => Ok(template_type),
            _ => {
                self.recorder.record(
                    &ud.object_reference(),
                    EventType::Warning,
                    &failed(TEMPLATE_CONTROLLER),
                    &format!("Fail to get template controller: {}", problem),
                );
                anyhow::bail!("UnitedDeployment {}: {}", ud.metadata.key(), problem)
            }
        }
    }

    fn cleaners(&self) -> Vec<&dyn PoolCleaner> {
        vec![&self.deployments as &dyn PoolCleaner, &self.statefulsets]
    }

    /// Converge the pools of the template's kind and fold the result into
    /// `status`. The status is filled in even when the pass failed.
    async fn manage<A: WorkloadAdapter>(
        &self,
        control: &PoolControl<A>,
        ud: &UnitedDeployment,
        revisions: &Revisions,
        targets: &BTreeMap<String, PoolTarget>,
        status: &mut UnitedDeploymentStatus,
    ) -> anyhow::Result<()> {
        let manager = PoolManager::new(
            control,
            self.cleaners(),
            self.recorder.as_ref(),
            self.config.initial_batch_size,
        );
        let name_to_pool = manager.name_to_pool(ud).await?;
        let update_revision = &revisions.update.metadata.name;
        let result = manager
            .manage_pools(ud, &name_to_pool, targets, update_revision, status)
            .await;

        calculate_status(
            status,
            ud,
            &name_to_pool,
            control,
            targets,
            if result.is_ok() {
                update_revision
            } else {
                &revisions.current.metadata.name
            },
        );
        result
    }

    /// Write `status` back when it differs from what is stored, retrying
    /// on write conflicts with a fresh copy.
    async fn update_status(
        &self,
        ud: &UnitedDeployment,
        status: UnitedDeploymentStatus,
    ) -> anyhow::Result<()> {
        if ud.status == status {
            return Ok(());
        }
        let mut object = ud.clone();
        for attempt in 1..=STATUS_UPDATE_RETRIES {
            object.status = status.clone();
            match self.client.update(&object).await {
                Ok(_) => {
                    debug!(
                        "UnitedDeployment {}: status updated (replicas {}, ready {})",
                        ud.metadata.key(),
                        status.replicas,
                        status.ready_replicas
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < STATUS_UPDATE_RETRIES => {
                    debug!(
                        "UnitedDeployment {}: status update conflict (attempt {}/{})",
                        ud.metadata.key(),
                        attempt,
                        STATUS_UPDATE_RETRIES
                    );
                    object = self.client.get(&ud.metadata.namespace, &ud.metadata.name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!(
            "UnitedDeployment {}: status not written after {} attempts",
            ud.metadata.key(),
            STATUS_UPDATE_RETRIES
        )
    }
}

fn calculate_status<A: WorkloadAdapter>(
    status: &mut UnitedDeploymentStatus,
    ud: &UnitedDeployment,
    name_to_pool: &BTreeMap<String, Pool<A::Object>>,
    control: &PoolControl<A>,
    targets: &BTreeMap<String, PoolTarget>,
    current_revision: &str,
) {
    let live = name_to_pool
        .iter()
        .filter(|(name, _)| targets.contains_key(*name))
        .map(|(_, pool)| pool);

    status.replicas = 0;
    status.ready_replicas = 0;
    let mut failure = None;
    for pool in live {
        let info = pool.status.replicas_info;
        status.replicas = status.replicas.saturating_add(info.replicas);
        status.ready_replicas = status.ready_replicas.saturating_add(info.ready_replicas);
        if failure.is_none() {
            failure = control
                .pool_failure(pool)
                .map(|message| format!("Pool {}: {}", pool.name, message));
        }
    }

    status.pool_replicas = targets
        .iter()
        .map(|(name, target)| (name.clone(), target.replicas))
        .collect();
    status.observed_generation = ud.metadata.generation;
    status.current_revision = current_revision.to_string();

    match failure {
        Some(message) => set_condition(
            &mut status.conditions,
            Condition::new(
                UnitedDeploymentConditionType::PoolFailure,
                ConditionStatus::True,
                "Error",
                &message,
            ),
        ),
        None => remove_condition(
            &mut status.conditions,
            &UnitedDeploymentConditionType::PoolFailure,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryRecorder;
    use crate::testing::{self, FaultyBackend, Op};
    use pkg_constants::labels::REVISION_HASH_LABEL;
    use pkg_types::condition::get_condition;
    use pkg_types::deployment::{Deployment, DeploymentConditionType};
    use pkg_types::revision::ControllerRevision;
    use pkg_types::statefulset::StatefulSet;

    struct Fixture {
        backend: FaultyBackend,
        client: Client,
        recorder: MemoryRecorder,
        controller: UnitedDeploymentController,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(ControllerConfig::default())
        }

        fn with_config(config: ControllerConfig) -> Self {
            let backend = FaultyBackend::new();
            let client = backend.client();
            let recorder = MemoryRecorder::new();
            let controller =
                UnitedDeploymentController::new(client.clone(), Arc::new(recorder.clone()), config);
            Self {
                backend,
                client,
                recorder,
                controller,
            }
        }

        async fn reconcile(&self, ud: &UnitedDeployment) -> anyhow::Result<()> {
            self.controller
                .reconcile(&ud.metadata.namespace, &ud.metadata.name)
                .await
        }

        async fn fetch(&self, ud: &UnitedDeployment) -> UnitedDeployment {
            self.client
                .get(&ud.metadata.namespace, &ud.metadata.name)
                .await
                .unwrap()
        }

        async fn deployments(&self) -> Vec<Deployment> {
            let mut all: Vec<Deployment> = self.client.list(Some("default")).await.unwrap();
            all.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            all
        }
    }

    fn condition_status(
        ud: &UnitedDeployment,
        type_: UnitedDeploymentConditionType,
    ) -> Option<ConditionStatus> {
        get_condition(&ud.status.conditions, &type_).map(|c| c.status)
    }

    #[test]
    fn config_file_overrides_defaults() {
        let file = ControllerConfigFile {
            resync_interval_secs: Some(3),
            update_retries: Some(2),
            concurrent_reconciles: Some(0),
            ..Default::default()
        };
        let config = ControllerConfig::from_file(&file);
        assert_eq!(config.resync_interval, Duration::from_secs(3));
        assert_eq!(config.update_retries, 2);
        assert_eq!(config.concurrent_reconciles, 1);
        assert_eq!(config.max_revision_name_collisions, MAX_REVISION_NAME_COLLISIONS);
        assert_eq!(config.initial_batch_size, SLOW_START_INITIAL_BATCH_SIZE);
    }

    #[tokio::test]
    async fn first_pass_provisions_pools_and_status() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;

        fx.reconcile(&ud).await.unwrap();

        let deployments = fx.deployments().await;
        assert_eq!(deployments.len(), 2);
        let revisions: Vec<ControllerRevision> = fx.client.list(Some("default")).await.unwrap();
        assert_eq!(revisions.len(), 1);
        let revision = &revisions[0].metadata.name;
        for d in &deployments {
            assert_eq!(d.metadata.labels.get(REVISION_HASH_LABEL), Some(revision));
        }

        let ud = fx.fetch(&ud).await;
        assert_eq!(&ud.status.current_revision, revision);
        assert_eq!(ud.status.template_type, Some(TemplateType::Deployment));
        assert_eq!(ud.status.collision_count, Some(0));
        assert_eq!(ud.status.observed_generation, ud.metadata.generation);
        assert_eq!(
            ud.status.pool_replicas,
            BTreeMap::from([("beijing".to_string(), 1), ("hangzhou".to_string(), 2)])
        );
        // Pools created in this pass are counted from the next one on.
        assert_eq!(ud.status.replicas, 0);
        assert_eq!(
            condition_status(&ud, UnitedDeploymentConditionType::PoolProvisioned),
            Some(ConditionStatus::True)
        );
        assert_eq!(
            condition_status(&ud, UnitedDeploymentConditionType::PoolUpdated),
            Some(ConditionStatus::True)
        );
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.reconcile(&ud).await.unwrap();
        fx.reconcile(&ud).await.unwrap();
        let settled = fx.fetch(&ud).await;
        let versions: Vec<u64> = fx
            .deployments()
            .await
            .iter()
            .map(|d| d.metadata.resource_version)
            .collect();

        fx.reconcile(&ud).await.unwrap();

        assert_eq!(fx.fetch(&ud).await.metadata.resource_version, settled.metadata.resource_version);
        let again: Vec<u64> = fx
            .deployments()
            .await
            .iter()
            .map(|d| d.metadata.resource_version)
            .collect();
        assert_eq!(versions, again);
        assert_eq!(settled.status.replicas, 3);
        assert_eq!(fx.recorder.reasons(), vec!["SuccessfulPoolsUpdate"]);
    }

    #[tokio::test]
    async fn scaling_a_pool_updates_only_that_pool() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.reconcile(&ud).await.unwrap();

        let mut ud = fx.fetch(&ud).await;
        ud.spec.topology.pools[1].replicas = Some(5);
        fx.client.update(&ud).await.unwrap();
        fx.reconcile(&ud).await.unwrap();

        let mut replicas: Vec<Option<u32>> = fx
            .deployments()
            .await
            .iter()
            .map(|d| d.spec.replicas)
            .collect();
        replicas.sort();
        assert_eq!(replicas, vec![Some(1), Some(5)]);
        assert_eq!(fx.fetch(&ud).await.status.pool_replicas["hangzhou"], 5);
    }

    #[tokio::test]
    async fn template_change_rolls_pools_to_new_revision() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.reconcile(&ud).await.unwrap();
        let first = fx.fetch(&ud).await.status.current_revision;

        let mut ud = fx.fetch(&ud).await;
        if let Some(t) = ud.spec.workload_template.deployment_template.as_mut() {
            t.spec.template.spec.containers[0].image = "nginx:1.28".to_string();
        }
        fx.client.update(&ud).await.unwrap();
        fx.reconcile(&ud).await.unwrap();

        let ud = fx.fetch(&ud).await;
        assert_ne!(ud.status.current_revision, first);
        for d in fx.deployments().await {
            assert_eq!(d.spec.template.spec.containers[0].image, "nginx:1.28");
            assert_eq!(
                d.metadata.labels.get(REVISION_HASH_LABEL),
                Some(&ud.status.current_revision)
            );
        }
    }

    #[tokio::test]
    async fn switching_template_kind_replaces_workloads() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.reconcile(&ud).await.unwrap();

        let mut ud = fx.fetch(&ud).await;
        ud.spec.workload_template = testing::statefulset_united("web").spec.workload_template;
        fx.client.update(&ud).await.unwrap();
        fx.reconcile(&ud).await.unwrap();

        assert!(fx.deployments().await.is_empty());
        let sets: Vec<StatefulSet> = fx.client.list(Some("default")).await.unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(
            fx.fetch(&ud).await.status.template_type,
            Some(TemplateType::StatefulSet)
        );
    }

    #[tokio::test]
    async fn missing_template_is_reported() {
        let fx = Fixture::new();
        let mut ud = testing::deployment_united("web");
        ud.spec.workload_template.deployment_template = None;
        let ud = testing::create_united(&fx.client, ud).await;

        assert!(fx.reconcile(&ud).await.is_err());
        assert_eq!(fx.recorder.reasons(), vec!["FailedTemplateController"]);
        assert!(fx.deployments().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_topology_is_rejected() {
        let fx = Fixture::new();
        let mut ud = testing::deployment_united("web");
        ud.spec.topology.pools[1].name = "beijing".to_string();
        let ud = testing::create_united(&fx.client, ud).await;

        let err = fx.reconcile(&ud).await.unwrap_err();
        assert!(err.to_string().contains("duplicated pool name"));
    }

    #[tokio::test]
    async fn missing_resource_is_not_an_error() {
        let fx = Fixture::new();
        fx.controller.reconcile("default", "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn revision_failure_still_persists_status() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.backend
            .fail(Op::Create, "ControllerRevision", usize::MAX, testing::backend_down);

        assert!(fx.reconcile(&ud).await.is_err());
        assert_eq!(fx.recorder.reasons(), vec!["FailedRevisionProvision"]);
        assert_eq!(fx.fetch(&ud).await.status.collision_count, Some(0));
        assert!(fx.deployments().await.is_empty());
    }

    #[tokio::test]
    async fn failed_update_keeps_current_revision() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.reconcile(&ud).await.unwrap();
        let first = fx.fetch(&ud).await.status.current_revision;

        let mut ud = fx.fetch(&ud).await;
        if let Some(t) = ud.spec.workload_template.deployment_template.as_mut() {
            t.spec.template.spec.containers[0].image = "nginx:1.28".to_string();
        }
        fx.client.update(&ud).await.unwrap();
        fx.backend
            .fail(Op::Update, "Deployment", usize::MAX, testing::conflict);

        assert!(fx.reconcile(&ud).await.is_err());
        let ud = fx.fetch(&ud).await;
        assert_eq!(ud.status.current_revision, first);
        assert_eq!(
            condition_status(&ud, UnitedDeploymentConditionType::PoolUpdated),
            Some(ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn pool_failure_condition_follows_workloads() {
        let fx = Fixture::new();
        let ud = testing::create_united(&fx.client, testing::deployment_united("web")).await;
        fx.reconcile(&ud).await.unwrap();

        let mut failing = fx.deployments().await.remove(0);
        failing.status.conditions.push(Condition::new(
            DeploymentConditionType::ReplicaFailure,
            ConditionStatus::True,
            "FailedCreate",
            "quota exceeded",
        ));
        fx.client.update(&failing).await.unwrap();
        fx.reconcile(&ud).await.unwrap();

        let stored = fx.fetch(&ud).await;
        let failure = get_condition(
            &stored.status.conditions,
            &UnitedDeploymentConditionType::PoolFailure,
        )
        .unwrap();
        assert!(failure.message.contains("quota exceeded"));

        failing = fx.deployments().await.remove(0);
        failing.status.conditions.clear();
        fx.client.update(&failing).await.unwrap();
        fx.reconcile(&ud).await.unwrap();
        assert!(condition_status(
            &fx.fetch(&ud).await,
            UnitedDeploymentConditionType::PoolFailure
        )
        .is_none());
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_resource() {
        let fx = Fixture::with_config(ControllerConfig {
            concurrent_reconciles: 2,
            ..Default::default()
        });
        for name in ["web", "api", "db"] {
            testing::create_united(&fx.client, testing::deployment_united(name)).await;
        }

        fx.controller.reconcile_all().await.unwrap();
        assert_eq!(fx.deployments().await.len(), 6);
    }

    #[test]
    fn replica_sums_saturate() {
        use crate::pool::{PoolStatus, ReplicasInfo};

        let ud = testing::deployment_united("web");
        let control = PoolControl::new(testing::client(), DeploymentAdapter);
        let mut name_to_pool = BTreeMap::new();
        let mut targets = BTreeMap::new();
        for (name, replicas) in [("beijing", u32::MAX), ("hangzhou", 3)] {
            name_to_pool.insert(
                name.to_string(),
                Pool {
                    name: name.to_string(),
                    namespace: "default".to_string(),
                    pool_ref: Deployment::default(),
                    status: PoolStatus {
                        replicas_info: ReplicasInfo {
                            replicas,
                            ready_replicas: replicas,
                        },
                        ..Default::default()
                    },
                },
            );
            targets.insert(name.to_string(), PoolTarget::default());
        }

        let mut status = UnitedDeploymentStatus::default();
        calculate_status(&mut status, &ud, &name_to_pool, &control, &targets, "rev");
        assert_eq!(status.replicas, u32::MAX);
        assert_eq!(status.ready_replicas, u32::MAX);
    }
}
