//! Pool set reconciliation: diff the topology against live pools, then
//! create, update and delete until they agree.

use pkg_types::condition::{Condition, ConditionStatus, set_condition};
use pkg_types::event::EventType;
use pkg_types::meta::Resource;
use pkg_types::united::{UnitedDeployment, UnitedDeploymentConditionType, UnitedDeploymentStatus};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::adapter::WorkloadAdapter;
use crate::batch::{aggregate, slow_start_batch};
use crate::events::{
    DUP_POOLS_DELETE, EventRecorder, FIND_POOLS, POOLS_UPDATE, failed, successful,
};
use crate::pool::Pool;
use crate::pool_control::{PoolCleaner, PoolControl};

/// What one pool should look like after this pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolTarget {
    pub replicas: u32,
    pub patch: Option<String>,
}

/// Desired replicas and patch of every pool in the topology.
pub fn next_pool_targets(ud: &UnitedDeployment) -> BTreeMap<String, PoolTarget> {
    ud.spec
        .topology
        .pools
        .iter()
        .map(|pool| {
            (
                pool.name.clone(),
                PoolTarget {
                    replicas: pool.desired_replicas(),
                    patch: pool.patch_content(),
                },
            )
        })
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PoolDiff {
    pub to_create: Vec<String>,
    pub to_delete: Vec<String>,
    /// Expected and already live; candidates for an update.
    pub kept: BTreeSet<String>,
}

pub fn diff_pools(expected: &BTreeSet<String>, existing: &BTreeSet<String>) -> PoolDiff {
    PoolDiff {
        to_create: expected.difference(existing).cloned().collect(),
        to_delete: existing.difference(expected).cloned().collect(),
        kept: expected.intersection(existing).cloned().collect(),
    }
}

/// Result of the provisioning step.
#[derive(Debug, Default)]
pub struct ProvisionOutcome {
    pub kept: BTreeSet<String>,
    /// Any create, delete or cross-kind cleanup happened.
    pub changed: bool,
    pub error: Option<anyhow::Error>,
}

fn set_status_condition(
    status: &mut UnitedDeploymentStatus,
    type_: UnitedDeploymentConditionType,
    cond_status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    set_condition(
        &mut status.conditions,
        Condition::new(type_, cond_status, reason, message),
    );
}

/// Drives the pools of one resource through one [`PoolControl`].
pub struct PoolManager<'a, A: WorkloadAdapter> {
    control: &'a PoolControl<A>,
    others: Vec<&'a dyn PoolCleaner>,
    recorder: &'a dyn EventRecorder,
    initial_batch_size: usize,
}

impl<'a, A: WorkloadAdapter> PoolManager<'a, A> {
    pub fn new(
        control: &'a PoolControl<A>,
        others: Vec<&'a dyn PoolCleaner>,
        recorder: &'a dyn EventRecorder,
        initial_batch_size: usize,
    ) -> Self {
        Self {
            control,
            others,
            recorder,
            initial_batch_size,
        }
    }

    fn record(&self, ud: &UnitedDeployment, type_: EventType, reason: &str, message: &str) {
        self.recorder
            .record(&ud.object_reference(), type_, reason, message);
    }

    /// Live pools keyed by pool name. When several workloads claim the same
    /// pool, the oldest is kept and the others are deleted.
    pub async fn name_to_pool(
        &self,
        ud: &UnitedDeployment,
    ) -> anyhow::Result<BTreeMap<String, Pool<A::Object>>> {
        let pools = match self.control.get_all_pools(ud).await {
            Ok(pools) => pools,
            Err(e) => {
                self.record(
                    ud,
                    EventType::Warning,
                    &failed(FIND_POOLS),
                    &format!("Error finding pools: {}", e),
                );
                return Err(e);
            }
        };

        let mut grouped: BTreeMap<String, Vec<Pool<A::Object>>> = BTreeMap::new();
        for pool in pools {
            grouped.entry(pool.name.clone()).or_default().push(pool);
        }

        let mut name_to_pool = BTreeMap::new();
        let mut errors = Vec::new();
        for (name, mut group) in grouped {
            group.sort_by(|a, b| {
                let (am, bm) = (a.pool_ref.metadata(), b.pool_ref.metadata());
                am.creation_timestamp
                    .cmp(&bm.creation_timestamp)
                    .then_with(|| am.name.cmp(&bm.name))
            });
            let mut group = group.into_iter();
            let Some(keep) = group.next() else {
                continue;
            };
            for duplicate in group {
                info!(
                    "UnitedDeployment {}: deleting duplicated pool {} ({})",
                    ud.metadata.key(),
                    name,
                    duplicate.pool_ref.name()
                );
                if let Err(e) = self.control.delete_pool(&duplicate).await {
                    errors.push(anyhow::anyhow!(
                        "fail to delete duplicated Pool {} ({}): {}",
                        name,
                        duplicate.pool_ref.name(),
                        e
                    ));
                }
            }
            name_to_pool.insert(name, keep);
        }

        if let Some(e) = aggregate(errors) {
            self.record(
                ud,
                EventType::Warning,
                &failed(DUP_POOLS_DELETE),
                &format!("Error deleting duplicated pools: {}", e),
            );
            return Err(e);
        }
        Ok(name_to_pool)
    }

    /// Provision the pool set, then bring kept pools to `revision` and
    /// their targets. Conditions are written into `status`.
    pub async fn manage_pools(
        &self,
        ud: &UnitedDeployment,
        name_to_pool: &BTreeMap<String, Pool<A::Object>>,
        targets: &BTreeMap<String, PoolTarget>,
        revision: &str,
        status: &mut UnitedDeploymentStatus,
    ) -> anyhow::Result<()> {
        let outcome = self
            .manage_pool_provision(ud, name_to_pool, targets, revision)
            .await;
        if let Some(e) = outcome.error {
            set_status_condition(
                status,
                UnitedDeploymentConditionType::PoolProvisioned,
                ConditionStatus::False,
                "Error",
                &e.to_string(),
            );
            return Err(e.context("fail to manage Pool provision"));
        }
        if outcome.changed {
            debug!("UnitedDeployment {}: pool set changed", ud.metadata.key());
        }
        set_status_condition(
            status,
            UnitedDeploymentConditionType::PoolProvisioned,
            ConditionStatus::True,
            "",
            "",
        );

        let kind = A::TEMPLATE_TYPE;
        let need_update: Vec<(&Pool<A::Object>, PoolTarget)> = outcome
            .kept
            .iter()
            .filter_map(|name| {
                let pool = name_to_pool.get(name)?;
                let target = targets.get(name).cloned().unwrap_or_default();
                let stale = self.control.needs_revision_update(pool, revision)
                    || pool.status.replicas_info.replicas != target.replicas
                    || pool.status.patch_info != target.patch;
                stale.then_some((pool, target))
            })
            .collect();

        let mut update_error = None;
        if !need_update.is_empty() {
            let (updated, err) = slow_start_batch(need_update.len(), self.initial_batch_size, |i| {
                let (pool, target) = &need_update[i];
                async move {
                    info!(
                        "UnitedDeployment {} needs to update Pool ({}) {}/{} with revision {}, replicas {}",
                        ud.metadata.key(),
                        kind,
                        pool.namespace,
                        pool.name,
                        revision,
                        target.replicas
                    );
                    let result = self
                        .control
                        .update_pool(pool, ud, revision, target.replicas)
                        .await;
                    if let Err(e) = &result {
                        self.record(
                            ud,
                            EventType::Warning,
                            &failed(POOLS_UPDATE),
                            &format!(
                                "Error updating Pool ({}) {} when updating: {}",
                                kind, pool.name, e
                            ),
                        );
                    }
                    result
                }
            })
            .await;
            if err.is_none() {
                self.record(
                    ud,
                    EventType::Normal,
                    &successful(POOLS_UPDATE),
                    &format!("Update {} Pool ({})", updated, kind),
                );
            }
            update_error = err;
        }

        match update_error {
            None => {
                set_status_condition(
                    status,
                    UnitedDeploymentConditionType::PoolUpdated,
                    ConditionStatus::True,
                    "",
                    "",
                );
                Ok(())
            }
            Some(e) => {
                set_status_condition(
                    status,
                    UnitedDeploymentConditionType::PoolUpdated,
                    ConditionStatus::False,
                    "Error",
                    &e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Create missing pools, delete unexpected ones and remove pools of
    /// every other workload kind.
    pub async fn manage_pool_provision(
        &self,
        ud: &UnitedDeployment,
        name_to_pool: &BTreeMap<String, Pool<A::Object>>,
        targets: &BTreeMap<String, PoolTarget>,
        revision: &str,
    ) -> ProvisionOutcome {
        let kind = A::TEMPLATE_TYPE;
        let expected: BTreeSet<String> = ud
            .spec
            .topology
            .pools
            .iter()
            .map(|p| p.name.clone())
            .collect();
        let existing: BTreeSet<String> = name_to_pool.keys().cloned().collect();
        debug!(
            "UnitedDeployment {} has pools {:?}, expects pools {:?}",
            ud.metadata.key(),
            existing,
            expected
        );
        let diff = diff_pools(&expected, &existing);

        let mut errors = Vec::new();

        if !diff.to_create.is_empty() {
            info!(
                "UnitedDeployment {} needs creating pool ({}) with name: {:?}",
                ud.metadata.key(),
                kind,
                diff.to_create
            );
            let creates = &diff.to_create;
            let (created, err) = slow_start_batch(creates.len(), self.initial_batch_size, |i| {
                let pool_name = &creates[i];
                async move {
                    let replicas = targets.get(pool_name).map_or(0, |t| t.replicas);
                    let result = self
                        .control
                        .create_pool(ud, pool_name, revision, replicas)
                        .await
                        .map_err(|e| {
                            anyhow::anyhow!("fail to create Pool ({}) {}: {}", kind, pool_name, e)
                        });
                    if let Err(e) = &result {
                        self.record(ud, EventType::Warning, &failed(POOLS_UPDATE), &e.to_string());
                    }
                    result
                }
            })
            .await;
            match err {
                None => self.record(
                    ud,
                    EventType::Normal,
                    &successful(POOLS_UPDATE),
                    &format!("Create {} Pool ({})", created, kind),
                ),
                Some(e) => errors.push(e),
            }
        }

        if !diff.to_delete.is_empty() {
            info!(
                "UnitedDeployment {} needs deleting pool ({}) with name: {:?}",
                ud.metadata.key(),
                kind,
                diff.to_delete
            );
            let mut delete_errors = Vec::new();
            for pool_name in &diff.to_delete {
                let Some(pool) = name_to_pool.get(pool_name) else {
                    continue;
                };
                if let Err(e) = self.control.delete_pool(pool).await {
                    let e = anyhow::anyhow!(
                        "fail to delete Pool ({}) {}/{} for {}: {}",
                        kind,
                        pool.namespace,
                        pool.pool_ref.name(),
                        pool_name,
                        e
                    );
                    self.record(ud, EventType::Warning, &failed(POOLS_UPDATE), &e.to_string());
                    delete_errors.push(e);
                }
            }
            if delete_errors.is_empty() {
                self.record(
                    ud,
                    EventType::Normal,
                    &successful(POOLS_UPDATE),
                    &format!("Delete {} Pool ({})", diff.to_delete.len(), kind),
                );
            } else {
                errors.extend(delete_errors);
            }
        }

        let mut cleaned = false;
        for other in &self.others {
            if other.template_type() == kind {
                continue;
            }
            let (found, other_errors) = other.clean_pools(ud).await;
            cleaned |= found;
            errors.extend(other_errors);
        }

        ProvisionOutcome {
            changed: !diff.to_create.is_empty() || !diff.to_delete.is_empty() || cleaned,
            kept: diff.kept,
            error: aggregate(errors),
        }
    }
}
