use async_trait::async_trait;
use pkg_constants::labels::REVISION_HASH_LABEL;
use pkg_state::{Client, PropagationPolicy};
use pkg_types::pod::Pod;
use pkg_types::statefulset::{StatefulSet, StatefulSetUpdateStrategy};
use pkg_types::united::{TemplateType, UnitedDeployment};
use tracing::{debug, info};

use super::{
    WorkloadAdapter, apply_pool_patch, attach_node_affinity_and_tolerations, pool_config,
    pool_selector, stamp_metadata, stamp_pod_template,
};
use crate::pool::ReplicasInfo;

/// Provisions pools as StatefulSets.
///
/// A rolling update stalls when a pod of the old revision never becomes
/// ready, so after each update the adapter removes such pods above the
/// partition and lets the set recreate them at the new revision.
#[derive(Clone)]
pub struct StatefulSetAdapter {
    client: Client,
}

impl StatefulSetAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Pods of `set` above `partition` that still run another revision and
    /// are not ready.
    fn stuck_pods<'a>(
        set: &StatefulSet,
        pods: &'a [Pod],
        partition: u32,
        revision: &str,
    ) -> Vec<&'a Pod> {
        pods.iter()
            .filter(|pod| pod.metadata.is_controlled_by(&set.metadata.uid))
            .filter(|pod| pod.ordinal().is_some_and(|o| o >= partition))
            .filter(|pod| {
                pod.metadata.labels.get(REVISION_HASH_LABEL).map(String::as_str) != Some(revision)
            })
            .filter(|pod| !pod.is_ready())
            .collect()
    }
}

#[async_trait]
impl WorkloadAdapter for StatefulSetAdapter {
    type Object = StatefulSet;

    const TEMPLATE_TYPE: TemplateType = TemplateType::StatefulSet;

    fn observed_generation(&self, object: &StatefulSet) -> i64 {
        object.status.observed_generation
    }

    fn replicas_info(&self, object: &StatefulSet) -> ReplicasInfo {
        ReplicasInfo {
            replicas: object.spec.replicas.unwrap_or(0),
            ready_replicas: object.status.ready_replicas,
        }
    }

    fn pool_failure(&self, _object: &StatefulSet) -> Option<String> {
        None
    }

    fn apply_pool_template(
        &self,
        ud: &UnitedDeployment,
        pool_name: &str,
        revision: &str,
        replicas: u32,
        object: &mut StatefulSet,
    ) -> anyhow::Result<()> {
        let pool = pool_config(ud, pool_name)?;
        let template = ud
            .spec
            .workload_template
            .stateful_set_template
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} has no statefulSetTemplate", ud.metadata.key()))?;

        stamp_metadata(&mut object.metadata, ud, &template.metadata, pool_name, revision)?;

        let spec = &mut object.spec;
        spec.selector = pool_selector(ud, pool_name);
        spec.replicas = Some(replicas);
        spec.update_strategy = template.spec.update_strategy.clone();
        spec.template = template.spec.template.clone();
        stamp_pod_template(&mut spec.template, pool_name, revision);
        spec.revision_history_limit = ud.spec.revision_history_limit;
        spec.pod_management_policy = template.spec.pod_management_policy;
        spec.service_name = template.spec.service_name.clone();
        attach_node_affinity_and_tolerations(&mut spec.template.spec, pool);

        apply_pool_patch(object, pool)
    }

    async fn post_update(
        &self,
        _ud: &UnitedDeployment,
        object: &StatefulSet,
        revision: &str,
    ) -> anyhow::Result<()> {
        let partition = match object.spec.update_strategy {
            StatefulSetUpdateStrategy::OnDelete => return Ok(()),
            StatefulSetUpdateStrategy::RollingUpdate { partition } => partition,
        };

        let pods: Vec<Pod> = self
            .client
            .list_selected(&object.metadata.namespace, &object.spec.selector)
            .await?;
        for pod in Self::stuck_pods(object, &pods, partition, revision) {
            info!(
                "StatefulSet {}: deleting stuck pod {} (phase {}) to move it to revision {}",
                object.metadata.key(),
                pod.metadata.name,
                pod.status.phase,
                revision
            );
            match self.client.delete(pod, PropagationPolicy::Background).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!("pod {} already gone", pod.metadata.key());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
