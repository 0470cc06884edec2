use pkg_types::deployment::Deployment;
use pkg_types::united::{TemplateType, UnitedDeployment};
use tracing::debug;

use super::{
    WorkloadAdapter, apply_pool_patch, attach_node_affinity_and_tolerations, pool_config,
    pool_selector, stamp_metadata, stamp_pod_template,
};
use crate::pool::ReplicasInfo;

/// Provisions pools as Deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentAdapter;

impl WorkloadAdapter for DeploymentAdapter {
    type Object = Deployment;

    const TEMPLATE_TYPE: TemplateType = TemplateType::Deployment;

    fn observed_generation(&self, object: &Deployment) -> i64 {
        object.status.observed_generation
    }

    fn replicas_info(&self, object: &Deployment) -> ReplicasInfo {
        ReplicasInfo {
            replicas: object.spec.replicas.unwrap_or(0),
            ready_replicas: object.status.ready_replicas,
        }
    }

    fn pool_failure(&self, object: &Deployment) -> Option<String> {
        object.replica_failure().map(str::to_string)
    }

    fn apply_pool_template(
        &self,
        ud: &UnitedDeployment,
        pool_name: &str,
        revision: &str,
        replicas: u32,
        object: &mut Deployment,
    ) -> anyhow::Result<()> {
        let pool = pool_config(ud, pool_name)?;
        let template = ud
            .spec
            .workload_template
            .deployment_template
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} has no deploymentTemplate", ud.metadata.key()))?;

        stamp_metadata(&mut object.metadata, ud, &template.metadata, pool_name, revision)?;

        let spec = &mut object.spec;
        spec.selector = pool_selector(ud, pool_name);
        spec.replicas = Some(replicas);
        spec.strategy = template.spec.strategy.clone();
        spec.template = template.spec.template.clone();
        stamp_pod_template(&mut spec.template, pool_name, revision);
        spec.revision_history_limit = ud.spec.revision_history_limit;
        spec.min_ready_seconds = template.spec.min_ready_seconds;
        spec.paused = template.spec.paused;
        spec.progress_deadline_seconds = template.spec.progress_deadline_seconds;
        attach_node_affinity_and_tolerations(&mut spec.template.spec, pool);

        if pool.patch.is_none() {
            debug!(
                "Deployment {}/{}: pool has no patch",
                object.metadata.namespace, object.metadata.generate_name
            );
        }
        apply_pool_patch(object, pool)
    }
}
