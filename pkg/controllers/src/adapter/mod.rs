//! Workload adapters: one implementation per workload kind a pool can be
//! provisioned as. Pool orchestration only talks to [`WorkloadAdapter`].

pub mod deployment;
pub mod statefulset;

pub use deployment::DeploymentAdapter;
pub use statefulset::StatefulSetAdapter;

use async_trait::async_trait;
use pkg_constants::labels::{PATCH_ANNOTATION, POOL_NAME_LABEL, REVISION_HASH_LABEL};
use pkg_types::meta::{ObjectMeta, Resource};
use pkg_types::pod::{NodeAffinity, NodeSelectorTerm, PodSpec, PodTemplateSpec, TemplateMeta};
use pkg_types::selector::LabelSelector;
use pkg_types::united::{PoolSpec, TemplateType, UnitedDeployment};

use crate::patch;
use crate::pool::ReplicasInfo;

#[async_trait]
pub trait WorkloadAdapter: Send + Sync + 'static {
    type Object: Resource + Default;

    /// The template kind this adapter provisions.
    const TEMPLATE_TYPE: TemplateType;

    fn new_object(&self) -> Self::Object {
        Self::Object::default()
    }

    fn observed_generation(&self, object: &Self::Object) -> i64;

    fn replicas_info(&self, object: &Self::Object) -> ReplicasInfo;

    /// Failure reported by the workload's own status, if the kind has one.
    fn pool_failure(&self, object: &Self::Object) -> Option<String>;

    /// Overwrite `object` with what pool `pool_name` of `ud` should look like
    /// at `revision`, then overlay the pool's patch.
    fn apply_pool_template(
        &self,
        ud: &UnitedDeployment,
        pool_name: &str,
        revision: &str,
        replicas: u32,
        object: &mut Self::Object,
    ) -> anyhow::Result<()>;

    /// Follow-up work once an update of the pool was persisted.
    async fn post_update(
        &self,
        _ud: &UnitedDeployment,
        _object: &Self::Object,
        _revision: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// `true` when the workload was built from another revision and needs
    /// an update.
    fn needs_revision_update(&self, object: &Self::Object, revision: &str) -> bool {
        object
            .metadata()
            .labels
            .get(REVISION_HASH_LABEL)
            .map(String::as_str)
            != Some(revision)
    }
}

/// Name prefix of every workload generated for `pool_name`.
pub fn pool_prefix(ud_name: &str, pool_name: &str) -> String {
    format!("{}-{}-", ud_name, pool_name)
}

pub(crate) fn pool_config<'a>(
    ud: &'a UnitedDeployment,
    pool_name: &str,
) -> anyhow::Result<&'a PoolSpec> {
    ud.pool(pool_name).ok_or_else(|| {
        anyhow::anyhow!(
            "pool {} not found in topology of {}",
            pool_name,
            ud.metadata.key()
        )
    })
}

/// Identity, labels, annotations and owner of a pool workload.
pub(crate) fn stamp_metadata(
    meta: &mut ObjectMeta,
    ud: &UnitedDeployment,
    template: &TemplateMeta,
    pool_name: &str,
    revision: &str,
) -> anyhow::Result<()> {
    meta.namespace = ud.metadata.namespace.clone();

    meta.labels.extend(template.labels.clone());
    meta.labels.extend(ud.spec.selector.match_labels.clone());
    meta.labels
        .insert(REVISION_HASH_LABEL.to_string(), revision.to_string());
    meta.labels
        .insert(POOL_NAME_LABEL.to_string(), pool_name.to_string());

    meta.annotations.extend(template.annotations.clone());
    meta.generate_name = pool_prefix(&ud.metadata.name, pool_name);
    meta.set_controller_ref(ud.controller_owner_ref())
}

/// The resource selector narrowed to one pool.
pub(crate) fn pool_selector(ud: &UnitedDeployment, pool_name: &str) -> LabelSelector {
    let mut selector = ud.spec.selector.clone();
    selector
        .match_labels
        .insert(POOL_NAME_LABEL.to_string(), pool_name.to_string());
    selector
}

pub(crate) fn stamp_pod_template(template: &mut PodTemplateSpec, pool_name: &str, revision: &str) {
    template
        .metadata
        .labels
        .insert(POOL_NAME_LABEL.to_string(), pool_name.to_string());
    template
        .metadata
        .labels
        .insert(REVISION_HASH_LABEL.to_string(), revision.to_string());
}

/// AND the pool's node selector term into every required node affinity term
/// and append the pool's tolerations.
pub(crate) fn attach_node_affinity_and_tolerations(spec: &mut PodSpec, pool: &PoolSpec) {
    if !pool.node_selector_term.match_expressions.is_empty() {
        let affinity = spec.node_affinity.get_or_insert_with(NodeAffinity::default);
        if affinity.node_selector_terms.is_empty() {
            affinity.node_selector_terms.push(NodeSelectorTerm::default());
        }
        for term in &mut affinity.node_selector_terms {
            term.match_expressions
                .extend(pool.node_selector_term.match_expressions.iter().cloned());
        }
    }
    spec.tolerations.extend(pool.tolerations.iter().cloned());
}

/// Overlay the pool's patch on `object` and record it in the patch
/// annotation; without a patch the annotation is dropped.
pub(crate) fn apply_pool_patch<O: Resource>(object: &mut O, pool: &PoolSpec) -> anyhow::Result<()> {
    match (&pool.patch, pool.patch_content()) {
        (Some(p), Some(content)) => {
            let patched = patch::apply(&*object, p).map_err(|e| {
                anyhow::anyhow!(
                    "{} {}{} strategic merge by patch {} failed: {}",
                    O::KIND,
                    object.namespace(),
                    object.metadata().generate_name,
                    content,
                    e
                )
            })?;
            *object = patched;
            object
                .metadata_mut()
                .annotations
                .insert(PATCH_ANNOTATION.to_string(), content);
        }
        _ => {
            object.metadata_mut().annotations.remove(PATCH_ANNOTATION);
        }
    }
    Ok(())
}
