use async_trait::async_trait;
use pkg_constants::controller::POOL_UPDATE_RETRIES;
use pkg_constants::labels::{PATCH_ANNOTATION, POOL_NAME_LABEL};
use pkg_state::{Client, PropagationPolicy};
use pkg_types::meta::Resource;
use pkg_types::united::{TemplateType, UnitedDeployment};
use tracing::{debug, info, warn};

use crate::adapter::WorkloadAdapter;
use crate::claim::ClaimManager;
use crate::pool::{Pool, PoolStatus};

/// Create, read, update and delete pools of one workload kind.
pub struct PoolControl<A: WorkloadAdapter> {
    client: Client,
    adapter: A,
    update_retries: usize,
}

impl<A: WorkloadAdapter> PoolControl<A> {
    pub fn new(client: Client, adapter: A) -> Self {
        Self {
            client,
            adapter,
            update_retries: POOL_UPDATE_RETRIES,
        }
    }

    pub fn with_update_retries(mut self, update_retries: usize) -> Self {
        self.update_retries = update_retries.max(1);
        self
    }

    /// Pools of this kind matching the resource's selector, after claiming.
    pub async fn get_all_pools(&self, ud: &UnitedDeployment) -> anyhow::Result<Vec<Pool<A::Object>>> {
        ud.spec.selector.validate()?;
        let candidates: Vec<A::Object> = self
            .client
            .list_selected(&ud.metadata.namespace, &ud.spec.selector)
            .await?;
        let claimed = ClaimManager::new(&self.client, ud, &ud.spec.selector)
            .claim(candidates)
            .await?;
        claimed
            .into_iter()
            .map(|object| self.convert_to_pool(object))
            .collect()
    }

    /// Every workload of this kind controlled by the resource, whatever its
    /// labels say now.
    pub async fn get_owned_pools(&self, ud: &UnitedDeployment) -> anyhow::Result<Vec<Pool<A::Object>>> {
        let objects: Vec<A::Object> = self.client.list(Some(&ud.metadata.namespace)).await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.metadata().is_controlled_by(&ud.metadata.uid))
            .map(|object| {
                let name = object
                    .metadata()
                    .labels
                    .get(POOL_NAME_LABEL)
                    .cloned()
                    .unwrap_or_else(|| object.name().to_string());
                self.pool_from(name, object)
            })
            .collect())
    }

    pub async fn create_pool(
        &self,
        ud: &UnitedDeployment,
        pool_name: &str,
        revision: &str,
        replicas: u32,
    ) -> anyhow::Result<()> {
        let mut object = self.adapter.new_object();
        self.adapter
            .apply_pool_template(ud, pool_name, revision, replicas, &mut object)?;
        debug!(
            "UnitedDeployment {}: creating pool {} with {} replicas",
            ud.metadata.key(),
            pool_name,
            replicas
        );

        match self.client.create(&object).await {
            Ok(created) => {
                info!(
                    "UnitedDeployment {}: created {} {} for pool {}",
                    ud.metadata.key(),
                    A::Object::KIND,
                    created.name(),
                    pool_name
                );
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                // The create may still land; the next pass sees the result.
                warn!(
                    "UnitedDeployment {}: creating pool {} timed out: {}",
                    ud.metadata.key(),
                    pool_name,
                    e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of the pool workload with a fixed number of
    /// attempts, then the adapter's post-update hook.
    pub async fn update_pool(
        &self,
        pool: &Pool<A::Object>,
        ud: &UnitedDeployment,
        revision: &str,
        replicas: u32,
    ) -> anyhow::Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.update_retries {
            let mut object: A::Object = self
                .client
                .get(&pool.namespace, pool.pool_ref.name())
                .await?;
            self.adapter
                .apply_pool_template(ud, &pool.name, revision, replicas, &mut object)?;

            match self.client.update(&object).await {
                Ok(updated) => {
                    info!(
                        "UnitedDeployment {}: updated pool {} to revision {} with {} replicas",
                        ud.metadata.key(),
                        pool.name,
                        revision,
                        replicas
                    );
                    return self.adapter.post_update(ud, &updated, revision).await;
                }
                Err(e) => {
                    debug!(
                        "UnitedDeployment {}: update of pool {} failed (attempt {}/{}): {}",
                        ud.metadata.key(),
                        pool.name,
                        attempt,
                        self.update_retries,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => anyhow::anyhow!("pool {} was not updated", pool.name),
        })
    }

    /// Delete the pool workload; dependents are collected in the background.
    pub async fn delete_pool(&self, pool: &Pool<A::Object>) -> anyhow::Result<()> {
        self.client
            .delete(&pool.pool_ref, PropagationPolicy::Background)
            .await?;
        Ok(())
    }

    pub fn pool_failure(&self, pool: &Pool<A::Object>) -> Option<String> {
        self.adapter.pool_failure(&pool.pool_ref)
    }

    /// `true` when the pool was built from another revision.
    pub fn needs_revision_update(&self, pool: &Pool<A::Object>, revision: &str) -> bool {
        self.adapter.needs_revision_update(&pool.pool_ref, revision)
    }

    fn convert_to_pool(&self, object: A::Object) -> anyhow::Result<Pool<A::Object>> {
        let Some(name) = object.metadata().labels.get(POOL_NAME_LABEL).cloned() else {
            anyhow::bail!(
                "{} {} has no {} label",
                A::Object::KIND,
                object.metadata().key(),
                POOL_NAME_LABEL
            );
        };
        Ok(self.pool_from(name, object))
    }

    fn pool_from(&self, name: String, object: A::Object) -> Pool<A::Object> {
        let status = PoolStatus {
            observed_generation: self.adapter.observed_generation(&object),
            replicas_info: self.adapter.replicas_info(&object),
            patch_info: object.metadata().annotations.get(PATCH_ANNOTATION).cloned(),
        };
        Pool {
            name,
            namespace: object.namespace().to_string(),
            pool_ref: object,
            status,
        }
    }
}

/// Removes a resource's pools of one workload kind. Used to clean up after
/// the template kind changed.
#[async_trait]
pub trait PoolCleaner: Send + Sync {
    fn template_type(&self) -> TemplateType;

    /// Delete every pool of this kind controlled by `ud`. Returns whether
    /// any was found, and the failures.
    async fn clean_pools(&self, ud: &UnitedDeployment) -> (bool, Vec<anyhow::Error>);
}

#[async_trait]
impl<A: WorkloadAdapter> PoolCleaner for PoolControl<A> {
    fn template_type(&self) -> TemplateType {
        A::TEMPLATE_TYPE
    }

    async fn clean_pools(&self, ud: &UnitedDeployment) -> (bool, Vec<anyhow::Error>) {
        let kind = A::TEMPLATE_TYPE;
        let pools = match self.get_owned_pools(ud).await {
            Ok(pools) => pools,
            Err(e) => {
                return (
                    false,
                    vec![anyhow::anyhow!(
                        "fail to list Pool of other type {} for UnitedDeployment {}: {}",
                        kind,
                        ud.metadata.key(),
                        e
                    )],
                );
            }
        };

        let mut errors = Vec::new();
        for pool in &pools {
            info!(
                "UnitedDeployment {}: deleting pool {} of other type {}",
                ud.metadata.key(),
                pool.name,
                kind
            );
            if let Err(e) = self.delete_pool(pool).await {
                errors.push(anyhow::anyhow!(
                    "fail to delete Pool {} of other type {} for UnitedDeployment {}: {}",
                    pool.name,
                    kind,
                    ud.metadata.key(),
                    e
                ));
            }
        }
        (!pools.is_empty(), errors)
    }
}
