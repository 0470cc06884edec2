//! Versioned history of a UnitedDeployment's workload template.
//!
//! Each `ControllerRevision` stores the template fragment as a replace
//! patch. Revisions with identical data are never kept twice; the name is
//! `<resource>-<hash(data, collisionCount)>`.

use pkg_constants::controller::{MAX_REVISION_NAME_COLLISIONS, MAX_REVISION_NAME_PREFIX_LEN};
use pkg_constants::labels::CONTROLLER_REVISION_HASH_LABEL;
use pkg_state::{Client, PropagationPolicy};
use pkg_types::meta::{ObjectMeta, Resource};
use pkg_types::revision::ControllerRevision;
use pkg_types::united::UnitedDeployment;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::claim::ClaimManager;

const SAFE_ENCODE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Revisions resolved by one pass.
#[derive(Debug, Clone)]
pub struct Revisions {
    pub current: ControllerRevision,
    pub update: ControllerRevision,
}

/// Result of [`RevisionManager::reconcile_revisions`]. The collision count
/// is reported even when the pass failed, so it can still be persisted.
#[derive(Debug)]
pub struct RevisionOutcome {
    pub collision_count: u32,
    pub result: anyhow::Result<Revisions>,
}

pub struct RevisionManager {
    client: Client,
    max_collisions: u32,
}

impl RevisionManager {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            max_collisions: MAX_REVISION_NAME_COLLISIONS,
        }
    }

    pub fn with_max_collisions(mut self, max_collisions: u32) -> Self {
        self.max_collisions = max_collisions;
        self
    }

    /// Revisions matching the resource's selector and owned by it.
    pub async fn list_owned_history(
        &self,
        ud: &UnitedDeployment,
    ) -> anyhow::Result<Vec<ControllerRevision>> {
        let candidates: Vec<ControllerRevision> = self
            .client
            .list_selected(&ud.metadata.namespace, &ud.spec.selector)
            .await?;
        debug!(
            "UnitedDeployment {}: listed {} controller revisions",
            ud.metadata.key(),
            candidates.len()
        );
        ClaimManager::new(&self.client, ud, &ud.spec.selector)
            .claim(candidates)
            .await
    }

    /// Resolve the current and update revisions, pruning history and
    /// creating the update revision when the template is new.
    pub async fn reconcile_revisions(&self, ud: &UnitedDeployment) -> RevisionOutcome {
        let mut collision_count = ud.status.collision_count.unwrap_or(0);
        let result = self.construct_revisions(ud, &mut collision_count).await;
        RevisionOutcome {
            collision_count,
            result,
        }
    }

    async fn construct_revisions(
        &self,
        ud: &UnitedDeployment,
        collision_count: &mut u32,
    ) -> anyhow::Result<Revisions> {
        let mut history = self.list_owned_history(ud).await?;
        sort_revisions(&mut history);
        self.prune(ud, &mut history).await?;

        let candidate = new_revision(ud, next_revision_number(&history))?;

        let latest = history.len().checked_sub(1);
        let equal = history.iter().rposition(|r| r.same_content(&candidate));
        let update = match equal {
            Some(i) if Some(i) == latest => history[i].clone(),
            Some(i) => {
                // Rolling back to an older template: move that revision to
                // the head of the history instead of creating a twin.
                let mut rollback = history[i].clone();
                rollback.revision = candidate.revision;
                let updated = self.client.update(&rollback).await?;
                info!(
                    "UnitedDeployment {}: revision {} reused as revision number {}",
                    ud.metadata.key(),
                    updated.metadata.name,
                    updated.revision
                );
                history[i] = updated.clone();
                updated
            }
            None => self.create_revision(ud, candidate, collision_count).await?,
        };

        let current = history
            .iter()
            .find(|r| r.metadata.name == ud.status.current_revision)
            .cloned()
            .unwrap_or_else(|| update.clone());

        Ok(Revisions { current, update })
    }

    /// Delete the oldest revisions beyond the history limit. The revision
    /// recorded as current is always kept.
    async fn prune(
        &self,
        ud: &UnitedDeployment,
        history: &mut Vec<ControllerRevision>,
    ) -> anyhow::Result<()> {
        let limit = ud.revision_history_limit() as usize;
        let Some(mut excess) = history.len().checked_sub(limit).filter(|n| *n > 0) else {
            return Ok(());
        };

        let mut kept = Vec::with_capacity(limit + 1);
        for revision in std::mem::take(history) {
            if excess == 0 || revision.metadata.name == ud.status.current_revision {
                kept.push(revision);
                continue;
            }
            match self
                .client
                .delete(&revision, PropagationPolicy::Background)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            debug!(
                "UnitedDeployment {}: pruned revision {}",
                ud.metadata.key(),
                revision.metadata.name
            );
            excess -= 1;
        }
        *history = kept;
        Ok(())
    }

    /// Persist `revision` under a collision-free name. An existing object
    /// with the same name and data is returned as is.
    async fn create_revision(
        &self,
        ud: &UnitedDeployment,
        revision: ControllerRevision,
        collision_count: &mut u32,
    ) -> anyhow::Result<ControllerRevision> {
        for _ in 0..=self.max_collisions {
            let hash = hash_revision(&revision.data, *collision_count);
            let mut attempt = revision.clone();
            attempt.metadata.name = revision_name(&ud.metadata.name, &hash);
            attempt
                .metadata
                .labels
                .insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), hash);

            match self.client.create(&attempt).await {
                Ok(created) => {
                    info!(
                        "UnitedDeployment {}: created revision {} (number {})",
                        ud.metadata.key(),
                        created.metadata.name,
                        created.revision
                    );
                    return Ok(created);
                }
                Err(e) if e.is_already_exists() => {
                    let existing: ControllerRevision = self
                        .client
                        .get(&attempt.metadata.namespace, &attempt.metadata.name)
                        .await?;
                    if existing.same_content(&attempt) {
                        return Ok(existing);
                    }
                    *collision_count = collision_count.saturating_add(1);
                    warn!(
                        "UnitedDeployment {}: revision name {} collides with different data, collisionCount now {}",
                        ud.metadata.key(),
                        attempt.metadata.name,
                        collision_count
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!(
            "UnitedDeployment {}: gave up creating a revision after {} name collisions (collisionCount {})",
            ud.metadata.key(),
            self.max_collisions,
            collision_count
        )
    }
}

/// Order by (revision number, creation time, name).
pub fn sort_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// One past the newest revision number, or 1 for an empty history.
pub fn next_revision_number(sorted: &[ControllerRevision]) -> i64 {
    sorted.last().map_or(1, |r| r.revision + 1)
}

/// The template fragment stored in a revision: the workload template
/// wrapped as a replace patch of `spec.workloadTemplate`.
pub fn revision_data(ud: &UnitedDeployment) -> anyhow::Result<String> {
    let mut template = serde_json::to_value(&ud.spec.workload_template)?;
    let Value::Object(map) = &mut template else {
        anyhow::bail!("workload template of {} is not a map", ud.metadata.key());
    };
    map.insert("$patch".to_string(), Value::String("replace".to_string()));
    Ok(json!({ "spec": { "workloadTemplate": template } }).to_string())
}

/// Unnamed revision of the present template.
pub fn new_revision(ud: &UnitedDeployment, number: i64) -> anyhow::Result<ControllerRevision> {
    let template_labels = ud.spec.workload_template.labels().ok_or_else(|| {
        anyhow::anyhow!(
            "UnitedDeployment {} needs a workload template",
            ud.metadata.key()
        )
    })?;

    let mut metadata = ObjectMeta::new(&ud.metadata.namespace, "");
    metadata.labels = template_labels.clone();
    metadata.labels.extend(ud.spec.selector.match_labels.clone());
    metadata.set_controller_ref(ud.controller_owner_ref())?;

    Ok(ControllerRevision {
        metadata,
        data: revision_data(ud)?,
        revision: number,
    })
}

/// Deterministic, name-safe hash of revision data and a collision count.
pub fn hash_revision(data: &str, collision_count: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hasher.update(collision_count.to_le_bytes());
    let digest = hasher.finalize();
    let sum = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    safe_encode(&sum.to_string())
}

/// Map every byte onto a consonant/digit alphabet that cannot spell words.
fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ENCODE_ALPHABET[b as usize % SAFE_ENCODE_ALPHABET.len()] as char)
        .collect()
}

pub fn revision_name(parent: &str, hash: &str) -> String {
    let prefix = match parent.char_indices().nth(MAX_REVISION_NAME_PREFIX_LEN) {
        Some((idx, _)) => &parent[..idx],
        None => parent,
    };
    format!("{}-{}", prefix, hash)
}
