use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Owner reference ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Set on exactly one owner: the managing controller.
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

// --- Object metadata ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Prefix used by the store to generate `name` when it is empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Bumped by the store on every spec change.
    #[serde(default)]
    pub generation: i64,
    /// Optimistic concurrency token; bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// The owner reference flagged as controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    pub fn is_controlled_by(&self, uid: &str) -> bool {
        self.controller_ref().is_some_and(|r| r.uid == uid)
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == uid)
    }

    /// Install `owner` as the controller reference, replacing any reference
    /// with the same uid.
    pub fn set_controller_ref(&mut self, owner: OwnerReference) -> anyhow::Result<()> {
        if let Some(existing) = self.controller_ref()
            && existing.uid != owner.uid
        {
            anyhow::bail!(
                "object {}/{} is already controlled by {} {}",
                self.namespace,
                self.name,
                existing.kind,
                existing.name
            );
        }
        self.owner_references.retain(|r| r.uid != owner.uid);
        self.owner_references.push(owner);
        Ok(())
    }

    pub fn remove_owner_ref(&mut self, uid: &str) {
        self.owner_references.retain(|r| r.uid != uid);
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// `namespace/name`, used in log lines and event messages.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// --- Typed resources ---

/// A kind the object store knows how to persist.
///
/// Each stored type carries its identity as associated constants, so the
/// store never has to look types up at runtime.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const API_VERSION: &'static str;
    const KIND: &'static str;
    /// Lowercase plural used in store keys.
    const PLURAL: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    fn uid(&self) -> &str {
        &self.metadata().uid
    }

    /// A controller owner reference pointing at this object.
    fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }

    fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Self::API_VERSION.to_string(),
            kind: Self::KIND.to_string(),
            namespace: self.metadata().namespace.clone(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
        }
    }
}

/// Loose pointer at another object, used by events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

/// Envelope used to read only the metadata of an arbitrary stored object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps.udm.dev/v1alpha1".to_string(),
            kind: "UnitedDeployment".to_string(),
            name: format!("ud-{}", uid),
            uid: uid.to_string(),
            controller: true,
            block_owner_deletion: true,
        }
    }

    #[test]
    fn controller_ref_is_exclusive() {
        let mut meta = ObjectMeta::new("default", "web");
        meta.set_controller_ref(owner("a")).unwrap();
        assert!(meta.is_controlled_by("a"));

        // Re-setting the same owner is idempotent
        meta.set_controller_ref(owner("a")).unwrap();
        assert_eq!(meta.owner_references.len(), 1);

        // A different controller is refused
        assert!(meta.set_controller_ref(owner("b")).is_err());

        meta.remove_owner_ref("a");
        assert!(meta.controller_ref().is_none());
    }
}
