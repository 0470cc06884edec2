use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};

/// Immutable snapshot of a workload template.
///
/// `data` holds the serialized template fragment verbatim; two revisions
/// with byte-identical `data` describe the same template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevision {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: String,
    /// Sequence number, increasing per owning resource.
    #[serde(default)]
    pub revision: i64,
}

impl ControllerRevision {
    pub fn same_content(&self, other: &ControllerRevision) -> bool {
        self.data == other.data
    }
}

impl Resource for ControllerRevision {
    const API_VERSION: &'static str = "apps/v1";
    const KIND: &'static str = "ControllerRevision";
    const PLURAL: &'static str = "controllerrevisions";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
