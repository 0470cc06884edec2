//! Compile-time table of every kind the store persists.

use crate::deployment::Deployment;
use crate::event::Event;
use crate::meta::Resource;
use crate::pod::Pod;
use crate::revision::ControllerRevision;
use crate::statefulset::StatefulSet;
use crate::united::UnitedDeployment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl KindInfo {
    pub const fn of<R: Resource>() -> Self {
        Self {
            api_version: R::API_VERSION,
            kind: R::KIND,
            plural: R::PLURAL,
        }
    }
}

pub const KINDS: &[KindInfo] = &[
    KindInfo::of::<UnitedDeployment>(),
    KindInfo::of::<Deployment>(),
    KindInfo::of::<StatefulSet>(),
    KindInfo::of::<ControllerRevision>(),
    KindInfo::of::<Pod>(),
    KindInfo::of::<Event>(),
];

pub fn by_kind(kind: &str) -> Option<&'static KindInfo> {
    KINDS.iter().find(|k| k.kind == kind)
}
