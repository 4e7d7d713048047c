use crate::types::OwnerRef;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

/// A change notification delivered by the watch source
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent<K> {
    /// Object observed for the first time
    Added(K),
    /// Object changed; carries the previous and current versions
    Updated { old: K, new: K },
    /// Object deletion was observed
    Deleted(K),
    /// Object disappeared while the watch was down; carries the last-known state
    DeletedTombstone(K),
}

impl<K> ObjectEvent<K> {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ObjectEvent::Added(_) => "added",
            ObjectEvent::Updated { .. } => "updated",
            ObjectEvent::Deleted(_) => "deleted",
            ObjectEvent::DeletedTombstone(_) => "deleted-tombstone",
        }
    }
}

/// Narrow read-only view of object metadata
pub trait ObjectMetaAccess {
    fn name(&self) -> Option<&str>;

    fn namespace(&self) -> Option<&str>;

    fn owner_references(&self) -> &[OwnerReference];

    fn resource_version(&self) -> Option<&str>;

    /// The owner reference flagged as the managing controller, if any
    fn controller_owner(&self) -> Option<OwnerRef> {
        self.owner_references()
            .iter()
            .find(|r| r.controller == Some(true))
            .map(|r| OwnerRef {
                kind: r.kind.clone(),
                name: r.name.clone(),
            })
    }
}

impl<T> ObjectMetaAccess for T
where
    T: k8s_openapi::Metadata<Ty = ObjectMeta>,
{
    fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata().owner_references.as_deref().unwrap_or(&[])
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }
}
