//! Thread-safe box registry implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cellbox_shared::errors::{CellboxError, CellboxResult};

use crate::litebox::{BoxConfig, BoxContext, BoxImpl, SharedBoxImpl};
use crate::{BoxID, BoxInfo};

/// Thread-safe registry of live boxes.
///
/// The only place boxes are published or erased. Uses RwLock for concurrent
/// reads (lookup, list) with exclusive writes (register, erase), so readers
/// never observe a half-inserted or half-removed box.
#[derive(Clone, Debug)]
pub struct BoxRegistry {
    inner: Arc<RwLock<BoxRegistryInner>>,
}

#[derive(Debug, Default)]
struct BoxRegistryInner {
    boxes: HashMap<BoxID, SharedBoxImpl>,
    names: HashMap<String, BoxID>,
}

impl BoxRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoxRegistryInner::default())),
        }
    }

    fn read(&self) -> CellboxResult<RwLockReadGuard<'_, BoxRegistryInner>> {
        self.inner
            .read()
            .map_err(|e| CellboxError::Internal(format!("registry lock poisoned: {}", e)))
    }

    fn write(&self) -> CellboxResult<RwLockWriteGuard<'_, BoxRegistryInner>> {
        self.inner
            .write()
            .map_err(|e| CellboxError::Internal(format!("registry lock poisoned: {}", e)))
    }

    /// Create a box in `Created` state and publish it.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken.
    pub(crate) fn register(
        &self,
        config: BoxConfig,
        ctx: Arc<BoxContext>,
    ) -> CellboxResult<SharedBoxImpl> {
        let mut inner = self.write()?;

        if let Some(name) = &config.name
            && inner.names.contains_key(name)
        {
            return Err(CellboxError::AlreadyExists(format!(
                "box with name '{}' already exists",
                name
            )));
        }

        let id = config.id.clone();
        let name = config.name.clone();
        let box_impl = Arc::new(BoxImpl::new(config, ctx));

        tracing::debug!(box_id = %id, name = ?name, "Registering box");
        if let Some(name) = name {
            inner.names.insert(name, id.clone());
        }
        inner.boxes.insert(id, Arc::clone(&box_impl));

        Ok(box_impl)
    }

    /// Resolve a full id, a name, or a unique id prefix.
    ///
    /// # Errors
    ///
    /// - `NotFound` if nothing matches
    /// - `InvalidArgument` if a prefix matches more than one box
    pub(crate) fn lookup(&self, id_or_name: &str) -> CellboxResult<SharedBoxImpl> {
        if id_or_name.is_empty() {
            return Err(CellboxError::NotFound(
                "empty box id or name".to_string(),
            ));
        }

        let inner = self.read()?;

        if let Some(found) = inner.boxes.get(id_or_name) {
            return Ok(Arc::clone(found));
        }

        if let Some(found) = inner
            .names
            .get(id_or_name)
            .and_then(|id| inner.boxes.get(id))
        {
            return Ok(Arc::clone(found));
        }

        let mut matches = inner
            .boxes
            .iter()
            .filter(|(id, _)| id.starts_with(id_or_name));
        match (matches.next(), matches.next()) {
            (Some((_, found)), None) => Ok(Arc::clone(found)),
            (Some(_), Some(_)) => Err(CellboxError::InvalidArgument(format!(
                "box id prefix '{}' is ambiguous",
                id_or_name
            ))),
            _ => Err(CellboxError::NotFound(id_or_name.to_string())),
        }
    }

    pub(crate) fn contains_name(&self, name: &str) -> CellboxResult<bool> {
        Ok(self.read()?.names.contains_key(name))
    }

    /// Remove a box.
    ///
    /// Requires the box be stopped unless `force` is set, in which case a
    /// running box is stopped first.
    pub(crate) async fn remove(&self, id_or_name: &str, force: bool) -> CellboxResult<BoxID> {
        let box_impl = self.lookup(id_or_name)?;
        let id = box_impl.id().clone();
        box_impl.remove(force, || self.erase(&id)).await?;
        Ok(id)
    }

    /// Drop the entry and its name index. Called with the box's lifecycle
    /// token held.
    fn erase(&self, id: &BoxID) -> CellboxResult<()> {
        let mut inner = self.write()?;

        let removed = inner
            .boxes
            .remove(id)
            .ok_or_else(|| CellboxError::NotFound(id.to_string()))?;
        if let Some(name) = removed.name() {
            inner.names.remove(name);
        }

        tracing::debug!(box_id = %id, "Removed box from registry");
        Ok(())
    }

    /// Every registered box at one point in time, newest first.
    pub(crate) fn snapshot(&self) -> CellboxResult<Vec<SharedBoxImpl>> {
        let inner = self.read()?;
        let mut boxes: Vec<SharedBoxImpl> = inner.boxes.values().cloned().collect();
        // ULIDs sort by creation time
        boxes.sort_by(|a, b| b.id().cmp(a.id()));
        Ok(boxes)
    }

    /// List all boxes, sorted by creation time (newest first).
    pub fn list(&self) -> CellboxResult<Vec<BoxInfo>> {
        Ok(self.snapshot()?.iter().map(|b| b.info()).collect())
    }

    /// Get the number of registered boxes.
    pub fn count(&self) -> CellboxResult<usize> {
        Ok(self.read()?.boxes.len())
    }
}

impl Default for BoxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::RootfsHandle;
    use crate::litebox::BoxStatus;
    use crate::runtime::options::BoxOptions;
    use crate::testing::stub_context;

    fn config(name: Option<&str>) -> BoxConfig {
        let mut options = BoxOptions::image("alpine");
        options.name = name.map(str::to_string);
        BoxConfig::new(options, RootfsHandle::new("docker.io/alpine:latest", "/"))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = BoxRegistry::new();
        let registered = registry.register(config(Some("web")), stub_context()).unwrap();
        let id = registered.id().clone();

        assert_eq!(registered.status(), BoxStatus::Created);
        assert_eq!(registry.lookup(id.as_str()).unwrap().id(), &id);
        assert_eq!(registry.lookup("web").unwrap().id(), &id);
        assert_eq!(registry.lookup(&id.as_str()[..10]).unwrap().id(), &id);
    }

    #[test]
    fn test_duplicate_name_fails() {
        let registry = BoxRegistry::new();
        registry.register(config(Some("web")), stub_context()).unwrap();

        let err = registry
            .register(config(Some("web")), stub_context())
            .unwrap_err();
        assert!(matches!(err, CellboxError::AlreadyExists(_)));
        assert_eq!(registry.count().unwrap(), 1);
    }

    #[test]
    fn test_unnamed_boxes_never_collide() {
        let registry = BoxRegistry::new();
        for _ in 0..3 {
            registry.register(config(None), stub_context()).unwrap();
        }
        assert_eq!(registry.count().unwrap(), 3);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = BoxRegistry::new();
        assert!(matches!(
            registry.lookup("nope"),
            Err(CellboxError::NotFound(_))
        ));
        assert!(matches!(registry.lookup(""), Err(CellboxError::NotFound(_))));
    }

    #[test]
    fn test_lookup_ambiguous_prefix() {
        let registry = BoxRegistry::new();
        registry.register(config(None), stub_context()).unwrap();
        registry.register(config(None), stub_context()).unwrap();

        let ids: Vec<BoxID> = registry
            .snapshot()
            .unwrap()
            .iter()
            .map(|b| b.id().clone())
            .collect();
        // Ids created moments apart share their leading timestamp characters.
        let common = ids[0]
            .as_str()
            .chars()
            .zip(ids[1].as_str().chars())
            .take_while(|(a, b)| a == b)
            .count();
        assert!(common > 0);

        let prefix = &ids[0].as_str()[..common];
        assert!(matches!(
            registry.lookup(prefix),
            Err(CellboxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_list_newest_first() {
        let registry = BoxRegistry::new();
        let first = registry.register(config(None), stub_context()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = registry.register(config(None), stub_context()).unwrap();

        let list = registry.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(&list[0].id, second.id());
        assert_eq!(&list[1].id, first.id());
    }

    #[tokio::test]
    async fn test_remove_created_requires_force() {
        let registry = BoxRegistry::new();
        let registered = registry.register(config(Some("web")), stub_context()).unwrap();

        let err = registry.remove("web", false).await.unwrap_err();
        assert!(matches!(err, CellboxError::InvalidState(_)));
        assert_eq!(registry.count().unwrap(), 1);

        registry.remove("web", true).await.unwrap();
        assert_eq!(registry.count().unwrap(), 0);
        assert!(!registry.contains_name("web").unwrap());
        assert!(registered.is_removed());
    }

    #[tokio::test]
    async fn test_remove_missing() {
        let registry = BoxRegistry::new();
        assert!(matches!(
            registry.remove("ghost", true).await,
            Err(CellboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_name_reusable_after_remove() {
        let registry = BoxRegistry::new();
        registry.register(config(Some("web")), stub_context()).unwrap();
        registry.remove("web", true).await.unwrap();

        registry.register(config(Some("web")), stub_context()).unwrap();
        assert_eq!(registry.count().unwrap(), 1);
    }
}
