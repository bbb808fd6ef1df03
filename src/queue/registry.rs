//! # Queue Registry
//!
//! Process-wide owner of every queue instance. Queues are declared in a
//! catalog at `configure` time and created lazily, on the first typed
//! `get_queue` for their name. A name binds to exactly one element type for
//! its lifetime: the registry refuses a second request with a different type.

use super::{DequeQueue, MpmcQueue, Queue, QueueBase, QueueStats, SpscQueue};
use crate::config::{QueueConfig, QueueType};
use crate::error::{FabricError, FabricResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use tracing::debug;

struct QueueEntry {
    config: QueueConfig,
    /// Element type name, kept for the type-mismatch diagnostic.
    type_name: &'static str,
    /// `Arc<dyn Queue<T>>` behind `Any`; the typed accessor downcasts it.
    instance: Box<dyn Any + Send + Sync>,
    /// Type-independent view for telemetry.
    base: Arc<dyn QueueBase>,
}

#[derive(Default)]
struct RegistryState {
    configured: bool,
    configs: Vec<QueueConfig>,
    instances: HashMap<String, QueueEntry>,
}

/// The singleton registry. Obtain it with [`QueueRegistry::get`].
pub struct QueueRegistry {
    state: Mutex<RegistryState>,
}

static INSTANCE: OnceLock<QueueRegistry> = OnceLock::new();

impl QueueRegistry {
    pub fn get() -> &'static QueueRegistry {
        INSTANCE.get_or_init(|| QueueRegistry {
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Record the queue catalog. Fails with *already-configured* on a second
    /// call without an intervening [`QueueRegistry::reset`].
    pub fn configure(&self, configs: Vec<QueueConfig>) -> FabricResult<()> {
        let mut state = self.state.lock();
        if state.configured {
            return Err(FabricError::AlreadyConfigured("QueueRegistry"));
        }
        debug!("configuring queue registry with {} queues", configs.len());
        state.configs = configs;
        state.configured = true;
        Ok(())
    }

    /// Typed access to a queue by name, creating it from the catalog on
    /// first use.
    pub fn get_queue<T: Send + 'static>(&self, name: &str) -> FabricResult<Arc<dyn Queue<T>>> {
        let mut state = self.state.lock();

        if let Some(entry) = state.instances.get(name) {
            return match entry.instance.downcast_ref::<Arc<dyn Queue<T>>>() {
                Some(queue) => Ok(Arc::clone(queue)),
                None => Err(FabricError::TypeMismatch {
                    name: name.to_string(),
                    requested: std::any::type_name::<T>().to_string(),
                    bound: entry.type_name.to_string(),
                }),
            };
        }

        let config = state
            .configs
            .iter()
            .find(|c| c.id.uid == name)
            .cloned()
            .ok_or_else(|| FabricError::QueueNotFound {
                name: name.to_string(),
                data_type: std::any::type_name::<T>().to_string(),
            })?;

        let (queue, base) = create_queue::<T>(&config)?;
        debug!(
            "created {} queue '{}' with capacity {}",
            config.queue_type, name, config.capacity
        );
        state.instances.insert(
            name.to_string(),
            QueueEntry {
                config,
                type_name: std::any::type_name::<T>(),
                instance: Box::new(Arc::clone(&queue)),
                base,
            },
        );
        Ok(queue)
    }

    /// Whether the catalog declares a queue for `(uid, data_type)`. Used by
    /// the IO manager to pick between queue and network backings.
    pub fn has_queue(&self, uid: &str, data_type: &str) -> bool {
        self.state
            .lock()
            .configs
            .iter()
            .any(|c| c.id.uid == uid && c.id.data_type == data_type)
    }

    /// Data types declared for a uid in the catalog.
    pub fn get_datatypes(&self, uid: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .configs
            .iter()
            .filter(|c| c.id.uid == uid)
            .map(|c| c.id.data_type.clone())
            .collect()
    }

    /// Catalog entry for a uid, if declared. The queue receiver uses this
    /// for its cross-session guard.
    pub fn queue_config(&self, uid: &str) -> Option<QueueConfig> {
        self.state
            .lock()
            .configs
            .iter()
            .find(|c| c.id.uid == uid)
            .cloned()
    }

    /// Counter snapshots for every instantiated queue.
    pub fn gather_stats(&self) -> Vec<(String, QueueStats)> {
        self.state
            .lock()
            .instances
            .values()
            .map(|e| (e.config.id.uid.clone(), e.base.stats()))
            .collect()
    }

    /// Drop all instances and the catalog. Test hook; idempotent.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.instances.clear();
        state.configs.clear();
        state.configured = false;
    }
}

fn create_queue<T: Send + 'static>(
    config: &QueueConfig,
) -> FabricResult<(Arc<dyn Queue<T>>, Arc<dyn QueueBase>)> {
    let name = config.id.uid.clone();
    let capacity = config.capacity as usize;
    match config.queue_type {
        QueueType::Deque => {
            let q = Arc::new(DequeQueue::new(name, capacity));
            let typed: Arc<dyn Queue<T>> = q.clone();
            let base: Arc<dyn QueueBase> = q;
            Ok((typed, base))
        }
        QueueType::Spsc => {
            let q = Arc::new(SpscQueue::new(name, capacity));
            let typed: Arc<dyn Queue<T>> = q.clone();
            let base: Arc<dyn QueueBase> = q;
            Ok((typed, base))
        }
        QueueType::Mpmc => {
            let q = Arc::new(MpmcQueue::new(name, capacity));
            let typed: Arc<dyn Queue<T>> = q.clone();
            let base: Arc<dyn QueueBase> = q;
            Ok((typed, base))
        }
        QueueType::Unknown => Err(FabricError::QueueTypeUnknown(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionId;
    use crate::test_support::GLOBAL_LOCK;
    use std::time::Duration;

    fn catalog() -> Vec<QueueConfig> {
        vec![
            QueueConfig {
                id: ConnectionId::new("ints", "int"),
                queue_type: QueueType::Spsc,
                capacity: 10,
            },
            QueueConfig {
                id: ConnectionId::new("strings", "string"),
                queue_type: QueueType::Deque,
                capacity: 4,
            },
            QueueConfig {
                id: ConnectionId::new("broken", "int"),
                queue_type: QueueType::Unknown,
                capacity: 4,
            },
        ]
    }

    #[test]
    fn lazy_creation_and_reuse() {
        let _guard = GLOBAL_LOCK.lock();
        let registry = QueueRegistry::get();
        registry.reset();
        registry.configure(catalog()).unwrap();

        let q1 = registry.get_queue::<i32>("ints").unwrap();
        let q2 = registry.get_queue::<i32>("ints").unwrap();
        q1.push(7, Duration::from_millis(10)).unwrap();
        assert_eq!(q2.pop(Duration::from_millis(10)).unwrap(), 7);

        registry.reset();
    }

    #[test]
    fn second_type_for_a_name_is_a_mismatch() {
        let _guard = GLOBAL_LOCK.lock();
        let registry = QueueRegistry::get();
        registry.reset();
        registry.configure(catalog()).unwrap();

        registry.get_queue::<i32>("ints").unwrap();
        let err = registry.get_queue::<String>("ints").unwrap_err();
        assert!(matches!(err, FabricError::TypeMismatch { .. }));

        registry.reset();
    }

    #[test]
    fn unknown_name_and_unknown_kind() {
        let _guard = GLOBAL_LOCK.lock();
        let registry = QueueRegistry::get();
        registry.reset();
        registry.configure(catalog()).unwrap();

        assert!(matches!(
            registry.get_queue::<i32>("missing").unwrap_err(),
            FabricError::QueueNotFound { .. }
        ));
        assert!(matches!(
            registry.get_queue::<i32>("broken").unwrap_err(),
            FabricError::QueueTypeUnknown(_)
        ));

        registry.reset();
    }

    #[test]
    fn double_configure_is_rejected_until_reset() {
        let _guard = GLOBAL_LOCK.lock();
        let registry = QueueRegistry::get();
        registry.reset();

        registry.configure(catalog()).unwrap();
        assert!(matches!(
            registry.configure(catalog()).unwrap_err(),
            FabricError::AlreadyConfigured(_)
        ));

        registry.reset();
        registry.configure(catalog()).unwrap();
        registry.reset();
    }

    #[test]
    fn catalog_introspection() {
        let _guard = GLOBAL_LOCK.lock();
        let registry = QueueRegistry::get();
        registry.reset();
        registry.configure(catalog()).unwrap();

        assert!(registry.has_queue("ints", "int"));
        assert!(!registry.has_queue("ints", "string"));
        assert!(!registry.has_queue("nope", "int"));

        let types = registry.get_datatypes("strings");
        assert_eq!(types.into_iter().collect::<Vec<_>>(), vec!["string"]);

        registry.reset();
    }

    #[test]
    fn stats_cover_instantiated_queues() {
        let _guard = GLOBAL_LOCK.lock();
        let registry = QueueRegistry::get();
        registry.reset();
        registry.configure(catalog()).unwrap();

        let q = registry.get_queue::<i32>("ints").unwrap();
        q.push(1, Duration::from_millis(10)).unwrap();

        let stats = registry.gather_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "ints");
        assert_eq!(stats[0].1.pushed, 1);

        registry.reset();
    }
}
