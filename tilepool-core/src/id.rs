//! # IDs
//! Process-unique identities, namespaced by a marker type `T`. Two `UniqueID`s compare equal only
//! if they were handed out by the same call, which is exactly the "same interned identity" notion
//! used for pixel formats and canvases. There is no deep equality on anything keyed by these.
//!
//! Use `UniqueID::default()` to acquire a fresh one.

// One counter per namespace. Namespaces are created a handful of times per process, so the
// write path of this lock is practically never taken after startup.
static ID_SERVER: parking_lot::RwLock<
    std::collections::BTreeMap<std::any::TypeId, std::sync::atomic::AtomicU64>,
> = parking_lot::const_rwlock(std::collections::BTreeMap::new());

/// ID that is guaranteed unique within this execution of the program.
/// IDs with different marker types may share a numeric value but are never comparable.
pub struct UniqueID<T: std::any::Any> {
    id: std::num::NonZeroU64,
    _phantom: std::marker::PhantomData<T>,
}
impl<T: std::any::Any> Clone for UniqueID<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: std::any::Any> Copy for UniqueID<T> {}
impl<T: std::any::Any> PartialEq for UniqueID<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T: std::any::Any> Eq for UniqueID<T> {}
impl<T: std::any::Any> PartialOrd for UniqueID<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: std::any::Any> Ord for UniqueID<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
impl<T: std::any::Any> std::hash::Hash for UniqueID<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
// Safety - only a u64 is stored. T is a marker and never instantiated.
unsafe impl<T: std::any::Any> Send for UniqueID<T> {}
unsafe impl<T: std::any::Any> Sync for UniqueID<T> {}

impl<T: std::any::Any> UniqueID<T> {
    /// Get the raw numeric value of this ID.
    /// IDs from differing namespaces may share the same numeric ID!
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id.get()
    }
    fn next() -> Self {
        let ty = std::any::TypeId::of::<T>();
        let id = {
            let read = ID_SERVER.upgradable_read();
            if let Some(counter) = read.get(&ty) {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            } else {
                let mut write = parking_lot::RwLockUpgradableReadGuard::upgrade(read);
                // Start at two, as this call takes ID 1.
                write.insert(ty, 2.into());
                1
            }
        };
        match std::num::NonZeroU64::new(id) {
            Some(id) => Self {
                id,
                _phantom: std::marker::PhantomData,
            },
            // Wrapped around after u64::MAX allocations. Uniqueness is gone for good.
            None => {
                log::error!("{} ID overflow! Aborting!", std::any::type_name::<T>());
                log::logger().flush();
                std::process::abort();
            }
        }
    }
}
impl<T: std::any::Any> Default for UniqueID<T> {
    /// Allocate a new, unique ID.
    fn default() -> Self {
        Self::next()
    }
}
impl<T: std::any::Any> std::fmt::Display for UniqueID<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only the last segment of the marker's path, to keep logs readable.
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "{}#{}", short.trim_end_matches("Marker"), self.id)
    }
}
impl<T: std::any::Any> std::fmt::Debug for UniqueID<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::UniqueID;

    // Tests share the global ID server, so each uses its own namespace.

    #[test]
    fn unique() {
        struct Namespace;
        type TestID = UniqueID<Namespace>;

        let mut v: Vec<_> = (0..1024).map(|_| TestID::default()).collect();
        v.sort_unstable();
        let length_before = v.len();
        v.dedup();
        assert_eq!(length_before, v.len(), "had duplicate ids");
    }
    #[test]
    fn copies_are_equal() {
        struct Namespace;
        type TestID = UniqueID<Namespace>;

        let a = TestID::default();
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, TestID::default());
    }
    #[test]
    fn threaded() {
        struct Namespace;
        type TestID = UniqueID<Namespace>;

        let mut all: Vec<TestID> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| (0..256).map(|_| TestID::default()).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1024);
    }
    #[test]
    fn display_names_namespace() {
        struct WidgetMarker;
        let id = UniqueID::<WidgetMarker>::default();
        assert_eq!(id.to_string(), format!("Widget#{}", id.id()));
    }
}
