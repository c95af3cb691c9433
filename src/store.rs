use crate::keys;
use kube::{Resource, runtime::watcher::Event};
use std::collections::BTreeMap as Map;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Watch-fed cache of one kind of objects, shared between the watch task and its readers.
pub struct Store<K> {
    inner: Arc<RwLock<Inner<K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                objects: Map::new(),
                relist: None,
                ready: false,
            })),
        }
    }
}

struct Inner<K> {
    objects: Map<keys::Object, Arc<K>>,
    /// objects received since the last `Init`
    relist: Option<Map<keys::Object, Arc<K>>>,
    ready: bool,
}

fn key_of<K: Resource>(v: &K) -> Option<keys::Object> {
    keys::Object::try_from(v.meta()).ok()
}

fn same_version<K: Resource>(a: &K, b: &K) -> bool {
    let (a, b) = (&a.meta().resource_version, &b.meta().resource_version);
    a.is_some() && a == b
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.ready
    }

    pub async fn get(&self, key: &keys::Object) -> Option<Arc<K>> {
        self.inner.read().await.objects.get(key).cloned()
    }

    /// Objects for which `filter` holds.
    pub async fn list(&self, filter: impl Fn(&K) -> bool) -> Vec<Arc<K>> {
        let inner = self.inner.read().await;
        (inner.objects.values())
            .filter(|v| filter(v))
            .cloned()
            .collect()
    }

    /// Applies a watch event, returning the keys of the objects it changed.
    ///
    /// A relist (`Init` to `InitDone`) is applied at once on `InitDone`: objects missing from
    /// the new listing are removed then.
    pub async fn ingest(&self, event: Event<K>) -> Vec<keys::Object> {
        let mut inner = self.inner.write().await;

        use Event::*;
        match event {
            Init => {
                inner.relist = Some(Map::new());
                vec![]
            }
            InitApply(v) => {
                let Some(key) = key_of(&v) else {
                    return vec![];
                };
                inner.relist.get_or_insert_with(Map::new).insert(key, Arc::new(v));
                vec![]
            }
            InitDone => {
                let mut listed = inner.relist.take().unwrap_or_default();
                let mut changed = Vec::new();

                for (key, v) in listed.iter_mut() {
                    match inner.objects.get(key) {
                        // keep the known object so readers see no change
                        Some(prev) if same_version(prev.as_ref(), v.as_ref()) => *v = prev.clone(),
                        _ => changed.push(key.clone()),
                    }
                }
                for key in inner.objects.keys() {
                    if !listed.contains_key(key) {
                        changed.push(key.clone());
                    }
                }

                inner.objects = listed;
                inner.ready = true;
                changed
            }
            Apply(v) => {
                let Some(key) = key_of(&v) else {
                    return vec![];
                };
                if let Some(prev) = inner.objects.get(&key)
                    && same_version(prev.as_ref(), &v)
                {
                    return vec![];
                }
                inner.objects.insert(key.clone(), Arc::new(v));
                vec![key]
            }
            Delete(v) => {
                let Some(key) = key_of(&v) else {
                    return vec![];
                };
                match inner.objects.remove(&key) {
                    Some(_) => vec![key],
                    None => vec![],
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn from_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        store.ingest(Event::Init).await;
        for v in objects {
            store.ingest(Event::InitApply(v)).await;
        }
        store.ingest(Event::InitDone).await;
        store
    }
}
