//! Watch and worker tasks, one pair per watched kind.
//!
//! The watch task feeds a [`Store`] and queues the keys of changed objects; the worker diffs the
//! store against what it already processed and hands the resulting change to a [`Handler`].

use crate::{
    change::{Change, Tracker},
    keys,
    queue::{Backoff, Queue},
    store::Store,
};
use futures::{StreamExt, TryStreamExt};
use kube::{Api, Resource, runtime::watcher};
use log::{debug, error, info, warn};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Processes changes of one kind of objects.
pub trait Handler<K>: Send + Sync + 'static {
    fn handle(
        &self,
        key: &keys::Object,
        change: Change<K>,
    ) -> impl Future<Output = eyre::Result<()>> + Send;
}

pub struct Controller<K> {
    pub kind: &'static str,
    pub store: Store<K>,
    pub queue: Queue<keys::Object>,
}

impl<K> Clone for Controller<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            store: self.store.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<K> Controller<K>
where
    K: Resource + Clone + serde::de::DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, store: Store<K>, backoff: Backoff) -> Self {
        Self {
            kind,
            store,
            queue: Queue::new(backoff),
        }
    }

    pub fn watch(&self, api: Api<K>, watcher_config: watcher::Config) -> JoinHandle<()> {
        tokio::spawn(watch_to_queue(
            api,
            watcher_config,
            self.store.clone(),
            self.queue.clone(),
        ))
    }

    /// Processes queued keys until the queue is shut down. Failed changes are retried with
    /// backoff, at most `max_retries` times.
    pub async fn work<H: Handler<K>>(self, handler: Arc<H>, max_retries: u32) -> eyre::Result<()> {
        let kind = self.kind;
        let mut tracker = Tracker::new();
        let mut retries: Vec<JoinHandle<()>> = Vec::new();

        while let Some(key) = self.queue.get().await {
            retries.retain(|h| !h.is_finished());
            let current = self.store.get(&key).await;

            if let Some(change) = tracker.check(&key, current) {
                debug!("{kind} {key}: {}", change.kind);

                match handler.handle(&key, change.clone()).await {
                    Ok(()) => {
                        tracker.done(&key, &change);
                        self.queue.forget(&key).await;
                    }
                    Err(e) => {
                        let requeues = self.queue.num_requeues(&key).await;
                        if requeues < max_retries {
                            warn!("{kind} {key}: failed (attempt {}), will retry: {e}", requeues + 1);
                            retries.push(self.queue.add_rate_limited(key.clone()).await);
                        } else {
                            report_dropped(kind, &key, max_retries, &e);
                            self.queue.forget(&key).await;
                        }
                    }
                }
            }

            self.queue.done(&key).await;
        }

        // the queue is shut down, pending retries can't be queued anymore
        if !retries.is_empty() {
            debug!("{kind}: cancelling {} pending retries", retries.len());
        }
        for retry in retries {
            retry.abort();
            let _ = retry.await;
        }

        info!("{kind} worker stopped");
        Ok(())
    }
}

/// The change is abandoned until the object changes again.
fn report_dropped(kind: &str, key: &keys::Object, retries: u32, e: &eyre::Report) {
    error!("{kind} {key}: failed after {retries} retries, dropped: {e:?}");
}

async fn watch_to_queue<K>(
    api: Api<K>,
    watcher_config: watcher::Config,
    store: Store<K>,
    queue: Queue<keys::Object>,
) where
    K: Resource + Clone + serde::de::DeserializeOwned + Debug + Send + Sync + 'static,
{
    let resource = api.resource_url().to_string();
    info!("starting watch on {resource}");

    let mut watcher = watcher(api, watcher_config).boxed();

    loop {
        let event = match watcher.try_next().await {
            Ok(v) => v,
            Err(e) => {
                error!("watch error: {resource}: {e}");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(event) = event else {
            info!("watch on {resource} stopped");
            queue.shut_down().await;
            return;
        };

        for key in store.ingest(event).await {
            queue.add(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::runtime::watcher::Event;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, crate::change::Kind)>>,
        failures: Mutex<u32>,
    }

    impl Handler<Namespace> for Recorder {
        async fn handle(&self, key: &keys::Object, change: Change<Namespace>) -> eyre::Result<()> {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(eyre::format_err!("injected failure"));
            }
            self.seen.lock().await.push((key.to_string(), change.kind));
            Ok(())
        }
    }

    fn ns(name: &str, rv: &str) -> Namespace {
        serde_json::from_value(json!({"metadata": {"name": name, "resourceVersion": rv}})).unwrap()
    }

    fn controller() -> Controller<Namespace> {
        let backoff = Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(10),
        };
        Controller::new("namespace", Store::new(), backoff)
    }

    async fn feed(ctl: &Controller<Namespace>, event: Event<Namespace>) {
        for key in ctl.store.ingest(event).await {
            ctl.queue.add(key).await;
        }
    }

    #[tokio::test]
    async fn test_changes_reach_handler() {
        use crate::change::Kind::*;

        let ctl = controller();
        let handler = Arc::new(Recorder::default());

        feed(&ctl, Event::Init).await;
        feed(&ctl, Event::InitApply(ns("ns1", "1"))).await;
        feed(&ctl, Event::InitDone).await;
        feed(&ctl, Event::Apply(ns("ns1", "2"))).await;
        feed(&ctl, Event::Delete(ns("ns1", "2"))).await;
        ctl.queue.shut_down().await;

        ctl.clone().work(handler.clone(), 5).await.unwrap();

        // coalesced: the object is already gone when the worker looks at it
        let seen = handler.seen.lock().await.clone();
        assert!(seen.is_empty(), "{seen:?}");

        let ctl = controller();
        feed(&ctl, Event::Apply(ns("ns2", "1"))).await;
        let worker = tokio::spawn(ctl.clone().work(handler.clone(), 5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed(&ctl, Event::Delete(ns("ns2", "1"))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctl.queue.shut_down().await;
        worker.await.unwrap().unwrap();

        let seen = handler.seen.lock().await.clone();
        assert_eq!(
            seen,
            [("ns2".to_string(), Added), ("ns2".to_string(), Deleted)]
        );
    }

    #[tokio::test]
    async fn test_retries() {
        let ctl = controller();
        let handler = Arc::new(Recorder::default());
        *handler.failures.lock().await = 2;

        feed(&ctl, Event::Apply(ns("ns1", "1"))).await;
        let worker = tokio::spawn(ctl.clone().work(handler.clone(), 5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctl.queue.shut_down().await;
        worker.await.unwrap().unwrap();

        assert_eq!(handler.seen.lock().await.len(), 1);
        assert_eq!(ctl.queue.num_requeues(&keys::Object::new("", "ns1")).await, 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let ctl = controller();
        let handler = Arc::new(Recorder::default());
        *handler.failures.lock().await = 100;

        feed(&ctl, Event::Apply(ns("ns1", "1"))).await;
        let worker = tokio::spawn(ctl.clone().work(handler.clone(), 3));
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctl.queue.shut_down().await;
        worker.await.unwrap().unwrap();

        // 1 try + 3 retries
        assert_eq!(*handler.failures.lock().await, 96);
        assert!(handler.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_retry_cancelled_on_stop() {
        let ctl = Controller::new(
            "namespace",
            Store::new(),
            Backoff {
                base: Duration::from_secs(60),
                max: Duration::from_secs(60),
            },
        );
        let handler = Arc::new(Recorder::default());
        *handler.failures.lock().await = 1;

        feed(&ctl, Event::Apply(ns("ns1", "1"))).await;
        let worker = tokio::spawn(ctl.clone().work(handler.clone(), 5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctl.queue.num_requeues(&keys::Object::new("", "ns1")).await, 1);

        ctl.queue.shut_down().await;
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // nothing but this controller still holds the queue
        assert_eq!(ctl.queue.holders(), 1);
        assert!(handler.seen.lock().await.is_empty());
    }
}
