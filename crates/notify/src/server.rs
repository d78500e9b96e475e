use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use fleet_core::{Backoff, Config, FleetError, FleetResult};
use futures::{Stream, StreamExt};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::filter::{AggregateFilter, Filters};
use crate::{EventStream, NotifyType, ReadyNotifyClient, StatusNotification, StatusNotifyHelpers, StatusRegistration};

struct Subscriber {
    reg: StatusRegistration,
    tx: watch::Sender<Option<StatusNotification>>,
    last: Option<StatusNotification>,
}

impl Subscriber {
    /// Hand `n` to the subscriber unless it equals the last one sent.
    fn deliver(&mut self, n: StatusNotification) -> bool {
        if self.last.as_ref() == Some(&n) {
            counter!("notify_dedup_total", 1u64);
            return false;
        }
        self.tx.send_replace(Some(n.clone()));
        self.last = Some(n);
        counter!("notify_sent_total", 1u64);
        true
    }
}

#[derive(Default)]
struct WatchState {
    subscribers: BTreeMap<String, Subscriber>,
}

/// Bookkeeping of one watched context: its subscribers, their aggregate
/// filters and the stop signal of its pump.
struct ContextWatch {
    id: String,
    state: tokio::sync::Mutex<WatchState>,
    filters: ArcSwap<Filters>,
    stop: CancellationToken,
}

impl ContextWatch {
    fn new(id: &str) -> Self {
        Self { id: id.to_string(), state: Default::default(), filters: ArcSwap::from_pointee(Filters::default()), stop: CancellationToken::new() }
    }

    /// Must be called with the state lock held.
    fn recompute(&self, st: &WatchState) {
        let f = Filters::compute(st.subscribers.values().map(|s| &s.reg));
        debug!(ctx = %self.id, ready = f.ready.is_some(), deployed = f.deployed.is_some(), "notify: filters recomputed");
        self.filters.store(Arc::new(f));
    }
}

struct ClientEntry {
    context_id: String,
    token: CancellationToken,
    /// Tells a reused client id apart from the registration that held it before.
    serial: u64,
}

#[derive(Default)]
struct Registry {
    clients: FxHashMap<String, ClientEntry>,
    contexts: FxHashMap<String, Arc<ContextWatch>>,
}

struct Inner {
    name: String,
    helpers: Arc<dyn StatusNotifyHelpers>,
    upstream: Arc<dyn ReadyNotifyClient>,
    debounce: Duration,
    backoff: Backoff,
    registry: Mutex<Registry>,
    serial: AtomicU64,
}

/// Multiplexes status subscribers onto one upstream change feed per context.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct StatusNotifyServer {
    inner: Arc<Inner>,
}

/// A subscriber's notifications. Only the latest undelivered notification is
/// kept. Dropping the stream deregisters the subscriber.
pub struct StatusStream {
    client_id: String,
    rx: watch::Receiver<Option<StatusNotification>>,
    _guard: DropGuard,
}

impl StatusStream {
    pub fn client_id(&self) -> &str { &self.client_id }

    /// Next notification; `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<StatusNotification> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(n) = self.rx.borrow_and_update().clone() {
                return Some(n);
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StatusNotification> + Send + 'static {
        futures::stream::unfold(self, |mut s| async move { s.next().await.map(|n| (n, s)) })
    }
}

impl StatusNotifyServer {
    pub fn new(name: impl Into<String>, helpers: Arc<dyn StatusNotifyHelpers>, upstream: Arc<dyn ReadyNotifyClient>, cfg: &Config) -> Self {
        let inner = Inner {
            name: name.into(),
            helpers,
            upstream,
            debounce: cfg.notify_debounce,
            backoff: cfg.notify_backoff,
            registry: Mutex::new(Registry::default()),
            serial: AtomicU64::new(0),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Add a subscriber. The first subscriber of a context opens its upstream
    /// feed; every new subscriber gets an initial notification.
    pub async fn register(&self, reg: StatusRegistration) -> FleetResult<StatusStream> {
        let client_id = reg.client_id.clone();
        if client_id.is_empty() {
            info!("notify: registration with empty client id");
            return Err(FleetError::bad_request("Invalid client ID"));
        }
        if self.inner.lock().clients.contains_key(&client_id) {
            info!(client = %client_id, "notify: duplicate registration");
            return Err(FleetError::conflict(format!("Duplicate client ID: {}", client_id)));
        }
        let context_id = self.inner.helpers.app_context_id(&reg).await?;
        let token = CancellationToken::new();
        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
        {
            let mut r = self.inner.lock();
            if r.clients.contains_key(&client_id) {
                return Err(FleetError::conflict(format!("Duplicate client ID: {}", client_id)));
            }
            r.clients.insert(client_id.clone(), ClientEntry { context_id: context_id.clone(), token: token.clone(), serial });
        }
        info!(client = %client_id, ctx = %context_id, key = %reg.key, "notify: registration");

        let rx = match self.inner.attach(reg, &context_id, &token).await {
            Ok(rx) => rx,
            Err(e) => {
                let mut r = self.inner.lock();
                if r.clients.get(&client_id).map_or(false, |c| c.serial == serial) {
                    r.clients.remove(&client_id);
                }
                return Err(e);
            }
        };

        let inner = Arc::clone(&self.inner);
        let t = token.clone();
        let id = client_id.clone();
        tokio::spawn(async move {
            t.cancelled().await;
            inner.cleanup(&id, Some(serial)).await;
        });
        Ok(StatusStream { client_id, rx, _guard: token.drop_guard() })
    }

    /// Remove a subscriber. Unknown client ids are ignored.
    pub async fn deregister(&self, client_id: &str) -> FleetResult<()> {
        self.inner.cleanup(client_id, None).await;
        Ok(())
    }

    /// Contexts that currently have an upstream feed.
    pub fn watched_contexts(&self) -> Vec<String> {
        let mut v: Vec<String> = self.inner.lock().contexts.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn filters(&self, context_id: &str) -> Option<Arc<Filters>> {
        self.inner.lock().contexts.get(context_id).map(|w| w.filters.load_full())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> { self.registry.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Live watch of `context_id`, creating one when missing or stopped.
    /// The flag tells whether the caller created it; a replaced stopped watch
    /// is returned so the caller can wait for its teardown.
    fn watch_for(&self, context_id: &str) -> (Arc<ContextWatch>, bool, Option<Arc<ContextWatch>>) {
        let mut r = self.lock();
        if let Some(w) = r.contexts.get(context_id) {
            if !w.stop.is_cancelled() {
                return (Arc::clone(w), false, None);
            }
        }
        let w = Arc::new(ContextWatch::new(context_id));
        let prev = r.contexts.insert(context_id.to_string(), Arc::clone(&w));
        (w, true, prev)
    }

    fn forget(&self, watch: &Arc<ContextWatch>) {
        let mut r = self.lock();
        if r.contexts.get(&watch.id).map_or(false, |w| Arc::ptr_eq(w, watch)) {
            r.contexts.remove(&watch.id);
        }
    }

    async fn attach(self: &Arc<Self>, reg: StatusRegistration, context_id: &str, token: &CancellationToken) -> FleetResult<watch::Receiver<Option<StatusNotification>>> {
        loop {
            let (watch, first, prev) = self.watch_for(context_id);
            if let Some(prev) = prev {
                // The old feed is unsubscribed under its state lock.
                drop(prev.state.lock().await);
            }
            let mut st = watch.state.lock().await;
            if watch.stop.is_cancelled() {
                continue;
            }
            if token.is_cancelled() {
                if first {
                    watch.stop.cancel();
                    drop(st);
                    self.forget(&watch);
                }
                return Err(FleetError::unknown(format!("registration of {} was cancelled", reg.client_id)));
            }
            if first {
                // Held lock keeps later registrants waiting until the feed is up.
                match self.open_upstream(context_id).await {
                    Ok(events) => {
                        tokio::spawn(pump(Arc::clone(self), Arc::clone(&watch), events));
                    }
                    Err(e) => {
                        warn!(ctx = %context_id, error = %e, "notify: could not open upstream feed");
                        watch.stop.cancel();
                        drop(st);
                        self.forget(&watch);
                        return Err(e);
                    }
                }
            }
            let (tx, rx) = watch::channel(None);
            let mut sub = Subscriber { reg: reg.clone(), tx, last: None };
            let q = AggregateFilter::of(&reg).query(reg.status_type);
            match self.helpers.query(&reg, &q).await {
                Ok(result) => {
                    sub.deliver(self.helpers.prepare(&reg, &result));
                }
                Err(e @ FleetError::BadRequest(_)) => {
                    // Unknown filter values would fail every later flush of this type.
                    info!(client = %reg.client_id, ctx = %context_id, error = %e, "notify: registration filter rejected");
                    if st.subscribers.is_empty() {
                        watch.stop.cancel();
                        self.unsubscribe(&watch.id).await;
                        drop(st);
                        self.forget(&watch);
                    }
                    return Err(e);
                }
                Err(e) => warn!(client = %reg.client_id, error = %e, "notify: initial status query failed"),
            }
            st.subscribers.insert(reg.client_id.clone(), sub);
            watch.recompute(&st);
            return Ok(rx);
        }
    }

    async fn open_upstream(&self, context_id: &str) -> FleetResult<EventStream> {
        let mut attempt = 0;
        loop {
            match self.upstream.alert(&self.name, context_id).await {
                Ok(events) => {
                    info!(ctx = %context_id, attempt, "notify: upstream feed open");
                    return Ok(events);
                }
                Err(e) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay(attempt);
                    warn!(ctx = %context_id, attempt, delay_ms = delay.as_millis() as u64, error = %e, "notify: upstream feed retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop a subscriber. With `serial`, only that registration is dropped.
    async fn cleanup(&self, client_id: &str, serial: Option<u64>) {
        let entry = {
            let mut r = self.lock();
            match r.clients.get(client_id) {
                Some(c) if serial.map_or(true, |s| s == c.serial) => r.clients.remove(client_id),
                _ => None,
            }
        };
        let Some(entry) = entry else { return };
        entry.token.cancel();
        let Some(watch) = self.lock().contexts.get(&entry.context_id).cloned() else { return };
        let mut st = watch.state.lock().await;
        st.subscribers.remove(client_id);
        watch.recompute(&st);
        info!(client = %client_id, ctx = %watch.id, "notify: subscriber removed");
        if st.subscribers.is_empty() && !watch.stop.is_cancelled() {
            // Still under the state lock: a registrant replacing this watch waits here.
            watch.stop.cancel();
            self.unsubscribe(&watch.id).await;
            drop(st);
            self.forget(&watch);
            info!(ctx = %watch.id, "notify: last subscriber gone, upstream feed closed");
        }
    }

    async fn unsubscribe(&self, context_id: &str) {
        if let Err(e) = self.upstream.unsubscribe(&self.name, context_id).await {
            warn!(ctx = %context_id, error = %e, "notify: upstream unsubscribe failed");
        }
    }

    /// One query per status type whose filter selects a changed app/cluster,
    /// then one notification per subscriber of that type.
    async fn flush(&self, watch: &ContextWatch, changed: &BTreeSet<(String, String)>) {
        let mut st = watch.state.lock().await;
        let filters = watch.filters.load_full();
        for t in [NotifyType::Ready, NotifyType::Deployed] {
            let Some(f) = filters.get(t) else { continue };
            if !changed.iter().any(|(app, cluster)| f.matches(app, cluster)) {
                continue;
            }
            let Some(reg) = st.subscribers.values().map(|s| &s.reg).find(|r| r.status_type == t).cloned() else { continue };
            let result = match self.helpers.query(&reg, &f.query(t)).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(ctx = %watch.id, status_type = ?t, error = %e, "notify: status query failed");
                    continue;
                }
            };
            let mut sent = 0usize;
            for sub in st.subscribers.values_mut().filter(|s| s.reg.status_type == t) {
                let n = self.helpers.prepare(&sub.reg, &result);
                if sub.deliver(n) {
                    sent += 1;
                }
            }
            debug!(ctx = %watch.id, status_type = ?t, sent, "notify: flushed");
        }
    }
}

/// Drain the upstream feed of one context until it ends or the context
/// loses its last subscriber. Flushes are spaced at least `debounce` apart.
async fn pump(inner: Arc<Inner>, watch: Arc<ContextWatch>, mut events: EventStream) {
    let mut pending: BTreeSet<(String, String)> = BTreeSet::new();
    let mut last_flush: Option<Instant> = None;
    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut armed = false;
    loop {
        tokio::select! {
            _ = watch.stop.cancelled() => { debug!(ctx = %watch.id, "notify: pump stopped"); break; }
            _ = &mut timer, if armed => {
                armed = false;
                inner.flush(&watch, &pending).await;
                pending.clear();
                last_flush = Some(Instant::now());
            }
            next = events.next() => match next {
                Some(Ok(ev)) => {
                    if ev.app_context != watch.id {
                        warn!(ctx = %watch.id, got = %ev.app_context, "notify: event for another context ignored");
                        continue;
                    }
                    pending.insert((ev.app, ev.cluster));
                    if armed {
                        continue;
                    }
                    match last_flush.map(|t| t.elapsed()) {
                        Some(elapsed) if elapsed < inner.debounce => {
                            timer.as_mut().reset(Instant::now() + (inner.debounce - elapsed));
                            armed = true;
                        }
                        _ => {
                            inner.flush(&watch, &pending).await;
                            pending.clear();
                            last_flush = Some(Instant::now());
                        }
                    }
                }
                Some(Err(e)) => { warn!(ctx = %watch.id, error = %e, "notify: upstream feed failed"); break; }
                None => { warn!(ctx = %watch.id, "notify: upstream feed closed"); break; }
            }
        }
    }
}
