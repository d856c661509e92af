//! State synchronization engine.
//!
//! Owns the cached workspace collection and decides when to refresh it. At most
//! one poll timer is armed at a time: a fast timer while any workspace is
//! transitional, otherwise a slow background timer while the consuming surface is
//! visible. Fetches are serialized through `fetch_lock`, and every publish
//! replaces the whole collection at once.

pub mod view;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{Config, SyncConfig};
use crate::directory::{Enrichment, WorkspaceDirectory};
use crate::error::{ErrorKind, SpaceError};
use crate::workspace::{StateFilter, Workspace};

pub use view::{build_view, Filter, RepositoryGroup};

/// Which poll timer, if any, is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Idle,
    Fast,
    Background,
}

impl std::fmt::Display for PollMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollMode::Idle => write!(f, "idle"),
            PollMode::Fast => write!(f, "fast"),
            PollMode::Background => write!(f, "background"),
        }
    }
}

/// Whether remote operations are possible at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No refresh has completed its checks yet.
    Unknown,
    Ready,
    NotInstalled,
    NotAuthenticated,
    ScopeRequired,
}

impl Readiness {
    fn from_error(err: &SpaceError) -> Option<Self> {
        match err {
            SpaceError::NotInstalled => Some(Readiness::NotInstalled),
            SpaceError::NotAuthenticated => Some(Readiness::NotAuthenticated),
            SpaceError::ScopeRequired { .. } => Some(Readiness::ScopeRequired),
            _ => None,
        }
    }
}

/// Cloneable record of an error surfaced by a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncIssue {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SpaceError> for SyncIssue {
    fn from(err: &SpaceError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Change notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Loading,
    Refreshed { total: usize, transitional: usize },
    Failed(SyncIssue),
    /// Filter changed; the cached collection did not.
    ViewChanged,
    PollModeChanged(PollMode),
}

/// Filtered and grouped view of the cache at one instant.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub loading: bool,
    pub readiness: Readiness,
    pub last_error: Option<SyncIssue>,
    pub groups: Vec<RepositoryGroup>,
    /// Size of the unfiltered collection.
    pub total: usize,
    pub poll_mode: PollMode,
    pub refreshed_at: Option<DateTime<Utc>>,
}

struct SyncState {
    loading: bool,
    readiness: Readiness,
    last_error: Option<SyncIssue>,
    workspaces: Vec<Workspace>,
    filter: Filter,
    refreshed_at: Option<DateTime<Utc>>,
}

struct Poller {
    mode: PollMode,
    /// Bumped whenever the armed timer is replaced or cleared.
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    directory: Arc<dyn WorkspaceDirectory>,
    config: SyncConfig,
    required_scope: String,
    state: RwLock<SyncState>,
    fetch_lock: tokio::sync::Mutex<()>,
    poller: Mutex<Poller>,
    events: broadcast::Sender<SyncEvent>,
    visible: AtomicBool,
    disposed: AtomicBool,
}

/// Handle to the engine. Clones share the same cache and timers.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(directory: Arc<dyn WorkspaceDirectory>, config: &Config) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                directory,
                config: config.sync.clone(),
                required_scope: config.gh.required_scope.clone(),
                state: RwLock::new(SyncState {
                    loading: false,
                    readiness: Readiness::Unknown,
                    last_error: None,
                    workspaces: Vec::new(),
                    filter: Filter::default(),
                    refreshed_at: None,
                }),
                fetch_lock: tokio::sync::Mutex::new(()),
                poller: Mutex::new(Poller {
                    mode: PollMode::Idle,
                    generation: 0,
                    handle: None,
                }),
                events,
                visible: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Mark the surface visible and run the first refresh.
    pub async fn start(&self) {
        self.set_visible(true).await;
    }

    /// Clear all timers. Later refreshes are ignored.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.disarm();
        debug!("sync engine disposed");
    }

    /// Full reload, then re-arm polling from the fresh data.
    ///
    /// Any armed timer is cleared first so its callback cannot race this write.
    pub async fn refresh(&self) {
        if self.inner.is_disposed() {
            return;
        }
        self.inner.disarm();
        let any_transitional = {
            let _fetch = self.inner.fetch_lock.lock().await;
            self.inner.reload().await
        };
        Inner::rearm(&self.inner, any_transitional);
    }

    /// Schedule a refresh without waiting for it.
    pub fn request_refresh(&self) {
        let engine = self.clone();
        tokio::spawn(async move { engine.refresh().await });
    }

    pub async fn set_visible(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::SeqCst);
        if visible {
            self.refresh().await;
        } else if self.poll_mode() == PollMode::Background {
            self.inner.disarm();
        }
    }

    pub async fn set_filter_text(&self, text: impl Into<String>) {
        self.inner.state.write().await.filter.text = text.into();
        self.inner.emit(SyncEvent::ViewChanged);
    }

    pub async fn set_filter_state(&self, state: StateFilter) {
        self.inner.state.write().await.filter.state = state;
        self.inner.emit(SyncEvent::ViewChanged);
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        let state = self.inner.state.read().await;
        SyncSnapshot {
            loading: state.loading,
            readiness: state.readiness,
            last_error: state.last_error.clone(),
            groups: build_view(&state.workspaces, &state.filter),
            total: state.workspaces.len(),
            poll_mode: self.poll_mode(),
            refreshed_at: state.refreshed_at,
        }
    }

    /// The unfiltered cached collection.
    pub async fn workspaces(&self) -> Vec<Workspace> {
        self.inner.state.read().await.workspaces.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn poll_mode(&self) -> PollMode {
        self.inner.poller().mode
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn poller(&self) -> MutexGuard<'_, Poller> {
        self.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_mode(&self, poller: &mut Poller, mode: PollMode) {
        if poller.mode != mode {
            poller.mode = mode;
            debug!(mode = %mode, "poll mode changed");
            self.emit(SyncEvent::PollModeChanged(mode));
        }
    }

    /// Abort the armed timer, if any, and invalidate its generation.
    fn disarm(&self) {
        let mut poller = self.poller();
        poller.generation += 1;
        if let Some(handle) = poller.handle.take() {
            handle.abort();
        }
        self.set_mode(&mut poller, PollMode::Idle);
    }

    /// Replace whatever timer is armed with one matching the cached data.
    fn rearm(this: &Arc<Self>, any_transitional: bool) {
        let mode = if this.is_disposed() {
            PollMode::Idle
        } else if any_transitional {
            PollMode::Fast
        } else if this.visible.load(Ordering::SeqCst) {
            PollMode::Background
        } else {
            PollMode::Idle
        };

        let mut poller = this.poller();
        poller.generation += 1;
        if let Some(handle) = poller.handle.take() {
            handle.abort();
        }
        let delay = match mode {
            PollMode::Idle => {
                this.set_mode(&mut poller, PollMode::Idle);
                return;
            }
            PollMode::Fast => this.config.fast_interval(),
            PollMode::Background => this.config.background_interval(),
        };
        let generation = poller.generation;
        let weak = Arc::downgrade(this);
        poller.handle = Some(tokio::spawn(Self::timer(weak, generation, delay)));
        this.set_mode(&mut poller, mode);
    }

    async fn timer(weak: Weak<Self>, generation: u64, delay: Duration) {
        tokio::time::sleep(delay).await;
        let Some(this) = weak.upgrade() else {
            return;
        };
        {
            let mut poller = this.poller();
            if poller.generation != generation {
                return;
            }
            // Detach our own handle so re-arming below cannot abort this task.
            poller.handle.take();
        }
        let any_transitional = {
            let _fetch = this.fetch_lock.lock().await;
            if this.poller().generation != generation {
                debug!("poll tick superseded by explicit refresh");
                return;
            }
            this.reload().await
        };
        if this.poller().generation == generation {
            Self::rearm(&this, any_transitional);
        }
    }

    /// Run the full reload and publish the result. Callers hold `fetch_lock`.
    ///
    /// Returns whether the published collection has any transitional workspace.
    async fn reload(&self) -> bool {
        self.state.write().await.loading = true;
        self.emit(SyncEvent::Loading);

        if !self.directory.check_installed().await {
            return self.publish_failure(SpaceError::NotInstalled).await;
        }
        match self.directory.check_auth().await {
            Ok(status) if !status.authenticated => {
                return self.publish_failure(SpaceError::NotAuthenticated).await;
            }
            Ok(status) if !status.has_required_scope => {
                return self
                    .publish_failure(SpaceError::ScopeRequired {
                        scope: self.required_scope.clone(),
                    })
                    .await;
            }
            Ok(_) => {}
            Err(e) => return self.publish_failure(e).await,
        }

        let mut workspaces = match self.directory.list().await {
            Ok(list) => list,
            Err(e) => return self.publish_failure(e).await,
        };

        self.enrich(&mut workspaces).await;

        let total = workspaces.len();
        let transitional = workspaces
            .iter()
            .filter(|ws| ws.state.is_transitional())
            .count();
        {
            let mut state = self.state.write().await;
            state.workspaces = workspaces;
            state.readiness = Readiness::Ready;
            state.last_error = None;
            state.loading = false;
            state.refreshed_at = Some(Utc::now());
        }
        info!(total, transitional, "workspace cache refreshed");
        self.emit(SyncEvent::Refreshed {
            total,
            transitional,
        });
        transitional > 0
    }

    /// Fetch machine profiles (running and stopped) and activity (running only)
    /// concurrently. Failed fetches leave the fields unset.
    async fn enrich(&self, workspaces: &mut [Workspace]) {
        let mut tasks: JoinSet<(usize, Option<Enrichment>)> = JoinSet::new();
        for (index, ws) in workspaces.iter().enumerate() {
            let running = ws.state.is_running();
            if !running && !ws.state.is_stopped() {
                continue;
            }
            let directory = Arc::clone(&self.directory);
            let name = ws.name.clone();
            tasks.spawn(async move {
                match directory.enrichment(&name, running).await {
                    Ok(enrichment) => (index, Some(enrichment)),
                    Err(e) => {
                        debug!(workspace = %name, error = %e, "enrichment unavailable");
                        (index, None)
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Some(enrichment))) => {
                    let ws = &mut workspaces[index];
                    ws.machine = enrichment.machine;
                    if let Some(activity) = enrichment.activity {
                        ws.apply_activity(activity);
                    }
                }
                Ok((_, None)) => {}
                Err(e) => warn!(error = %e, "enrichment task failed"),
            }
        }
    }

    /// Readiness failures clear the collection; anything else keeps the
    /// previous one.
    async fn publish_failure(&self, err: SpaceError) -> bool {
        let issue = SyncIssue::from(&err);
        let any_transitional = {
            let mut state = self.state.write().await;
            if let Some(readiness) = Readiness::from_error(&err) {
                state.readiness = readiness;
                state.workspaces.clear();
            }
            state.last_error = Some(issue.clone());
            state.loading = false;
            state.workspaces.iter().any(|ws| ws.state.is_transitional())
        };
        warn!(error = %err, "workspace refresh failed");
        self.emit(SyncEvent::Failed(issue));
        any_transitional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fake::FakeDirectory;
    use crate::directory::ActivityRefinement;
    use crate::workspace::tests::make_workspace;
    use crate::workspace::MachineProfile;
    use crate::workspace::WorkspaceState;

    fn engine_with(fake: &Arc<FakeDirectory>) -> SyncEngine {
        SyncEngine::new(fake.clone(), &Config::default())
    }

    async fn wait_for(rx: &mut broadcast::Receiver<SyncEvent>, expected: SyncEvent) {
        loop {
            match rx.recv().await {
                Ok(event) if event == expected => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended before {:?}: {}", expected, e),
            }
        }
    }

    fn machine() -> MachineProfile {
        MachineProfile {
            cpus: 2,
            memory_bytes: 8 << 30,
            storage_bytes: 32 << 30,
            display_label: "2 cores".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transitional_state_arms_fast_poll_until_settled() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Starting)]);
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Available)]);
        let engine = engine_with(&fake);
        let mut rx = engine.subscribe();

        engine.set_visible(true).await;
        assert_eq!(engine.poll_mode(), PollMode::Fast);

        wait_for(&mut rx, SyncEvent::PollModeChanged(PollMode::Background)).await;
        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.poll_mode, PollMode::Background);
        assert_eq!(snapshot.groups[0].workspaces[0].state, WorkspaceState::Available);
        assert_eq!(fake.count("list"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_without_transitional_is_idle() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Shutdown)]);
        let engine = engine_with(&fake);

        engine.refresh().await;
        assert_eq!(engine.poll_mode(), PollMode::Idle);

        engine.set_visible(true).await;
        assert_eq!(engine.poll_mode(), PollMode::Background);

        engine.set_visible(false).await;
        assert_eq!(engine.poll_mode(), PollMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_poll_continues_while_hidden() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::ShuttingDown)]);
        let engine = engine_with(&fake);

        engine.set_visible(true).await;
        engine.set_visible(false).await;
        assert_eq!(engine.poll_mode(), PollMode::Fast);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_refresh_supersedes_armed_timer() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Rebuilding)]);
        let engine = engine_with(&fake);

        engine.refresh().await;
        engine.refresh().await;
        assert_eq!(fake.count("list"), 2);

        // One fast tick, not one per refresh.
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(fake.count("list"), 3);
        assert_eq!(engine.poll_mode(), PollMode::Fast);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_failure_clears_collection() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Available)]);
        let engine = engine_with(&fake);
        engine.refresh().await;
        assert_eq!(engine.snapshot().await.total, 1);

        fake.set_auth(true, false);
        engine.refresh().await;
        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.readiness, Readiness::ScopeRequired);
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.last_error.unwrap().kind, ErrorKind::Readiness);
        assert_eq!(fake.count("list"), 1);

        fake.set_installed(false);
        engine.refresh().await;
        assert_eq!(engine.snapshot().await.readiness, Readiness::NotInstalled);
        assert_eq!(fake.count("check_auth"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_error_from_list_is_classified() {
        let fake = Arc::new(FakeDirectory::new());
        fake.fail_next_list(SpaceError::NotAuthenticated);
        let engine = engine_with(&fake);
        engine.refresh().await;
        assert_eq!(engine.snapshot().await.readiness, Readiness::NotAuthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn list_failure_keeps_previous_collection() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Shutdown)]);
        let engine = engine_with(&fake);
        let mut rx = engine.subscribe();
        engine.refresh().await;

        fake.fail_next_list(SpaceError::command("gh codespace list", "HTTP 502"));
        engine.refresh().await;
        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.readiness, Readiness::Ready);
        assert_eq!(snapshot.last_error.as_ref().unwrap().kind, ErrorKind::CommandFailed);
        assert!(!snapshot.loading);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            saw_failure |= matches!(event, SyncEvent::Failed(_));
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn enrichment_degrades_per_item() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![
            make_workspace("run", "o/r", WorkspaceState::Available),
            make_workspace("stop", "o/r", WorkspaceState::Shutdown),
            make_workspace("broken", "o/r", WorkspaceState::Available),
            make_workspace("moving", "o/r", WorkspaceState::Starting),
        ]);
        fake.set_machine("run", machine());
        fake.set_machine("stop", machine());
        fake.fail_machine("broken");
        fake.set_activity(
            "run",
            ActivityRefinement {
                idle_timeout_minutes: Some(30),
                last_used_at: None,
            },
        );
        let engine = engine_with(&fake);
        engine.refresh().await;

        let all = engine.workspaces().await;
        let by_name = |n: &str| all.iter().find(|w| w.name == n).unwrap().clone();
        assert_eq!(by_name("run").machine, Some(machine()));
        assert_eq!(by_name("run").idle_timeout_minutes, Some(30));
        assert_eq!(by_name("stop").machine, Some(machine()));
        assert!(by_name("broken").machine.is_none());
        assert!(by_name("moving").machine.is_none());

        assert_eq!(fake.count("activity stop"), 0);
        assert_eq!(fake.count("machine moving"), 0);
        assert_eq!(fake.count("activity broken"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn filters_apply_without_fetch() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![
            make_workspace("alpha", "o/one", WorkspaceState::Available),
            make_workspace("beta", "o/two", WorkspaceState::Shutdown),
        ]);
        let engine = engine_with(&fake);
        engine.refresh().await;

        engine.set_filter_state(StateFilter::Stopped).await;
        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].repository, "o/two");
        assert_eq!(snapshot.total, 2);

        engine.set_filter_state(StateFilter::All).await;
        engine.set_filter_text("ALP").await;
        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.groups[0].workspaces[0].name, "alpha");
        assert_eq!(fake.count("list"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_clears_timers_and_ignores_refresh() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Provisioning)]);
        let engine = engine_with(&fake);
        engine.start().await;
        assert_eq!(engine.poll_mode(), PollMode::Fast);

        engine.dispose();
        assert_eq!(engine.poll_mode(), PollMode::Idle);
        engine.refresh().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fake.count("list"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn request_refresh_runs_in_background() {
        let fake = Arc::new(FakeDirectory::new());
        fake.push_list(vec![make_workspace("a", "o/r", WorkspaceState::Shutdown)]);
        let engine = engine_with(&fake);
        let mut rx = engine.subscribe();

        engine.request_refresh();
        wait_for(&mut rx, SyncEvent::Refreshed { total: 1, transitional: 0 }).await;
        assert_eq!(engine.snapshot().await.readiness, Readiness::Ready);
    }
}
