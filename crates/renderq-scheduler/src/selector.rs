//! Candidate frame selection
//!
//! Scope resolution runs an ordered list of [`ScopeStrategy`]s; the first one
//! that applies decides which targets a host may work on. The selector then
//! expands those targets into a snapshot of dispatchable frames.

use async_trait::async_trait;
use renderq_core::{
    BookingTarget, DispatchHost, DispatcherConfig, Frame, FrameState, Job, Layer,
    LocalHostAssignment, RenderqError, RenderqResult, ResourceSlice,
};
use renderq_store::{AssignmentRepository, DispatchStore, JobRepository, ProcRepository};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// How a scope was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Caller named a target
    Explicit,
    /// Host's local host assignments
    Local,
    /// Every dispatchable job of the host's facility
    Open,
}

/// One target the host may work on, with the assignment bounding it
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub target: BookingTarget,
    pub assignment: Option<LocalHostAssignment>,
}

/// Resolved dispatch scope for one pass
#[derive(Debug, Clone)]
pub struct DispatchScope {
    pub kind: ScopeKind,
    pub entries: Vec<ScopeEntry>,
}

impl DispatchScope {
    /// A scope that yields no candidates
    pub fn empty(kind: ScopeKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }
}

/// Strategy for resolving the scope of a dispatch pass
#[async_trait]
pub trait ScopeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the strategy does not apply
    async fn resolve(
        &self,
        store: &dyn DispatchStore,
        host: &DispatchHost,
        target: Option<BookingTarget>,
        config: &DispatcherConfig,
    ) -> RenderqResult<Option<DispatchScope>>;
}

/// Whether `outer` contains `inner`
async fn covers(
    store: &dyn DispatchStore,
    outer: BookingTarget,
    inner: BookingTarget,
) -> RenderqResult<bool> {
    if outer == inner {
        return Ok(true);
    }
    Ok(match (outer, inner) {
        (BookingTarget::Job(job), BookingTarget::Layer(layer)) => {
            store.get_layer(layer).await?.job_id == job
        }
        (BookingTarget::Job(job), BookingTarget::Frame(frame)) => {
            store.get_frame(frame).await?.job_id == job
        }
        (BookingTarget::Layer(layer), BookingTarget::Frame(frame)) => {
            store.get_frame(frame).await?.layer_id == layer
        }
        _ => false,
    })
}

async fn target_exists(store: &dyn DispatchStore, target: BookingTarget) -> RenderqResult<bool> {
    let found = match target {
        BookingTarget::Job(id) => store.get_job(id).await.map(|_| ()),
        BookingTarget::Layer(id) => store.get_layer(id).await.map(|_| ()),
        BookingTarget::Frame(id) => store.get_frame(id).await.map(|_| ()),
    };
    match found {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// A caller-supplied job, layer or frame. Fails with `TargetUnavailable`
/// when the target is missing, the host is not up, or the host is pinned by
/// assignments that do not cover the target.
pub struct ExplicitTargetStrategy;

#[async_trait]
impl ScopeStrategy for ExplicitTargetStrategy {
    fn name(&self) -> &'static str {
        "explicit"
    }

    async fn resolve(
        &self,
        store: &dyn DispatchStore,
        host: &DispatchHost,
        target: Option<BookingTarget>,
        _config: &DispatcherConfig,
    ) -> RenderqResult<Option<DispatchScope>> {
        let Some(target) = target else {
            return Ok(None);
        };
        if !host.host.is_up() {
            return Err(RenderqError::TargetUnavailable(format!(
                "host {} is {}",
                host.name(),
                host.host.state
            )));
        }
        if !target_exists(store, target).await? {
            return Err(RenderqError::TargetUnavailable(format!(
                "{} does not exist",
                target
            )));
        }

        let assignments = store.assignments_for_host(host.id()).await;
        let pinned = !assignments.is_empty();
        let mut assignment = None;
        for lha in assignments {
            if covers(store, lha.target, target).await? {
                assignment = Some(lha);
                break;
            }
        }
        if pinned && assignment.is_none() {
            return Err(RenderqError::TargetUnavailable(format!(
                "host {} is pinned away from {}",
                host.name(),
                target
            )));
        }

        Ok(Some(DispatchScope {
            kind: ScopeKind::Explicit,
            entries: vec![ScopeEntry { target, assignment }],
        }))
    }
}

/// The targets of the host's local host assignments, oldest first
pub struct LocalAssignmentStrategy;

#[async_trait]
impl ScopeStrategy for LocalAssignmentStrategy {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn resolve(
        &self,
        store: &dyn DispatchStore,
        host: &DispatchHost,
        target: Option<BookingTarget>,
        _config: &DispatcherConfig,
    ) -> RenderqResult<Option<DispatchScope>> {
        if target.is_some() {
            return Ok(None);
        }
        let assignments = store.assignments_for_host(host.id()).await;
        if assignments.is_empty() {
            return Ok(None);
        }
        if !host.host.is_up() {
            return Ok(Some(DispatchScope::empty(ScopeKind::Local)));
        }

        let entries = assignments
            .into_iter()
            .map(|lha| ScopeEntry {
                target: lha.target,
                assignment: Some(lha),
            })
            .collect();
        Ok(Some(DispatchScope {
            kind: ScopeKind::Local,
            entries,
        }))
    }
}

/// All dispatchable jobs of the host's facility
pub struct OpenSearchStrategy;

#[async_trait]
impl ScopeStrategy for OpenSearchStrategy {
    fn name(&self) -> &'static str {
        "open"
    }

    async fn resolve(
        &self,
        store: &dyn DispatchStore,
        host: &DispatchHost,
        target: Option<BookingTarget>,
        config: &DispatcherConfig,
    ) -> RenderqResult<Option<DispatchScope>> {
        if target.is_some() {
            return Ok(None);
        }
        let minimum = ResourceSlice::new(config.min_idle_cores, config.min_idle_memory);
        if !host.host.accepts_open_dispatch()
            || !host.allocation_enabled
            || !minimum.fits_within(&host.idle)
        {
            debug!(
                host = %host.name(),
                state = %host.host.state,
                idle = %host.idle,
                "Host not eligible for open dispatch"
            );
            return Ok(Some(DispatchScope::empty(ScopeKind::Open)));
        }

        let entries = store
            .pending_jobs(&host.facility)
            .await
            .into_iter()
            .map(|job| ScopeEntry {
                target: BookingTarget::Job(job.id),
                assignment: None,
            })
            .collect();
        Ok(Some(DispatchScope {
            kind: ScopeKind::Open,
            entries,
        }))
    }
}

/// A frame eligible for placement on a host
#[derive(Debug, Clone)]
pub struct Candidate {
    pub job: Job,
    pub layer: Layer,
    pub frame: Frame,
    /// Assignment that bounds a local placement
    pub assignment: Option<LocalHostAssignment>,
}

impl Candidate {
    pub fn is_local(&self) -> bool {
        self.assignment.is_some()
    }
}

/// Snapshot of candidates for one pass; finite and not restartable
#[derive(Debug)]
pub struct CandidateFrames {
    kind: ScopeKind,
    frames: std::vec::IntoIter<Candidate>,
}

impl CandidateFrames {
    pub fn scope(&self) -> ScopeKind {
        self.kind
    }
}

impl Iterator for CandidateFrames {
    type Item = Candidate;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.frames.size_hint()
    }
}

impl ExactSizeIterator for CandidateFrames {}

/// Picks the frames a host should run next
pub struct CandidateSelector {
    store: Arc<dyn DispatchStore>,
    strategies: Vec<Arc<dyn ScopeStrategy>>,
    config: DispatcherConfig,
}

impl CandidateSelector {
    /// Create a selector with the explicit, local, open strategy order
    pub fn new(store: Arc<dyn DispatchStore>, config: DispatcherConfig) -> Self {
        Self::with_strategies(
            store,
            config,
            vec![
                Arc::new(ExplicitTargetStrategy),
                Arc::new(LocalAssignmentStrategy),
                Arc::new(OpenSearchStrategy),
            ],
        )
    }

    pub fn with_strategies(
        store: Arc<dyn DispatchStore>,
        config: DispatcherConfig,
        strategies: Vec<Arc<dyn ScopeStrategy>>,
    ) -> Self {
        Self {
            store,
            strategies,
            config,
        }
    }

    /// Run the strategies in order and return the first scope that applies
    pub async fn resolve_scope(
        &self,
        host: &DispatchHost,
        target: Option<BookingTarget>,
    ) -> RenderqResult<DispatchScope> {
        for strategy in &self.strategies {
            if let Some(scope) = strategy
                .resolve(self.store.as_ref(), host, target, &self.config)
                .await?
            {
                debug!(
                    host = %host.name(),
                    strategy = strategy.name(),
                    entries = scope.entries.len(),
                    "Dispatch scope resolved"
                );
                return Ok(scope);
            }
        }
        Ok(DispatchScope::empty(ScopeKind::Open))
    }

    /// Candidate frames for a host, in dispatch order.
    ///
    /// Every local host assignment gets its own budget of
    /// `max_candidate_frames`; entries without an assignment share one.
    pub async fn select_frames(
        &self,
        host: &DispatchHost,
        target: Option<BookingTarget>,
    ) -> RenderqResult<CandidateFrames> {
        let scope = self.resolve_scope(host, target).await?;
        let limit = self.config.max_candidate_frames;

        let mut seen = HashSet::new();
        let mut taken: HashMap<Option<Uuid>, usize> = HashMap::new();
        let mut frames = Vec::new();
        for entry in &scope.entries {
            let count = taken
                .entry(entry.assignment.as_ref().map(|a| a.id))
                .or_default();
            if *count >= limit {
                continue;
            }
            for candidate in self.expand(host, entry).await? {
                if *count >= limit {
                    break;
                }
                if seen.insert(candidate.frame.id) {
                    frames.push(candidate);
                    *count += 1;
                }
            }
        }

        Ok(CandidateFrames {
            kind: scope.kind,
            frames: frames.into_iter(),
        })
    }

    /// Dispatchable frames under one scope entry, by layer order then number
    async fn expand(
        &self,
        host: &DispatchHost,
        entry: &ScopeEntry,
    ) -> RenderqResult<Vec<Candidate>> {
        let resolved = match entry.target {
            BookingTarget::Job(id) => self.job_frames(id).await,
            BookingTarget::Layer(id) => self.layer_frames(id).await,
            BookingTarget::Frame(id) => self.single_frame(id).await,
        };
        let (job, layers) = match resolved {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                debug!(target = %entry.target, error = %e, "Scope target vanished");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        if !job.is_dispatchable() || job.facility != host.facility {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for (layer, frames) in layers {
            if !host.matches_tags(&layer.tags) {
                continue;
            }
            if !layer.requirements().fits_within(&host.host.total) {
                debug!(
                    host = %host.name(),
                    layer = %layer.name,
                    requires = %layer.requirements(),
                    "Layer can never fit on host"
                );
                continue;
            }
            for frame in frames {
                candidates.push(Candidate {
                    job: job.clone(),
                    layer: layer.clone(),
                    frame,
                    assignment: entry.assignment.clone(),
                });
            }
        }
        Ok(candidates)
    }

    async fn job_frames(&self, job_id: Uuid) -> RenderqResult<(Job, Vec<(Layer, Vec<Frame>)>)> {
        let job = self.store.get_job(job_id).await?;
        let mut layers = Vec::new();
        for layer in self.store.get_layers(job_id).await? {
            let frames = self.store.dispatchable_frames(layer.id).await?;
            layers.push((layer, frames));
        }
        Ok((job, layers))
    }

    async fn layer_frames(&self, layer_id: Uuid) -> RenderqResult<(Job, Vec<(Layer, Vec<Frame>)>)> {
        let layer = self.store.get_layer(layer_id).await?;
        let job = self.store.get_job(layer.job_id).await?;
        let frames = self.store.dispatchable_frames(layer.id).await?;
        Ok((job, vec![(layer, frames)]))
    }

    async fn single_frame(&self, frame_id: Uuid) -> RenderqResult<(Job, Vec<(Layer, Vec<Frame>)>)> {
        let frame = self.store.get_frame(frame_id).await?;
        let layer = self.store.get_layer(frame.layer_id).await?;
        let job = self.store.get_job(frame.job_id).await?;

        let ready = frame.state == FrameState::Waiting
            && self.store.proc_for_frame(frame.id).await.is_none()
            && self.store.dependencies_satisfied(&frame).await?;
        let frames = if ready { vec![frame] } else { Vec::new() };
        Ok((job, vec![(layer, frames)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{farm, FarmFixture};
    use renderq_core::{AssignmentBounds, LockState, GB2, GB8};
    use renderq_store::HostRepository;

    async fn selector(f: &FarmFixture) -> CandidateSelector {
        CandidateSelector::new(f.store.clone(), DispatcherConfig::default())
    }

    #[tokio::test]
    async fn test_open_search_order() {
        let f = farm().await;
        let urgent = f.add_job("urgent", 50, &[("comp", 100, GB2, 2)]).await;
        let selector = selector(&f).await;

        let host = f.dispatch_host().await;
        let frames: Vec<Candidate> = selector.select_frames(&host, None).await.unwrap().collect();

        assert_eq!(frames[0].job.id, urgent.id);
        assert_eq!(frames[0].frame.number, 1);
        assert_eq!(frames[1].frame.number, 2);
        // Default job: layer order then frame number
        assert_eq!(frames[2].job.id, f.job.id);
        assert_eq!(frames[2].layer.dispatch_order, 0);
        assert!(frames.iter().all(|c| !c.is_local()));
    }

    #[tokio::test]
    async fn test_oversized_layer_skipped() {
        let f = farm().await;
        f.add_job("huge", 100, &[("sim", 6400, GB2, 1)]).await;
        let selector = selector(&f).await;

        let host = f.dispatch_host().await;
        let frames = selector.select_frames(&host, None).await.unwrap();
        assert!(frames.into_iter().all(|c| c.layer.name != "sim"));
    }

    #[tokio::test]
    async fn test_open_search_requires_open_host() {
        let f = farm().await;
        let mut host = f.store.get_host(f.host.id).await.unwrap();
        host.lock_state = LockState::NimbyLocked;
        f.store.update_host(&host).await.unwrap();
        let selector = selector(&f).await;

        let view = f.dispatch_host().await;
        let frames = selector.select_frames(&view, None).await.unwrap();
        assert_eq!(frames.scope(), ScopeKind::Open);
        assert_eq!(frames.len(), 0);
    }

    #[tokio::test]
    async fn test_local_scope_restricted_to_assignment() {
        let f = farm().await;
        let other = f.add_job("other", 100, &[("comp", 100, GB2, 3)]).await;
        let layer = f.layers[1].clone();
        let lha = LocalHostAssignment::new(
            f.host.id,
            BookingTarget::Layer(layer.id),
            AssignmentBounds::new(300, 1, GB8, 0, 0),
        );
        f.store.insert_assignment(lha).await.unwrap();
        let selector = selector(&f).await;

        let view = f.dispatch_host().await;
        let frames = selector.select_frames(&view, None).await.unwrap();
        assert_eq!(frames.scope(), ScopeKind::Local);
        let frames: Vec<Candidate> = frames.collect();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|c| c.layer.id == layer.id && c.is_local()));
        assert!(frames.iter().all(|c| c.job.id != other.id));
    }

    #[tokio::test]
    async fn test_explicit_frame_not_waiting() {
        let f = farm().await;
        let frame = f.store.find_frame(f.layers[0].id, 1).await.unwrap();
        f.store
            .set_frame_state(frame.id, FrameState::Running)
            .await
            .unwrap();
        let selector = selector(&f).await;

        let view = f.dispatch_host().await;
        let frames = selector
            .select_frames(&view, Some(BookingTarget::Frame(frame.id)))
            .await
            .unwrap();
        assert_eq!(frames.scope(), ScopeKind::Explicit);
        assert_eq!(frames.len(), 0);
    }

    #[tokio::test]
    async fn test_explicit_missing_target() {
        let f = farm().await;
        let selector = selector(&f).await;

        let view = f.dispatch_host().await;
        let result = selector
            .select_frames(&view, Some(BookingTarget::Job(Uuid::new_v4())))
            .await;
        assert!(matches!(result, Err(RenderqError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn test_explicit_target_outside_assignment() {
        let f = farm().await;
        let other = f.add_job("other", 1, &[("comp", 100, GB2, 5)]).await;
        let lha = LocalHostAssignment::new(
            f.host.id,
            BookingTarget::Job(f.job.id),
            AssignmentBounds::new(200, 1, GB8, 0, 0),
        );
        f.store.insert_assignment(lha).await.unwrap();
        let selector = selector(&f).await;

        let view = f.dispatch_host().await;
        let result = selector
            .select_frames(&view, Some(BookingTarget::Job(other.id)))
            .await;
        assert!(matches!(result, Err(RenderqError::TargetUnavailable(_))));

        let frames = selector
            .select_frames(&view, Some(BookingTarget::Layer(f.layers[1].id)))
            .await
            .unwrap();
        assert!(frames.len() > 0);
        assert!(frames.into_iter().all(|c| c.is_local()));
    }

    #[tokio::test]
    async fn test_candidate_cap() {
        let f = farm().await;
        let config = DispatcherConfig {
            max_candidate_frames: 3,
            ..Default::default()
        };
        let selector = CandidateSelector::new(f.store.clone(), config);

        let view = f.dispatch_host().await;
        assert_eq!(selector.select_frames(&view, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_candidate_cap_per_assignment() {
        let f = farm().await;
        let other = f.add_job("other", 1, &[("comp", 100, GB2, 5)]).await;
        for (target, cores) in [(f.job.id, 100), (other.id, 200)] {
            let lha = LocalHostAssignment::new(
                f.host.id,
                BookingTarget::Job(target),
                AssignmentBounds::new(cores, 1, GB8, 0, 0),
            );
            f.store.insert_assignment(lha).await.unwrap();
        }
        let config = DispatcherConfig {
            max_candidate_frames: 3,
            ..Default::default()
        };
        let selector = CandidateSelector::new(f.store.clone(), config);

        let view = f.dispatch_host().await;
        let frames: Vec<Candidate> = selector.select_frames(&view, None).await.unwrap().collect();
        assert_eq!(frames.len(), 6);
        assert_eq!(frames.iter().filter(|c| c.job.id == other.id).count(), 3);
    }
}
