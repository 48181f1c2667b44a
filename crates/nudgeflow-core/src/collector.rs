//! Activity Signal Collector
//!
//! Turns raw interaction on a monitored surface into [`ActionEvent`]s:
//! - keystrokes are debounced into `edit_burst` events
//! - focus/blur are forwarded as they happen
//! - idleness is polled and reported as `note_idle` at most once per idle
//!   episode, on the first window the idle span enters
//! - input after a reported episode emits `activity_resumed` with the real
//!   length of the gap
//!
//! Polling runs on the shared [`Scheduler`]; dropping or unsubscribing a
//! [`Subscription`] detaches the surface and stops its poller.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::CollectorConfig;
use crate::event::{
    ActionEvent, KIND_ACTIVITY_RESUMED, KIND_EDIT_BURST, KIND_NOTE_IDLE, KIND_SURFACE_BLUR,
    KIND_SURFACE_FOCUS,
};
use crate::scheduler::Scheduler;

/// Source of "now" for polling
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Raw input observed on a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInput {
    Keystroke { deletion: bool },
    Pointer,
    Focus,
    Blur,
}

/// One reportable idle span: idle time in `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleWindow {
    pub min: Duration,
    pub max: Option<Duration>,
}

impl IdleWindow {
    #[must_use]
    pub const fn between(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    #[must_use]
    pub const fn at_least(min: Duration) -> Self {
        Self { min, max: None }
    }

    fn contains(&self, idle: Duration) -> bool {
        idle >= self.min && self.max.map_or(true, |max| idle <= max)
    }
}

/// Idle windows for a surface. An episode is reported once, in the first
/// window its idle time falls into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleThresholds {
    pub windows: Vec<IdleWindow>,
}

impl IdleThresholds {
    #[must_use]
    pub fn new(windows: Vec<IdleWindow>) -> Self {
        Self { windows }
    }

    #[must_use]
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(
            config
                .idle_windows
                .iter()
                .map(|w| IdleWindow {
                    min: Duration::from_secs(w.min_secs),
                    max: w.max_secs.map(Duration::from_secs),
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct EditBurst {
    edits: u64,
    deletions: u64,
    last_keystroke_at: DateTime<Utc>,
}

/// Per-surface activity state
#[derive(Debug, Clone)]
pub struct SurfaceMonitor {
    surface: String,
    subject_id: Option<String>,
    thresholds: IdleThresholds,
    debounce: chrono::Duration,
    last_activity_at: DateTime<Utc>,
    /// Set once the current idle episode has been reported
    reported: bool,
    burst: Option<EditBurst>,
}

impl SurfaceMonitor {
    #[must_use]
    pub fn new(
        surface: impl Into<String>,
        subject_id: Option<String>,
        thresholds: IdleThresholds,
        debounce: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            surface: surface.into(),
            subject_id,
            thresholds,
            debounce: chrono::Duration::from_std(debounce)
                .unwrap_or_else(|_| chrono::Duration::seconds(1)),
            last_activity_at: now,
            reported: false,
            burst: None,
        }
    }

    /// Record raw input. Focus and blur produce an event immediately, and
    /// the first input after a reported idle episode closes it.
    pub fn record(&mut self, input: RawInput, at: DateTime<Utc>) -> Vec<ActionEvent> {
        let mut events = Vec::new();
        if self.reported {
            self.reported = false;
            let gap = (at - self.last_activity_at).num_seconds().max(0);
            events.push(
                ActionEvent::new(KIND_ACTIVITY_RESUMED, at)
                    .with_payload(json!({
                        "taskId": self.subject_id,
                        "surface": self.surface,
                        "idleSince": self.last_activity_at,
                        "gapSecs": gap,
                    }))
                    .with_subject_opt(self.subject_id.clone()),
            );
        }
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }

        match input {
            RawInput::Keystroke { deletion } => {
                let burst = self.burst.get_or_insert(EditBurst {
                    edits: 0,
                    deletions: 0,
                    last_keystroke_at: at,
                });
                burst.edits += 1;
                if deletion {
                    burst.deletions += 1;
                }
                burst.last_keystroke_at = at;
            }
            RawInput::Pointer => {}
            RawInput::Focus => events.push(self.event(KIND_SURFACE_FOCUS, at)),
            RawInput::Blur => events.push(self.event(KIND_SURFACE_BLUR, at)),
        }
        events
    }

    /// Check the burst debounce and the idle windows against `now`
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<ActionEvent> {
        let mut events = Vec::new();

        if let Some(burst) = self.burst {
            if now - burst.last_keystroke_at >= self.debounce {
                self.burst = None;
                events.push(
                    self.event(KIND_EDIT_BURST, burst.last_keystroke_at)
                        .with_payload(json!({
                            "taskId": self.subject_id,
                            "edits": burst.edits,
                            "deletions": burst.deletions,
                        })),
                );
            }
        }

        if self.reported {
            return events;
        }
        let Ok(idle) = (now - self.last_activity_at).to_std() else {
            return events;
        };
        if self.thresholds.windows.iter().any(|w| w.contains(idle)) {
            self.reported = true;
            events.push(
                ActionEvent::new(KIND_NOTE_IDLE, now)
                    .with_payload(json!({
                        "taskId": self.subject_id,
                        "surface": self.surface,
                        "duration": idle.as_secs(),
                        "idleSince": self.last_activity_at,
                    }))
                    .with_subject_opt(self.subject_id.clone()),
            );
        }

        events
    }

    fn event(&self, kind: &str, at: DateTime<Utc>) -> ActionEvent {
        ActionEvent::new(kind, at)
            .with_payload(json!({ "surface": self.surface }))
            .with_subject_opt(self.subject_id.clone())
    }
}

#[derive(Debug)]
struct Observed {
    generation: u64,
    monitor: SurfaceMonitor,
}

type Surfaces = Arc<Mutex<HashMap<String, Observed>>>;

/// Observes surfaces and emits their events into the engine's channel
pub struct ActivityCollector {
    surfaces: Surfaces,
    scheduler: Arc<Scheduler>,
    sink: UnboundedSender<ActionEvent>,
    clock: Clock,
    poll_interval: Duration,
    debounce: Duration,
    next_generation: Mutex<u64>,
}

impl ActivityCollector {
    #[must_use]
    pub fn new(
        config: &CollectorConfig,
        scheduler: Arc<Scheduler>,
        sink: UnboundedSender<ActionEvent>,
    ) -> Self {
        Self {
            surfaces: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            sink,
            clock: Arc::new(Utc::now),
            poll_interval: config.poll_interval(),
            debounce: config.debounce(),
            next_generation: Mutex::new(0),
        }
    }

    /// Replace the wall clock used by pollers
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Start observing `surface`. Re-observing a surface replaces the
    /// previous observation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(
        &self,
        surface: &str,
        subject_id: Option<String>,
        thresholds: IdleThresholds,
    ) -> Subscription {
        let generation = {
            let mut next = self
                .next_generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let monitor = SurfaceMonitor::new(
            surface,
            subject_id,
            thresholds,
            self.debounce,
            (self.clock)(),
        );

        let previous = self
            .surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                surface.to_string(),
                Observed {
                    generation,
                    monitor,
                },
            );
        if let Some(previous) = previous {
            self.scheduler
                .cancel(&timer_key(surface, previous.generation));
        }

        let surfaces = Arc::clone(&self.surfaces);
        let sink = self.sink.clone();
        let clock = Arc::clone(&self.clock);
        let name = surface.to_string();
        self.scheduler.every(
            timer_key(surface, generation),
            self.poll_interval,
            move || {
                let events = {
                    let mut surfaces = surfaces.lock().unwrap_or_else(PoisonError::into_inner);
                    match surfaces.get_mut(&name) {
                        Some(observed) if observed.generation == generation => {
                            observed.monitor.poll(clock())
                        }
                        _ => return,
                    }
                };
                forward(&sink, events);
            },
        );
        log::debug!("Observing surface {surface}");

        Subscription {
            surface: surface.to_string(),
            generation,
            surfaces: Arc::downgrade(&self.surfaces),
            scheduler: Arc::downgrade(&self.scheduler),
            active: true,
        }
    }

    /// Feed raw input for a surface. Returns `false` if the surface is not
    /// observed (for example after it was torn down).
    pub fn record(&self, surface: &str, input: RawInput, at: DateTime<Utc>) -> bool {
        let events = {
            let mut surfaces = self.surfaces.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(observed) = surfaces.get_mut(surface) else {
                return false;
            };
            observed.monitor.record(input, at)
        };
        forward(&self.sink, events);
        true
    }

    /// Poll every observed surface immediately
    pub fn poll_all(&self, now: DateTime<Utc>) {
        let events: Vec<ActionEvent> = self
            .surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
            .flat_map(|observed| observed.monitor.poll(now))
            .collect();
        forward(&self.sink, events);
    }

    #[must_use]
    pub fn is_observing(&self, surface: &str) -> bool {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(surface)
    }
}

fn timer_key(surface: &str, generation: u64) -> String {
    format!("collector:{surface}:{generation}")
}

fn forward(sink: &UnboundedSender<ActionEvent>, events: Vec<ActionEvent>) {
    for event in events {
        if sink.send(event).is_err() {
            log::debug!("Event channel closed, dropping collector event");
            return;
        }
    }
}

/// Handle for one observed surface. Unsubscribing is idempotent and also
/// happens on drop.
#[derive(Debug)]
pub struct Subscription {
    surface: String,
    generation: u64,
    surfaces: Weak<Mutex<HashMap<String, Observed>>>,
    scheduler: Weak<Scheduler>,
    active: bool,
}

impl Subscription {
    #[must_use]
    pub fn surface(&self) -> &str {
        &self.surface
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Stop observing the surface and cancel its poller
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Some(surfaces) = self.surfaces.upgrade() {
            let mut surfaces = surfaces.lock().unwrap_or_else(PoisonError::into_inner);
            if surfaces
                .get(&self.surface)
                .is_some_and(|observed| observed.generation == self.generation)
            {
                surfaces.remove(&self.surface);
            }
        }
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.cancel(&timer_key(&self.surface, self.generation));
        }
        log::debug!("Stopped observing surface {}", self.surface);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
