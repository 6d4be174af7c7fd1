//! Session controller: the single writer of session state.
//!
//! The controller owns the acquisition source, the capture scheduler and the
//! busy gate shared by scheduled and manual verification. Every mutation is
//! published as a [`SessionSnapshot`] on a watch channel.
//!
//! Each start and stop bumps a session epoch. Work that started under an
//! older epoch (a connect that raced a stop, a verify still in flight when
//! the session was stopped) sees the mismatch on completion and discards
//! its outcome. Teardown also cancels the session's token, which aborts
//! any capture or matcher call a manual verification is still awaiting.

use crate::activity::{ActivityEvent, ActivityRecorder, VerificationMethod};
use crate::config::{CaptureConfig, VerifierConfig};
use crate::frame;
use crate::matcher::{VerificationBackend, VerificationResult, VerifyError};
use crate::scheduler::{self, SchedulerHandle};
use crate::settings::{SettingsError, VerificationSettings};
use crate::source::{AcquisitionSource, CaptureError, ConnectError, SourceFactory, SourceKind};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;


/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Paused,
    ManualVerifying,
    Error,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::ManualVerifying => "manual_verifying",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by controller operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is paused")]
    Paused,

    #[error("A verification is already in flight")]
    Busy,

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("No source is connected")]
    NotConnected,

    #[error("Session was stopped")]
    Cancelled,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl SessionError {
    /// Whether a scheduled tick logs this failure instead of surfacing it.
    pub fn suppressed_when_scheduled(&self) -> bool {
        match self {
            SessionError::Verify(e) => e.suppressed_when_scheduled(),
            SessionError::Capture(e) => e.suppressed_when_scheduled(),
            _ => false,
        }
    }
}

/// Counters for the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Scheduler ticks fired
    pub ticks: u64,
    /// Ticks skipped because the session was paused
    pub ticks_suppressed: u64,
    /// Ticks dropped because a verification was in flight
    pub ticks_dropped: u64,
    /// Completed verifications (accepted or rejected)
    pub verifications: u64,
    /// Failed verification attempts
    pub failures: u64,
    /// Scheduled failures since the last success
    pub consecutive_failures: u32,
}

/// Read-only view of the session for the operator panel.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub source: Option<SourceKind>,
    pub settings: VerificationSettings,
    pub last_result: Option<VerificationResult>,
    pub last_error: Option<String>,
    pub busy: bool,
    pub stats: SessionStats,
}

/// Controller tuning taken from the service configuration.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub capture: CaptureConfig,
    /// Consecutive scheduled failures before auto-pause (0 = never)
    pub max_consecutive_failures: u32,
    pub operator: String,
}

impl ControllerOptions {
    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            capture: config.capture.clone(),
            max_consecutive_failures: config.session.max_consecutive_failures,
            operator: config.session.operator.clone(),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            max_consecutive_failures: 0,
            operator: "gatehouse".to_string(),
        }
    }
}

struct Shared {
    state: SessionState,
    source: Option<SourceKind>,
    failed_kind: Option<SourceKind>,
    settings: VerificationSettings,
    last_result: Option<VerificationResult>,
    last_error: Option<String>,
    epoch: u64,
    session_id: Option<Uuid>,
    pending_pause: bool,
    health_checked: bool,
    cancel: CancellationToken,
    stats: SessionStats,
}

/// Releases the busy gate when dropped, including on cancellation.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Inner {
    options: ControllerOptions,
    backend: Arc<dyn VerificationBackend>,
    recorder: Arc<dyn ActivityRecorder>,
    factory: Arc<dyn SourceFactory>,
    shared: Mutex<Shared>,
    busy: AtomicBool,
    source: tokio::sync::Mutex<Option<Box<dyn AcquisitionSource>>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Drives one capture session at a time.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        options: ControllerOptions,
        settings: VerificationSettings,
        backend: Arc<dyn VerificationBackend>,
        factory: Arc<dyn SourceFactory>,
        recorder: Arc<dyn ActivityRecorder>,
    ) -> Self {
        let shared = Shared {
            state: SessionState::Idle,
            source: None,
            failed_kind: None,
            settings,
            last_result: None,
            last_error: None,
            epoch: 0,
            session_id: None,
            pending_pause: false,
            health_checked: false,
            cancel: CancellationToken::new(),
            stats: SessionStats::default(),
        };
        let (snapshot_tx, _) = watch::channel(build_snapshot(&shared, false));

        Self {
            inner: Arc::new(Inner {
                options,
                backend,
                recorder,
                factory,
                shared: Mutex::new(shared),
                busy: AtomicBool::new(false),
                source: tokio::sync::Mutex::new(None),
                scheduler: Mutex::new(None),
                snapshot_tx,
            }),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let shared = self.inner.lock();
        self.inner.build_snapshot(&shared)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn settings(&self) -> VerificationSettings {
        self.inner.lock().settings
    }

    /// Acquire `kind` and, for live sources, start the capture scheduler.
    #[instrument(skip(self), fields(source = %kind))]
    pub async fn start(&self, kind: SourceKind) -> Result<(), SessionError> {
        let epoch = {
            let mut shared = self.inner.lock();
            match shared.state {
                SessionState::Idle | SessionState::Error | SessionState::Stopped => {}
                state => {
                    return Err(SessionError::InvalidTransition {
                        action: "start",
                        state,
                    })
                }
            }
            self.inner.begin(&mut shared, &kind)
        };

        self.inner.connect(kind, epoch).await
    }

    /// Re-run `start` with the source that last failed to connect.
    pub async fn retry(&self) -> Result<(), SessionError> {
        let kind = {
            let shared = self.inner.lock();
            match (shared.state, &shared.failed_kind) {
                (SessionState::Error, Some(kind)) => kind.clone(),
                (state, _) => {
                    return Err(SessionError::InvalidTransition {
                        action: "retry",
                        state,
                    })
                }
            }
        };

        self.start(kind).await
    }

    /// Tear down the current source, then connect `kind`.
    #[instrument(skip(self), fields(source = %kind))]
    pub async fn switch_mode(&self, kind: SourceKind) -> Result<(), SessionError> {
        {
            let shared = self.inner.lock();
            match shared.state {
                SessionState::Active | SessionState::Paused => {}
                state => {
                    return Err(SessionError::InvalidTransition {
                        action: "switch source",
                        state,
                    })
                }
            }
        }

        let teardown_epoch = self.inner.teardown(SessionState::Connecting).await;

        let epoch = {
            let mut shared = self.inner.lock();
            if shared.epoch != teardown_epoch {
                // A stop landed between teardown and reconnect.
                return Err(SessionError::Cancelled);
            }
            self.inner.begin(&mut shared, &kind)
        };

        self.inner.connect(kind, epoch).await
    }

    /// Suppress scheduled ticks until `resume`.
    pub fn pause(&self) -> Result<(), SessionError> {
        let mut shared = self.inner.lock();
        match shared.state {
            SessionState::Active => {
                shared.state = SessionState::Paused;
                info!(session_id = ?shared.session_id, "Session paused");
                self.inner.publish(&shared);
                Ok(())
            }
            SessionState::ManualVerifying => {
                shared.pending_pause = true;
                debug!("Pause deferred until the manual verification finishes");
                Ok(())
            }
            SessionState::Paused => Ok(()),
            state => Err(SessionError::InvalidTransition {
                action: "pause",
                state,
            }),
        }
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        let mut shared = self.inner.lock();
        match shared.state {
            SessionState::Paused => {
                shared.state = SessionState::Active;
                info!(session_id = ?shared.session_id, "Session resumed");
                self.inner.publish(&shared);
                Ok(())
            }
            SessionState::ManualVerifying => {
                shared.pending_pause = false;
                Ok(())
            }
            SessionState::Active => Ok(()),
            state => Err(SessionError::InvalidTransition {
                action: "resume",
                state,
            }),
        }
    }

    /// Cancel the scheduler, release the source and clear the last result.
    ///
    /// Safe to call from any state; a connect still in progress is
    /// abandoned and its `start` returns [`SessionError::Cancelled`].
    pub async fn stop(&self) {
        self.inner.teardown(SessionState::Stopped).await;
    }

    /// One operator-triggered verification, surfacing every failure class.
    pub async fn manual_verify(&self) -> Result<VerificationResult, SessionError> {
        let inner = &self.inner;

        let (epoch, guard) = {
            let mut shared = inner.lock();
            match shared.state {
                SessionState::Active => {}
                SessionState::Paused => return Err(SessionError::Paused),
                SessionState::ManualVerifying => return Err(SessionError::Busy),
                state => {
                    return Err(SessionError::InvalidTransition {
                        action: "verify",
                        state,
                    })
                }
            }
            let guard = inner.try_acquire_gate().ok_or(SessionError::Busy)?;
            shared.state = SessionState::ManualVerifying;
            inner.publish(&shared);
            (shared.epoch, guard)
        };

        info!("Manual verification started");
        let outcome = inner.run_verification(epoch, VerificationMethod::Manual).await;
        drop(guard);

        let event = {
            let mut shared = inner.lock();
            if shared.epoch != epoch {
                debug!("Discarding manual verification from a finished session");
                return Err(SessionError::Cancelled);
            }

            shared.state = if shared.pending_pause {
                SessionState::Paused
            } else {
                SessionState::Active
            };
            shared.pending_pause = false;

            let event = match &outcome {
                Ok(result) => {
                    shared.stats.verifications += 1;
                    shared.stats.consecutive_failures = 0;
                    shared.last_result = Some(result.clone());
                    shared.last_error = None;
                    Some(inner.activity_event(&shared, result, VerificationMethod::Manual))
                }
                Err(e) => {
                    shared.stats.failures += 1;
                    shared.last_error = Some(e.to_string());
                    warn!(error = %e, "Manual verification failed");
                    None
                }
            };
            inner.publish(&shared);
            event
        };

        if let Some(event) = event {
            inner.record(event).await;
        }

        outcome
    }

    /// Replace the verification settings; the next call uses them.
    pub fn update_settings(&self, settings: VerificationSettings) {
        let mut shared = self.inner.lock();
        shared.settings = settings;
        info!(
            threshold = settings.confidence_threshold(),
            scope = %settings.search_scope(),
            engine_mode = %settings.engine_mode(),
            "Verification settings updated"
        );
        self.inner.publish(&shared);
    }

    pub fn set_threshold(&self, threshold: f32) -> Result<(), SessionError> {
        let settings = self.settings().with_threshold(threshold)?;
        self.update_settings(settings);
        Ok(())
    }

    /// Hand a picture to the active static upload source.
    pub async fn load_upload(&self, bytes: Bytes, mime_type: &str) -> Result<(), SessionError> {
        let mut slot = self.inner.source.lock().await;
        let source = slot.as_mut().ok_or(SessionError::NotConnected)?;
        source.load_upload(bytes, mime_type)?;
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    fn build_snapshot(&self, shared: &Shared) -> SessionSnapshot {
        build_snapshot(shared, self.busy.load(Ordering::Acquire))
    }

    fn publish(&self, shared: &Shared) {
        self.snapshot_tx.send_replace(self.build_snapshot(shared));
    }

    fn try_acquire_gate(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { flag: &self.busy })
    }

    /// Enter `Connecting` for a fresh session and return its epoch.
    fn begin(&self, shared: &mut Shared, kind: &SourceKind) -> u64 {
        shared.epoch += 1;
        shared.state = SessionState::Connecting;
        shared.source = Some(kind.clone());
        shared.failed_kind = None;
        shared.session_id = Some(Uuid::new_v4());
        shared.last_result = None;
        shared.last_error = None;
        shared.pending_pause = false;
        shared.health_checked = false;
        shared.cancel = CancellationToken::new();
        shared.stats = SessionStats::default();
        self.publish(shared);

        info!(session_id = ?shared.session_id, source = %kind, "Connecting source");
        shared.epoch
    }

    async fn connect(self: &Arc<Self>, kind: SourceKind, epoch: u64) -> Result<(), SessionError> {
        let connected = match self.factory.create(&kind) {
            Ok(mut source) => match source.connect().await {
                Ok(()) => Ok(source),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let mut slot = self.source.lock().await;
        let mut shared = self.lock();

        if shared.epoch != epoch {
            drop(shared);
            if let Ok(mut source) = connected {
                source.disconnect();
            }
            info!(source = %kind, "Connect abandoned by stop");
            return Err(SessionError::Cancelled);
        }

        match connected {
            Ok(source) => {
                *slot = Some(source);
                shared.state = SessionState::Active;

                if let Some(interval) = kind.tick_interval(&self.options.capture) {
                    let weak = Arc::downgrade(self);
                    *self.scheduler.lock() =
                        Some(scheduler::spawn(interval, move || tick(weak.clone(), epoch)));
                }

                info!(
                    session_id = ?shared.session_id,
                    source = %kind,
                    "Session active"
                );
                self.publish(&shared);
                Ok(())
            }
            Err(e) => {
                shared.state = SessionState::Error;
                shared.last_error = Some(e.to_string());
                shared.failed_kind = Some(kind.clone());
                warn!(source = %kind, error = %e, "Failed to connect source");
                self.publish(&shared);
                Err(SessionError::Connect(e))
            }
        }
    }

    /// Cancel the timer, release the source, clear the last result.
    async fn teardown(&self, next: SessionState) -> u64 {
        let (epoch, scheduler) = {
            let mut shared = self.lock();
            shared.epoch += 1;
            shared.state = next;
            shared.pending_pause = false;
            shared.cancel.cancel();
            self.publish(&shared);
            (shared.epoch, self.scheduler.lock().take())
        };

        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        if let Some(mut source) = self.source.lock().await.take() {
            source.disconnect();
        }

        let mut shared = self.lock();
        if shared.epoch == epoch {
            shared.last_result = None;
            if next == SessionState::Stopped {
                info!(
                    session_id = ?shared.session_id,
                    verifications = shared.stats.verifications,
                    failures = shared.stats.failures,
                    "Session stopped"
                );
            }
            self.publish(&shared);
        }
        epoch
    }

    /// Settings for the next step, or why the attempt must stop here.
    ///
    /// Scheduled attempts also stop once the session left `Active`, so no
    /// network call starts while paused.
    fn ensure_live(
        &self,
        epoch: u64,
        method: VerificationMethod,
    ) -> Result<VerificationSettings, SessionError> {
        let shared = self.lock();
        if shared.epoch != epoch {
            return Err(SessionError::Cancelled);
        }
        if method == VerificationMethod::Scheduled && shared.state != SessionState::Active {
            return Err(SessionError::Paused);
        }
        Ok(shared.settings)
    }

    /// Capture, validate, health probe (once per session), verify.
    async fn run_verification(
        &self,
        epoch: u64,
        method: VerificationMethod,
    ) -> Result<VerificationResult, SessionError> {
        let cancel = {
            let shared = self.lock();
            if shared.epoch != epoch {
                return Err(SessionError::Cancelled);
            }
            shared.cancel.clone()
        };

        let captured = {
            let mut slot = until_cancelled(&cancel, async {
                Ok::<_, SessionError>(self.source.lock().await)
            })
            .await?;
            self.ensure_live(epoch, method)?;
            let source = slot.as_mut().ok_or(SessionError::NotConnected)?;
            until_cancelled(&cancel, async {
                source.capture_frame().await.map_err(SessionError::from)
            })
            .await?
        };

        self.ensure_live(epoch, method)?;
        let validated = frame::validate(captured).map_err(VerifyError::from)?;

        let health_checked = self.lock().health_checked;
        if !health_checked {
            until_cancelled(&cancel, async {
                self.backend.health_check().await.map_err(SessionError::from)
            })
            .await?;
            let mut shared = self.lock();
            if shared.epoch == epoch {
                shared.health_checked = true;
            }
            debug!("Matcher health probe passed");
        }

        let settings = self.ensure_live(epoch, method)?;

        debug!(
            method = %method,
            size = validated.frame().len(),
            engine_mode = %settings.engine_mode(),
            "{}",
            settings.engine_mode().progress_message()
        );

        until_cancelled(&cancel, async {
            self.backend
                .verify(&validated, &settings)
                .await
                .map_err(SessionError::from)
        })
        .await
    }

    async fn scheduled_tick(&self, epoch: u64) {
        let guard = {
            let mut shared = self.lock();
            if shared.epoch != epoch {
                return;
            }
            shared.stats.ticks += 1;

            match shared.state {
                SessionState::Active | SessionState::ManualVerifying => {}
                SessionState::Paused => {
                    shared.stats.ticks_suppressed += 1;
                    self.publish(&shared);
                    return;
                }
                _ => return,
            }

            match self.try_acquire_gate() {
                Some(guard) => guard,
                None => {
                    shared.stats.ticks_dropped += 1;
                    debug!("Tick dropped, verification in flight");
                    self.publish(&shared);
                    return;
                }
            }
        };

        let outcome = self
            .run_verification(epoch, VerificationMethod::Scheduled)
            .await;
        drop(guard);

        let event = {
            let mut shared = self.lock();
            if shared.epoch != epoch {
                debug!("Discarding scheduled verification from a finished session");
                return;
            }

            let event = match outcome {
                Ok(result) => {
                    debug!(
                        outcome = result.outcome().as_str(),
                        confidence = result.confidence(),
                        "Scheduled verification completed"
                    );
                    shared.stats.verifications += 1;
                    shared.stats.consecutive_failures = 0;
                    let event =
                        self.activity_event(&shared, &result, VerificationMethod::Scheduled);
                    shared.last_result = Some(result);
                    shared.last_error = None;
                    Some(event)
                }
                Err(SessionError::Paused) => {
                    shared.stats.ticks_suppressed += 1;
                    None
                }
                Err(SessionError::Cancelled) => None,
                Err(e) => {
                    shared.stats.failures += 1;
                    shared.stats.consecutive_failures += 1;

                    if e.suppressed_when_scheduled() {
                        warn!(error = %e, "Scheduled verification failed");
                    } else {
                        warn!(error = %e, "Scheduled verification rejected");
                        shared.last_error = Some(e.to_string());
                    }

                    let limit = self.options.max_consecutive_failures;
                    if limit > 0
                        && shared.stats.consecutive_failures >= limit
                        && shared.state == SessionState::Active
                    {
                        shared.state = SessionState::Paused;
                        shared.last_error = Some(format!(
                            "Paused after {} consecutive failures: {}",
                            shared.stats.consecutive_failures, e
                        ));
                        warn!(
                            consecutive_failures = shared.stats.consecutive_failures,
                            "Session auto-paused"
                        );
                    }
                    None
                }
            };
            self.publish(&shared);
            event
        };

        if let Some(event) = event {
            self.record(event).await;
        }
    }

    fn activity_event(
        &self,
        shared: &Shared,
        result: &VerificationResult,
        method: VerificationMethod,
    ) -> ActivityEvent {
        ActivityEvent::from_result(
            shared.session_id.unwrap_or_else(Uuid::nil),
            result,
            method,
            shared.source.as_ref().map(SourceKind::label).unwrap_or("none"),
            self.options.operator.clone(),
        )
    }

    async fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.recorder.record(event).await {
            warn!(error = %e, "Failed to record activity");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.scheduler.get_mut().take();
        if let Some(source) = self.source.get_mut().as_mut() {
            source.disconnect();
        }
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = work => result,
    }
}

async fn tick(inner: Weak<Inner>, epoch: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.scheduled_tick(epoch).await;
    }
}

fn build_snapshot(shared: &Shared, busy: bool) -> SessionSnapshot {
    SessionSnapshot {
        session_id: shared.session_id,
        state: shared.state,
        source: shared.source.clone(),
        settings: shared.settings,
        last_result: shared.last_result.clone(),
        last_error: shared.last_error.clone(),
        busy,
        stats: shared.stats,
    }
}
