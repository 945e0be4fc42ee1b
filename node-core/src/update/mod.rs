//! Update listener: drives remote image transfers one step at a time so the
//! telemetry cycle never blocks on them.
//!
//! Failures are logged and abandoned. The running image stays in place.

use core::fmt;

use crate::events::{EventSink, NodeEvent};

pub mod mdns;
pub mod protocol;

/// Which partition an update targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageKind {
    Application,
    Filesystem,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Application => f.write_str("application"),
            ImageKind::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// Phase in which an update failed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateError {
    Connect,
    Auth,
    Begin,
    Receive,
    End,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Connect => f.write_str("connect failed"),
            UpdateError::Auth => f.write_str("auth failed"),
            UpdateError::Begin => f.write_str("begin failed"),
            UpdateError::Receive => f.write_str("receive failed"),
            UpdateError::End => f.write_str("end failed"),
        }
    }
}

/// What one non-blocking service step observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateStep {
    Idle,
    Started { kind: ImageKind, size: u32 },
    Progress { received: u32, total: u32 },
    Completed(ImageKind),
    Failed(UpdateError),
}

/// Transport that accepts remote images.
#[allow(async_fn_in_trait)]
pub trait UpdateService {
    /// Advances any pending transfer by one step. Must not wait for a client.
    async fn step(&mut self) -> UpdateStep;
}

impl<T: UpdateService + ?Sized> UpdateService for &mut T {
    async fn step(&mut self) -> UpdateStep {
        (**self).step().await
    }
}

/// Service for builds without an update endpoint.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoUpdates;

impl UpdateService for NoUpdates {
    async fn step(&mut self) -> UpdateStep {
        UpdateStep::Idle
    }
}

/// What the cycle controller should do after [`UpdateListener::service_once`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    Idle,
    InProgress,
    /// A new application image is in place; the node should restart into it.
    RestartRequired,
    Abandoned,
}

pub struct UpdateListener<U> {
    service: U,
    active: Option<ImageKind>,
    reported_decile: u8,
}

impl<U: UpdateService> UpdateListener<U> {
    #[must_use]
    pub const fn new(service: U) -> Self {
        Self {
            service,
            active: None,
            reported_decile: 0,
        }
    }

    #[must_use]
    pub fn active(&self) -> Option<ImageKind> {
        self.active
    }

    pub async fn service_once<E: EventSink>(&mut self, events: &mut E) -> UpdateOutcome {
        match self.service.step().await {
            UpdateStep::Idle if self.active.is_some() => UpdateOutcome::InProgress,
            UpdateStep::Idle => UpdateOutcome::Idle,
            UpdateStep::Started { kind, .. } => {
                self.active = Some(kind);
                self.reported_decile = 0;
                events.record(&NodeEvent::UpdateStarted(kind));
                UpdateOutcome::InProgress
            }
            UpdateStep::Progress { received, total } => {
                let decile = progress_decile(received, total);
                if decile > self.reported_decile {
                    self.reported_decile = decile;
                    events.record(&NodeEvent::UpdateProgress {
                        percent: decile * 10,
                    });
                }
                UpdateOutcome::InProgress
            }
            UpdateStep::Completed(kind) => {
                self.active = None;
                events.record(&NodeEvent::UpdateFinished);
                if kind == ImageKind::Application {
                    events.record(&NodeEvent::RestartRequested);
                    UpdateOutcome::RestartRequired
                } else {
                    UpdateOutcome::Idle
                }
            }
            UpdateStep::Failed(error) => {
                self.active = None;
                events.record(&NodeEvent::UpdateFailed(error));
                UpdateOutcome::Abandoned
            }
        }
    }
}

fn progress_decile(received: u32, total: u32) -> u8 {
    if total == 0 {
        return 10;
    }
    let percent = u64::from(received.min(total)) * 100 / u64::from(total);
    u8::try_from(percent / 10).unwrap_or(10)
}
