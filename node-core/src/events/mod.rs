//! Event catalog shared by every node component.
//!
//! Components never print. They hand a [`NodeEvent`] to an [`EventSink`] and
//! the target decides where the line goes: defmt on the board, stdout in the
//! emulator, an [`EventJournal`] in tests.

use core::{fmt, net::Ipv4Addr, time::Duration};

use heapless::{HistoryBuf, OldestOrdered};

use crate::connectivity::{PublishError, SessionError};
use crate::update::{ImageKind, UpdateError};

/// Why the node woke up, as reported by the RTC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeCause {
    ColdBoot,
    Timer,
    Button,
    Other,
}

impl fmt::Display for WakeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeCause::ColdBoot => f.write_str("cold boot"),
            WakeCause::Timer => f.write_str("timer"),
            WakeCause::Button => f.write_str("button"),
            WakeCause::Other => f.write_str("other"),
        }
    }
}

/// Severity attached to each event.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Everything a node component can report.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum NodeEvent<'a> {
    Boot { boot_count: u32, wake: WakeCause },
    AssociationStarted { ssid: &'a str },
    AssociationPoll { attempt: u32 },
    Associated { address: Option<Ipv4Addr> },
    SessionAttempt { host: &'a str, port: u16 },
    SessionOpened,
    SessionRejected { error: SessionError, retry_in: Duration },
    SessionDeferred,
    Sampled { boot_count: u32 },
    Published { payload: &'a str },
    PublishFailed(PublishError),
    SleepArmed { duration: Duration, button_wake: bool },
    ShortPress,
    LongPress,
    SpuriousInterrupt,
    ShutdownIssued,
    UpdateStarted(ImageKind),
    UpdateProgress { percent: u8 },
    UpdateFinished,
    UpdateFailed(UpdateError),
    RestartRequested,
}

/// Payload-free discriminant of a [`NodeEvent`], cheap to store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    Boot,
    AssociationStarted,
    AssociationPoll,
    Associated,
    SessionAttempt,
    SessionOpened,
    SessionRejected,
    SessionDeferred,
    Sampled,
    Published,
    PublishFailed,
    SleepArmed,
    ShortPress,
    LongPress,
    SpuriousInterrupt,
    ShutdownIssued,
    UpdateStarted,
    UpdateProgress,
    UpdateFinished,
    UpdateFailed,
    RestartRequested,
}

impl NodeEvent<'_> {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            NodeEvent::Boot { .. } => EventKind::Boot,
            NodeEvent::AssociationStarted { .. } => EventKind::AssociationStarted,
            NodeEvent::AssociationPoll { .. } => EventKind::AssociationPoll,
            NodeEvent::Associated { .. } => EventKind::Associated,
            NodeEvent::SessionAttempt { .. } => EventKind::SessionAttempt,
            NodeEvent::SessionOpened => EventKind::SessionOpened,
            NodeEvent::SessionRejected { .. } => EventKind::SessionRejected,
            NodeEvent::SessionDeferred => EventKind::SessionDeferred,
            NodeEvent::Sampled { .. } => EventKind::Sampled,
            NodeEvent::Published { .. } => EventKind::Published,
            NodeEvent::PublishFailed(_) => EventKind::PublishFailed,
            NodeEvent::SleepArmed { .. } => EventKind::SleepArmed,
            NodeEvent::ShortPress => EventKind::ShortPress,
            NodeEvent::LongPress => EventKind::LongPress,
            NodeEvent::SpuriousInterrupt => EventKind::SpuriousInterrupt,
            NodeEvent::ShutdownIssued => EventKind::ShutdownIssued,
            NodeEvent::UpdateStarted(_) => EventKind::UpdateStarted,
            NodeEvent::UpdateProgress { .. } => EventKind::UpdateProgress,
            NodeEvent::UpdateFinished => EventKind::UpdateFinished,
            NodeEvent::UpdateFailed(_) => EventKind::UpdateFailed,
            NodeEvent::RestartRequested => EventKind::RestartRequested,
        }
    }

    #[must_use]
    pub const fn level(&self) -> EventLevel {
        match self {
            NodeEvent::SessionRejected { .. }
            | NodeEvent::PublishFailed(_)
            | NodeEvent::SpuriousInterrupt
            | NodeEvent::SessionDeferred => EventLevel::Warn,
            NodeEvent::UpdateFailed(_) | NodeEvent::LongPress | NodeEvent::ShutdownIssued => {
                EventLevel::Error
            }
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for NodeEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::Boot { boot_count, wake } => {
                write!(f, "boot #{boot_count} (wake: {wake})")
            }
            NodeEvent::AssociationStarted { ssid } => write!(f, "wifi: connecting to {ssid}"),
            NodeEvent::AssociationPoll { attempt } => write!(f, "wifi: waiting ({attempt})"),
            NodeEvent::Associated {
                address: Some(address),
            } => write!(f, "wifi: connected, ip {address}"),
            NodeEvent::Associated { address: None } => {
                f.write_str("wifi: connected, no address yet")
            }
            NodeEvent::SessionAttempt { host, port } => {
                write!(f, "mqtt: connecting to {host}:{port}")
            }
            NodeEvent::SessionOpened => f.write_str("mqtt: session open"),
            NodeEvent::SessionRejected { error, retry_in } => write!(
                f,
                "mqtt: connect failed ({error}), retrying in {}s",
                retry_in.as_secs()
            ),
            NodeEvent::SessionDeferred => f.write_str("mqtt: link lost while reconnecting"),
            NodeEvent::Sampled { boot_count } => write!(f, "sample taken for cycle {boot_count}"),
            NodeEvent::Published { payload } => write!(f, "published: {payload}"),
            NodeEvent::PublishFailed(error) => write!(f, "publish failed: {error}"),
            NodeEvent::SleepArmed {
                duration,
                button_wake,
            } => {
                write!(f, "deep sleep for {}s", duration.as_secs())?;
                if *button_wake {
                    f.write_str(" (button wake armed)")?;
                }
                Ok(())
            }
            NodeEvent::ShortPress => f.write_str("button: short press"),
            NodeEvent::LongPress => f.write_str("button: long press, shutting down"),
            NodeEvent::SpuriousInterrupt => f.write_str("button: interrupt with no cause"),
            NodeEvent::ShutdownIssued => f.write_str("power: shutdown"),
            NodeEvent::UpdateStarted(kind) => write!(f, "update: receiving {kind} image"),
            NodeEvent::UpdateProgress { percent } => write!(f, "update: {percent}%"),
            NodeEvent::UpdateFinished => f.write_str("update: complete"),
            NodeEvent::UpdateFailed(error) => write!(f, "update: failed ({error})"),
            NodeEvent::RestartRequested => f.write_str("restarting into new image"),
        }
    }
}

/// Destination for [`NodeEvent`]s.
pub trait EventSink {
    fn record(&mut self, event: &NodeEvent<'_>);
}

impl<T: EventSink + ?Sized> EventSink for &mut T {
    fn record(&mut self, event: &NodeEvent<'_>) {
        (**self).record(event);
    }
}

/// Bounded history of recent event kinds.
pub struct EventJournal<const N: usize> {
    ring: HistoryBuf<EventKind, N>,
    total: u32,
}

impl<const N: usize> EventJournal<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            total: 0,
        }
    }

    /// Chronological view of the retained kinds.
    #[must_use]
    pub fn oldest_first(&self) -> OldestOrdered<'_, EventKind> {
        self.ring.oldest_ordered()
    }

    #[must_use]
    pub fn latest(&self) -> Option<EventKind> {
        self.ring.recent().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Events recorded since creation, including those evicted from the ring.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.ring.oldest_ordered().filter(|k| **k == kind).count()
    }

    #[must_use]
    pub fn contains(&self, kind: EventKind) -> bool {
        self.count(kind) > 0
    }
}

impl<const N: usize> Default for EventJournal<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> EventSink for EventJournal<N> {
    fn record(&mut self, event: &NodeEvent<'_>) {
        self.ring.write(event.kind());
        self.total = self.total.saturating_add(1);
    }
}
