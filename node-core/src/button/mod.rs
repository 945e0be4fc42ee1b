//! Power-button interrupt handling.
//!
//! The interrupt routine only calls [`InterruptFlag::raise`]. Everything else,
//! register reads included, happens in [`ButtonHandler`] on task context.

use embedded_hal_async::delay::DelayNs;
use portable_atomic::{AtomicBool, Ordering};

use crate::config::CycleTiming;
use crate::connectivity::{AssociationHook, PollVerdict};
use crate::delay_millis;
use crate::events::{EventSink, NodeEvent};
use crate::power::{InterruptCause, PowerGateway};

/// Single-writer (interrupt) / single-reader (task) edge flag.
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Interrupt-safe: one store, no locks.
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clears the flag, returning whether it was set.
    #[must_use]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Engaged once a long press has been classified. The cycle controller checks
/// it before every step that would be visible after shutdown.
pub struct ShutdownLatch(AtomicBool);

impl ShutdownLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn engage(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ButtonState {
    Idle,
    Classifying,
    /// Terminal.
    ShuttingDown,
}

/// Result of one [`ButtonHandler::service_once`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ButtonOutcome {
    /// Flag was not raised.
    Quiet,
    Handled(InterruptCause),
    ShutdownIssued,
}

pub struct ButtonHandler<'a, P, D, E> {
    flag: &'a InterruptFlag,
    latch: &'a ShutdownLatch,
    power: P,
    delay: D,
    events: E,
    timing: CycleTiming,
    state: ButtonState,
}

impl<'a, P, D, E> ButtonHandler<'a, P, D, E>
where
    P: PowerGateway,
    D: DelayNs,
    E: EventSink,
{
    pub const fn new(
        flag: &'a InterruptFlag,
        latch: &'a ShutdownLatch,
        power: P,
        delay: D,
        events: E,
        timing: CycleTiming,
    ) -> Self {
        Self {
            flag,
            latch,
            power,
            delay,
            events,
            timing,
            state: ButtonState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> ButtonState {
        self.state
    }

    /// Handles at most one pending edge.
    pub async fn service_once(&mut self) -> ButtonOutcome {
        if self.state == ButtonState::ShuttingDown {
            return ButtonOutcome::ShutdownIssued;
        }
        if !self.flag.take() {
            return ButtonOutcome::Quiet;
        }

        self.state = ButtonState::Classifying;
        let cause = self.power.classify_pending_interrupt();
        // The source re-fires until acknowledged, whatever the cause.
        self.power.clear_interrupt();

        match cause {
            InterruptCause::LongPress => {
                self.state = ButtonState::ShuttingDown;
                self.latch.engage();
                self.events.record(&NodeEvent::LongPress);
                self.delay
                    .delay_ms(delay_millis(self.timing.shutdown_grace))
                    .await;
                self.events.record(&NodeEvent::ShutdownIssued);
                self.power.shutdown();
                return ButtonOutcome::ShutdownIssued;
            }
            InterruptCause::ShortPress => self.events.record(&NodeEvent::ShortPress),
            InterruptCause::None => self.events.record(&NodeEvent::SpuriousInterrupt),
        }

        self.state = ButtonState::Idle;
        ButtonOutcome::Handled(cause)
    }

    /// Polls the flag until a long press shuts the node down.
    pub async fn run(&mut self) {
        loop {
            if self.service_once().await == ButtonOutcome::ShutdownIssued {
                return;
            }
            self.delay
                .delay_ms(delay_millis(self.timing.button_poll))
                .await;
        }
    }
}

impl<P, D, E> AssociationHook for ButtonHandler<'_, P, D, E>
where
    P: PowerGateway,
    D: DelayNs,
    E: EventSink,
{
    async fn on_poll(&mut self) -> PollVerdict {
        match self.service_once().await {
            ButtonOutcome::ShutdownIssued => PollVerdict::Abort,
            _ => PollVerdict::Continue,
        }
    }
}
