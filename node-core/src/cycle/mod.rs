//! Telemetry cycle controller.
//!
//! One [`pass`](CycleController::pass) services updates, keeps the session
//! alive, and publishes at most one sample. A successful publish ends the boot:
//! the counter advances and the node is put into deep sleep. No pass samples
//! or sleeps while an image transfer is active.

use core::fmt::{self, Write as _};

use embedded_hal_async::delay::DelayNs;
use heapless::String;

use crate::button::ShutdownLatch;
use crate::config::NodeConfig;
use crate::connectivity::{
    Association, BrokerSession, ConnectivityManager, PublishError, SessionState,
    StatusIndicator, WirelessLink,
};
use crate::delay_millis;
use crate::events::{EventSink, NodeEvent, WakeCause};
use crate::power::{PowerGateway, WakeSources};
use crate::sensors::SoilProbe;
use crate::update::{UpdateListener, UpdateOutcome, UpdateService};

/// Boot counter value after a cold boot.
pub const INITIAL_BOOT_COUNT: u32 = 1;
/// Room for the largest payload four `f32`s can produce.
pub const PAYLOAD_CAPACITY: usize = 256;

pub type Payload = String<PAYLOAD_CAPACITY>;

/// One word of memory that survives deep sleep but not power loss.
pub trait RetainedCell {
    fn load(&self) -> u32;
    fn store(&mut self, value: u32);
}

/// Completed-cycle counter kept in retained memory.
pub struct BootCounter<R> {
    cell: R,
}

impl<R: RetainedCell> BootCounter<R> {
    #[must_use]
    pub const fn new(cell: R) -> Self {
        Self { cell }
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.cell.load()
    }

    /// Called once per successful publish. Saturates rather than wrapping so
    /// the count never goes backwards.
    pub fn advance(&mut self) -> u32 {
        let next = self.cell.load().saturating_add(1);
        self.cell.store(next);
        next
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PayloadError {
    Overflow,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Overflow => f.write_str("payload exceeds buffer"),
        }
    }
}

/// One cycle's reading.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TelemetrySample {
    pub boot_count: u32,
    /// Degrees Celsius.
    pub soil_temperature: f32,
    /// Percent.
    pub soil_moisture: f32,
    /// Volts.
    pub battery_voltage: f32,
}

impl TelemetrySample {
    /// Renders the flat JSON document published each cycle. Non-finite
    /// readings become `null`.
    ///
    /// # Errors
    ///
    /// [`PayloadError::Overflow`] if the text does not fit [`PAYLOAD_CAPACITY`].
    pub fn encode(&self) -> Result<Payload, PayloadError> {
        let mut out = Payload::new();
        write!(out, "{{\"bootCnt\":{},\"soilTemperature\":", self.boot_count)
            .map_err(|_| PayloadError::Overflow)?;
        write_reading(&mut out, self.soil_temperature, 2)?;
        out.push_str(",\"soilMoisture\":")
            .map_err(|_| PayloadError::Overflow)?;
        write_reading(&mut out, self.soil_moisture, 2)?;
        out.push_str(",\"batVoltage\":")
            .map_err(|_| PayloadError::Overflow)?;
        write_reading(&mut out, self.battery_voltage, 3)?;
        out.push('}').map_err(|_| PayloadError::Overflow)?;
        Ok(out)
    }
}

fn write_reading(out: &mut Payload, value: f32, decimals: usize) -> Result<(), PayloadError> {
    if value.is_finite() {
        write!(out, "{value:.decimals$}")
    } else {
        out.write_str("null")
    }
    .map_err(|_| PayloadError::Overflow)
}

/// Result of a single pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PassOutcome {
    /// Link was down; this pass re-associated (or was aborted trying).
    Reassociated(Association),
    /// Associated, but the session could not be brought up this pass.
    NoSession,
    PublishFailed(PublishError),
    PayloadRejected,
    /// An image transfer is underway; nothing was sampled and sleep is held
    /// off until it completes or fails.
    UpdatePending,
    /// Published; deep sleep has been requested. Terminal.
    Sleeping { next_boot_count: u32 },
    /// A long press was classified. Terminal.
    ShuttingDown,
    /// A new application image is in place. Terminal.
    Restarting,
}

impl PassOutcome {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            PassOutcome::Sleeping { .. } | PassOutcome::ShuttingDown | PassOutcome::Restarting
        )
    }
}

/// Collaborators owned by a [`CycleController`].
pub struct CycleParts<L, S, I, D, P, Q, R, U, E> {
    pub connectivity: ConnectivityManager<L, S, I, D>,
    pub power: P,
    pub probe: Q,
    pub counter: BootCounter<R>,
    pub updates: UpdateListener<U>,
    pub events: E,
    pub delay: D,
}

pub struct CycleController<'a, L, S, I, D, P, Q, R, U, E> {
    config: &'a NodeConfig,
    latch: &'a ShutdownLatch,
    connectivity: ConnectivityManager<L, S, I, D>,
    power: P,
    probe: Q,
    counter: BootCounter<R>,
    updates: UpdateListener<U>,
    events: E,
    delay: D,
}

impl<'a, L, S, I, D, P, Q, R, U, E> CycleController<'a, L, S, I, D, P, Q, R, U, E>
where
    L: WirelessLink,
    S: BrokerSession,
    I: StatusIndicator,
    D: DelayNs,
    P: PowerGateway,
    Q: SoilProbe,
    R: RetainedCell,
    U: UpdateService,
    E: EventSink,
{
    pub fn new(
        config: &'a NodeConfig,
        latch: &'a ShutdownLatch,
        parts: CycleParts<L, S, I, D, P, Q, R, U, E>,
    ) -> Self {
        Self {
            config,
            latch,
            connectivity: parts.connectivity,
            power: parts.power,
            probe: parts.probe,
            counter: parts.counter,
            updates: parts.updates,
            events: parts.events,
            delay: parts.delay,
        }
    }

    #[must_use]
    pub fn boot_count(&self) -> u32 {
        self.counter.value()
    }

    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.connectivity.state()
    }

    /// Logs the boot banner line.
    pub fn announce_boot(&mut self, wake: WakeCause) {
        self.events.record(&NodeEvent::Boot {
            boot_count: self.counter.value(),
            wake,
        });
    }

    /// Passes until one of them is terminal; returns that outcome.
    pub async fn run(&mut self) -> PassOutcome {
        loop {
            let outcome = self.pass().await;
            if outcome.is_terminal() {
                return outcome;
            }
            self.delay.delay_ms(delay_millis(self.config.timing.idle)).await;
        }
    }

    pub async fn pass(&mut self) -> PassOutcome {
        if self.latch.is_engaged() {
            return PassOutcome::ShuttingDown;
        }

        match self.updates.service_once(&mut self.events).await {
            UpdateOutcome::RestartRequired => {
                self.power.restart();
                return PassOutcome::Restarting;
            }
            UpdateOutcome::InProgress => {
                // Keep the broker session warm; the transfer owns this pass.
                self.connectivity.pump().await;
                return PassOutcome::UpdatePending;
            }
            UpdateOutcome::Idle | UpdateOutcome::Abandoned => {}
        }

        // Handshakes are only worth attempting over a live link; a dead link is
        // repaired below and the session follows on the next pass.
        if self.connectivity.is_associated() && !self.connectivity.is_session_active() {
            self.connectivity
                .ensure_session(&self.config.broker, &mut self.events)
                .await;
        }
        if self.latch.is_engaged() {
            return PassOutcome::ShuttingDown;
        }

        self.connectivity.pump().await;

        if !self.connectivity.is_associated() {
            let association = self
                .connectivity
                .ensure_associated(&self.config.wifi, &mut (), &mut self.events)
                .await;
            return PassOutcome::Reassociated(association);
        }
        if !self.connectivity.is_session_active() {
            return PassOutcome::NoSession;
        }
        if self.latch.is_engaged() {
            return PassOutcome::ShuttingDown;
        }

        let sample = self.sample();
        self.events.record(&NodeEvent::Sampled {
            boot_count: sample.boot_count,
        });
        let Ok(payload) = sample.encode() else {
            return PassOutcome::PayloadRejected;
        };

        if self.latch.is_engaged() {
            return PassOutcome::ShuttingDown;
        }
        if let Err(error) = self
            .connectivity
            .publish(self.config.broker.telemetry_topic, &payload)
            .await
        {
            self.events.record(&NodeEvent::PublishFailed(error));
            return PassOutcome::PublishFailed(error);
        }

        self.events.record(&NodeEvent::Published { payload: &payload });
        let next_boot_count = self.counter.advance();
        if self.latch.is_engaged() {
            return PassOutcome::ShuttingDown;
        }

        let wake = WakeSources::timer_and_button(self.config.timing.sleep);
        self.events.record(&NodeEvent::SleepArmed {
            duration: self.config.timing.sleep,
            button_wake: wake.button,
        });
        self.power.enter_deep_sleep(wake);
        PassOutcome::Sleeping { next_boot_count }
    }

    fn sample(&mut self) -> TelemetrySample {
        TelemetrySample {
            boot_count: self.counter.value(),
            soil_temperature: self.probe.soil_temperature(),
            soil_moisture: self.probe.soil_moisture(),
            battery_voltage: self.power.battery_voltage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    struct Word(Cell<u32>);

    impl RetainedCell for &Word {
        fn load(&self) -> u32 {
            self.0.get()
        }

        fn store(&mut self, value: u32) {
            self.0.set(value);
        }
    }

    #[test]
    fn payload_matches_wire_shape() {
        let sample = TelemetrySample {
            boot_count: 1,
            soil_temperature: 23.10,
            soil_moisture: 41.07,
            battery_voltage: 3.987,
        };
        assert_eq!(
            sample.encode().unwrap().as_str(),
            r#"{"bootCnt":1,"soilTemperature":23.10,"soilMoisture":41.07,"batVoltage":3.987}"#
        );
    }

    #[test]
    fn payload_rounds_to_fixed_decimals() {
        let sample = TelemetrySample {
            boot_count: 4_294_967_295,
            soil_temperature: 10.0,
            soil_moisture: 0.004,
            battery_voltage: 4.2,
        };
        assert_eq!(
            sample.encode().unwrap().as_str(),
            r#"{"bootCnt":4294967295,"soilTemperature":10.00,"soilMoisture":0.00,"batVoltage":4.200}"#
        );
    }

    #[test]
    fn non_finite_readings_encode_as_null() {
        let sample = TelemetrySample {
            boot_count: 7,
            soil_temperature: f32::NAN,
            soil_moisture: f32::INFINITY,
            battery_voltage: f32::NAN,
        };
        assert_eq!(
            sample.encode().unwrap().as_str(),
            r#"{"bootCnt":7,"soilTemperature":null,"soilMoisture":null,"batVoltage":null}"#
        );
    }

    #[test]
    fn extreme_readings_still_fit() {
        let sample = TelemetrySample {
            boot_count: u32::MAX,
            soil_temperature: f32::MAX,
            soil_moisture: -f32::MAX,
            battery_voltage: f32::MAX,
        };
        assert!(sample.encode().is_ok());
    }

    #[test]
    fn counter_advances_by_one_and_saturates() {
        let word = Word(Cell::new(INITIAL_BOOT_COUNT));
        let mut counter = BootCounter::new(&word);
        assert_eq!(counter.value(), 1);
        assert_eq!(counter.advance(), 2);
        assert_eq!(word.0.get(), 2);

        word.0.set(u32::MAX);
        assert_eq!(counter.advance(), u32::MAX);
    }
}
