//! Power-state gateway: the node's view of the power-management chip and the
//! deep-sleep controller.
//!
//! Implementations sit behind [`PowerGateway`]. The board glues the AXP192
//! driver in [`axp192`] to the RTC; the emulator fakes both.

use core::{fmt, time::Duration};

pub mod axp192;

/// Switchable output rails on the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerRail {
    /// LoRa radio supply.
    Lora,
    /// GNSS receiver supply.
    Gps,
    /// Auxiliary 3V3 header and display.
    Auxiliary,
    /// External enable line.
    External,
}

impl PowerRail {
    /// Rails the soil node never uses; switched off at boot.
    pub const UNUSED: [PowerRail; 2] = [PowerRail::Lora, PowerRail::Gps];
}

impl fmt::Display for PowerRail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerRail::Lora => f.write_str("lora"),
            PowerRail::Gps => f.write_str("gps"),
            PowerRail::Auxiliary => f.write_str("aux"),
            PowerRail::External => f.write_str("exten"),
        }
    }
}

/// Decoded cause behind a power-button interrupt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InterruptCause {
    None,
    ShortPress,
    LongPress,
}

/// Sources armed before the core halts in deep sleep.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WakeSources {
    pub timer: Option<Duration>,
    /// Wake on the physical button edge.
    pub button: bool,
}

impl WakeSources {
    /// Timer wake plus the button edge.
    #[must_use]
    pub const fn timer_and_button(duration: Duration) -> Self {
        Self {
            timer: Some(duration),
            button: true,
        }
    }
}

/// Operations the node needs from its power hardware.
///
/// `shutdown`, `enter_deep_sleep` and `restart` do not return on real
/// hardware. Host implementations return so callers can observe the request;
/// callers must treat the call as the end of their work.
pub trait PowerGateway {
    /// Battery voltage in volts. NaN when the reading is unavailable.
    fn battery_voltage(&mut self) -> f32;

    fn set_rail_enabled(&mut self, rail: PowerRail, on: bool);

    /// Arms the long-press interrupt source. Idempotent.
    fn enable_long_press_detection(&mut self);

    /// Reads the pending cause. Must be followed by [`clear_interrupt`](Self::clear_interrupt).
    fn classify_pending_interrupt(&mut self) -> InterruptCause;

    fn clear_interrupt(&mut self);

    fn shutdown(&mut self);

    fn enter_deep_sleep(&mut self, wake: WakeSources);

    fn restart(&mut self);
}

impl<T: PowerGateway + ?Sized> PowerGateway for &mut T {
    fn battery_voltage(&mut self) -> f32 {
        (**self).battery_voltage()
    }

    fn set_rail_enabled(&mut self, rail: PowerRail, on: bool) {
        (**self).set_rail_enabled(rail, on);
    }

    fn enable_long_press_detection(&mut self) {
        (**self).enable_long_press_detection();
    }

    fn classify_pending_interrupt(&mut self) -> InterruptCause {
        (**self).classify_pending_interrupt()
    }

    fn clear_interrupt(&mut self) {
        (**self).clear_interrupt();
    }

    fn shutdown(&mut self) {
        (**self).shutdown();
    }

    fn enter_deep_sleep(&mut self, wake: WakeSources) {
        (**self).enter_deep_sleep(wake);
    }

    fn restart(&mut self) {
        (**self).restart();
    }
}

/// Boot-time power configuration: unused rails off, stale interrupts
/// acknowledged, long-press detection armed.
pub fn prepare_power<P: PowerGateway>(power: &mut P) {
    for rail in PowerRail::UNUSED {
        power.set_rail_enabled(rail, false);
    }
    power.clear_interrupt();
    power.enable_long_press_detection();
}
