//! Power-state gateway for the T-Beam: AXP192 over I2C plus the RTC.
//!
//! Both the cycle task and the button task hold a `&BoardPower`; each
//! operation takes the lock only for its own register traffic.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use esp_hal::Blocking;
use esp_hal::i2c::master::I2c;
use esp_hal::peripherals::GPIO38;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::rtc_cntl::sleep::{Ext0WakeupSource, TimerWakeupSource, WakeSource, WakeupLevel};
use heapless::Vec;
use node_core::power::axp192::{Axp192, Axp192Error};
use node_core::power::{InterruptCause, PowerGateway, PowerRail, WakeSources};

pub type Pmu = Axp192<I2c<'static, Blocking>>;

struct Board {
    pmu: Pmu,
    rtc: Rtc<'static>,
    wake_button: Option<GPIO38<'static>>,
}

pub struct BoardPower {
    board: Mutex<CriticalSectionRawMutex, RefCell<Board>>,
}

impl BoardPower {
    pub fn new(pmu: Pmu, rtc: Rtc<'static>, wake_button: GPIO38<'static>) -> Self {
        Self {
            board: Mutex::new(RefCell::new(Board {
                pmu,
                rtc,
                wake_button: Some(wake_button),
            })),
        }
    }

    fn with_pmu<T>(&self, op: impl FnOnce(&mut Pmu) -> T) -> T {
        self.board.lock(|board| op(&mut board.borrow_mut().pmu))
    }
}

fn report<T, E: core::fmt::Debug>(what: &str, result: Result<T, Axp192Error<E>>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            defmt::warn!("pmu: {} failed: {}", what, defmt::Display2Format(&error));
            None
        }
    }
}

impl PowerGateway for &BoardPower {
    fn battery_voltage(&mut self) -> f32 {
        let millivolts = report("battery read", self.with_pmu(Axp192::battery_millivolts));
        millivolts
            .and_then(|mv| u16::try_from(mv).ok())
            .map_or(f32::NAN, |mv| f32::from(mv) / 1000.0)
    }

    fn set_rail_enabled(&mut self, rail: PowerRail, on: bool) {
        report("rail switch", self.with_pmu(|pmu| pmu.set_rail(rail, on)));
    }

    fn enable_long_press_detection(&mut self) {
        report("irq enable", self.with_pmu(|pmu| pmu.enable_long_press_irq(true)));
    }

    fn classify_pending_interrupt(&mut self) -> InterruptCause {
        report("irq status", self.with_pmu(Axp192::classify_irq)).unwrap_or(InterruptCause::None)
    }

    fn clear_interrupt(&mut self) {
        report("irq clear", self.with_pmu(Axp192::clear_irq));
    }

    fn shutdown(&mut self) {
        report("shutdown", self.with_pmu(Axp192::shutdown));
    }

    fn enter_deep_sleep(&mut self, wake: WakeSources) {
        self.board.lock(|board| {
            let mut board = board.borrow_mut();
            let timer = wake.timer.map(TimerWakeupSource::new);
            let button = if wake.button {
                board
                    .wake_button
                    .take()
                    .map(|pin| Ext0WakeupSource::new(pin, WakeupLevel::Low))
            } else {
                None
            };

            let mut sources: Vec<&dyn WakeSource, 2> = Vec::new();
            if let Some(timer) = &timer {
                let _ = sources.push(timer);
            }
            if let Some(button) = &button {
                let _ = sources.push(button);
            }
            board.rtc.sleep_deep(&sources);
        });
    }

    fn restart(&mut self) {
        esp_hal::system::software_reset();
    }
}
