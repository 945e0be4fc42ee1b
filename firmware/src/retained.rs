//! Boot counter word in RTC fast memory.
//!
//! The section is not initialised by the runtime, so the word survives deep
//! sleep. Its content after power-on is garbage; [`RtcBootCounter::attach`]
//! resets it on a cold boot.

use node_core::cycle::{INITIAL_BOOT_COUNT, RetainedCell};
use node_core::events::WakeCause;

#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut BOOT_COUNT: u32 = INITIAL_BOOT_COUNT;

/// Handle onto the retained word. Only one exists.
pub struct RtcBootCounter(());

impl RtcBootCounter {
    /// # Safety
    ///
    /// Must be called once, before any other access to the word.
    pub unsafe fn attach(wake: WakeCause) -> Self {
        let mut cell = Self(());
        if wake == WakeCause::ColdBoot {
            cell.store(INITIAL_BOOT_COUNT);
        }
        cell
    }
}

impl RetainedCell for RtcBootCounter {
    fn load(&self) -> u32 {
        // SAFETY: single handle, single core, never touched from interrupts.
        unsafe { (&raw const BOOT_COUNT).read_volatile() }
    }

    fn store(&mut self, value: u32) {
        // SAFETY: as for `load`.
        unsafe { (&raw mut BOOT_COUNT).write_volatile(value) }
    }
}
