#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Serial console and association LED.
//!
//! Both sit behind one lock: a log line and an LED toggle never interleave,
//! whichever task issues them.

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_hal::digital::{OutputPin, PinState};
use node_core::connectivity::StatusIndicator;
use node_core::events::{EventLevel, EventSink, NodeEvent};

struct Shared<P> {
    led: Option<P>,
    led_on: bool,
}

impl<P: OutputPin> Shared<P> {
    fn drive(&mut self, on: bool) {
        self.led_on = on;
        if let Some(led) = self.led.as_mut() {
            // GPIO writes on this board are infallible.
            let _ = led.set_state(PinState::from(on));
        }
    }
}

pub struct Console<P> {
    shared: Mutex<CriticalSectionRawMutex, RefCell<Shared<P>>>,
}

impl<P: OutputPin> Console<P> {
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                led: None,
                led_on: false,
            })),
        }
    }

    /// Hands the LED pin to the console; it starts off.
    pub fn attach_led(&self, led: P) {
        self.shared.lock(|shared| {
            let mut shared = shared.borrow_mut();
            shared.led = Some(led);
            shared.drive(false);
        });
    }

    pub fn line(&self, level: EventLevel, args: fmt::Arguments<'_>) {
        self.shared.lock(|_| emit(level, args));
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.line(EventLevel::Info, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.line(EventLevel::Error, args);
    }
}

impl<P: OutputPin> Default for Console<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: OutputPin> EventSink for &Console<P> {
    fn record(&mut self, event: &NodeEvent<'_>) {
        self.line(event.level(), format_args!("{event}"));
    }
}

impl<P: OutputPin> StatusIndicator for &Console<P> {
    fn set(&mut self, on: bool) {
        self.shared.lock(|shared| shared.borrow_mut().drive(on));
    }

    fn toggle(&mut self) {
        self.shared.lock(|shared| {
            let mut shared = shared.borrow_mut();
            let next = !shared.led_on;
            shared.drive(next);
        });
    }
}

#[cfg(target_os = "none")]
fn emit(level: EventLevel, args: fmt::Arguments<'_>) {
    let line = defmt::Display2Format(&args);
    match level {
        EventLevel::Info => defmt::info!("{}", line),
        EventLevel::Warn => defmt::warn!("{}", line),
        EventLevel::Error => defmt::error!("{}", line),
    }
}

#[cfg(not(target_os = "none"))]
fn emit(level: EventLevel, args: fmt::Arguments<'_>) {
    match level {
        EventLevel::Info => println!("{args}"),
        EventLevel::Warn => println!("warn: {args}"),
        EventLevel::Error => println!("error: {args}"),
    }
}
