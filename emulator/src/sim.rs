//! Simulated T-Beam: one shared world state behind the collaborator traits.
//!
//! The operator console mutates the world from its own thread; the node
//! components only ever see it through the trait handles below.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use embassy_time::Timer;
use node_core::config::{BrokerConfig, WifiCredentials};
use node_core::connectivity::{
    BrokerSession, PublishError, SessionError, StatusIndicator, WirelessLink,
};
use node_core::cycle::{INITIAL_BOOT_COUNT, RetainedCell};
use node_core::power::{InterruptCause, PowerGateway, PowerRail, WakeSources};
use node_core::update::{UpdateService, UpdateStep};
use rand_core::{RngCore, impls};

/// Time the simulated access point takes to hand out a lease.
const ASSOCIATION_LATENCY: Duration = Duration::from_millis(1_500);
const HANDSHAKE_LATENCY_MS: u64 = 200;
/// Reason code a refusing broker answers with.
const REFUSED_NOT_AUTHORIZED: u8 = 5;

/// Terminal power request issued during a boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerRequest {
    DeepSleep(WakeSources),
    Shutdown,
    Restart,
}

#[derive(Debug)]
pub struct WorldState {
    pub ap_reachable: bool,
    pub associated: bool,
    associate_at: Option<Instant>,
    pub address: Ipv4Addr,
    pub session_active: bool,
    pub session_rejections: u32,
    pub publish_failures: u32,
    pub published: u32,
    pub battery_millivolts: u32,
    pub pending_cause: InterruptCause,
    pub long_press_armed: bool,
    pub lora_rail: bool,
    pub gps_rail: bool,
    pub led_on: bool,
    pub retained: u32,
    pub request: Option<PowerRequest>,
    pub updates: VecDeque<UpdateStep>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            ap_reachable: true,
            associated: false,
            associate_at: None,
            address: Ipv4Addr::new(192, 168, 4, 23),
            session_active: false,
            session_rejections: 0,
            publish_failures: 0,
            published: 0,
            battery_millivolts: 4_012,
            pending_cause: InterruptCause::None,
            long_press_armed: false,
            lora_rail: true,
            gps_rail: true,
            led_on: false,
            retained: INITIAL_BOOT_COUNT,
            request: None,
            updates: VecDeque::new(),
        }
    }
}

impl WorldState {
    fn refresh_association(&mut self) {
        if !self.associated
            && self.ap_reachable
            && self.associate_at.is_some_and(|at| Instant::now() >= at)
        {
            self.associated = true;
            self.associate_at = None;
        }
    }

    /// Losing the access point drops the lease and any session riding on it.
    pub fn set_link(&mut self, up: bool) {
        self.ap_reachable = up;
        if !up {
            self.associated = false;
            self.associate_at = None;
            self.session_active = false;
        }
    }

    /// Everything volatile resets on a boot; the retained word and the
    /// outside world survive.
    pub fn power_cycle(&mut self) {
        self.associated = false;
        self.associate_at = None;
        self.session_active = false;
        self.long_press_armed = false;
        self.lora_rail = true;
        self.gps_rail = true;
        self.led_on = false;
        self.request = None;
        self.updates.clear();
    }
}

#[derive(Clone, Default)]
pub struct World(Arc<Mutex<WorldState>>);

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut WorldState) -> T) -> T {
        f(&mut self.lock())
    }
}

pub struct SimLink(pub World);

impl WirelessLink for SimLink {
    async fn restart_station(&mut self) {
        self.0.with(|world| {
            world.associated = false;
            world.associate_at = None;
            world.session_active = false;
        });
    }

    async fn begin(&mut self, _credentials: &WifiCredentials) {
        self.0
            .with(|world| world.associate_at = Some(Instant::now() + ASSOCIATION_LATENCY));
    }

    fn is_associated(&self) -> bool {
        self.0.with(|world| {
            world.refresh_association();
            world.associated
        })
    }

    fn address(&self) -> Option<Ipv4Addr> {
        self.0
            .with(|world| world.associated.then_some(world.address))
    }
}

pub struct SimSession(pub World);

impl BrokerSession for SimSession {
    async fn open(&mut self, _broker: &BrokerConfig) -> Result<(), SessionError> {
        Timer::after_millis(HANDSHAKE_LATENCY_MS).await;
        self.0.with(|world| {
            if !world.associated {
                return Err(SessionError::Connect);
            }
            if world.session_rejections > 0 {
                world.session_rejections -= 1;
                return Err(SessionError::Refused(REFUSED_NOT_AUTHORIZED));
            }
            world.session_active = true;
            Ok(())
        })
    }

    fn is_active(&self) -> bool {
        self.0.with(|world| world.session_active)
    }

    async fn publish(&mut self, _topic: &str, _payload: &str) -> Result<(), PublishError> {
        self.0.with(|world| {
            if !world.session_active {
                return Err(PublishError::NoSession);
            }
            if world.publish_failures > 0 {
                world.publish_failures -= 1;
                world.session_active = false;
                return Err(PublishError::Transport);
            }
            world.published = world.published.saturating_add(1);
            Ok(())
        })
    }

    async fn pump(&mut self) {
        self.0.with(|world| {
            if !world.associated {
                world.session_active = false;
            }
        });
    }
}

pub struct SimLed(pub World);

impl StatusIndicator for SimLed {
    fn set(&mut self, on: bool) {
        self.0.with(|world| world.led_on = on);
    }

    fn toggle(&mut self) {
        self.0.with(|world| world.led_on = !world.led_on);
    }
}

#[derive(Clone)]
pub struct SimPower(pub World);

impl PowerGateway for SimPower {
    fn battery_voltage(&mut self) -> f32 {
        let millivolts = self.0.with(|world| world.battery_millivolts);
        // Millivolts stay well inside f32's exact integer range.
        #[allow(clippy::cast_precision_loss)]
        let volts = millivolts as f32 / 1000.0;
        volts
    }

    fn set_rail_enabled(&mut self, rail: PowerRail, on: bool) {
        self.0.with(|world| match rail {
            PowerRail::Lora => world.lora_rail = on,
            PowerRail::Gps => world.gps_rail = on,
            PowerRail::Auxiliary | PowerRail::External => {}
        });
    }

    fn enable_long_press_detection(&mut self) {
        self.0.with(|world| world.long_press_armed = true);
    }

    fn classify_pending_interrupt(&mut self) -> InterruptCause {
        self.0.with(|world| world.pending_cause)
    }

    fn clear_interrupt(&mut self) {
        self.0.with(|world| world.pending_cause = InterruptCause::None);
    }

    fn shutdown(&mut self) {
        self.0.with(|world| world.request = Some(PowerRequest::Shutdown));
    }

    fn enter_deep_sleep(&mut self, wake: WakeSources) {
        self.0
            .with(|world| world.request = Some(PowerRequest::DeepSleep(wake)));
    }

    fn restart(&mut self) {
        self.0.with(|world| world.request = Some(PowerRequest::Restart));
    }
}

pub struct SimRetained(pub World);

impl RetainedCell for SimRetained {
    fn load(&self) -> u32 {
        self.0.with(|world| world.retained)
    }

    fn store(&mut self, value: u32) {
        self.0.with(|world| world.retained = value);
    }
}

/// Drains steps queued by in-process pushes.
pub struct SimUpdates(pub World);

impl UpdateService for SimUpdates {
    async fn step(&mut self) -> UpdateStep {
        self.0
            .with(|world| world.updates.pop_front())
            .unwrap_or(UpdateStep::Idle)
    }
}

/// Xorshift generator; plenty for synthetic readings and nonces.
pub struct XorShift(u32);

impl XorShift {
    pub fn seeded() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.subsec_nanos());
        Self(nanos | 1)
    }
}

impl RngCore for XorShift {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
