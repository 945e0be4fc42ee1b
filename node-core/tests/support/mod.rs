#![allow(dead_code)]

//! Shared bench for the node-core integration tests.
//!
//! Every mock is a thin handle onto one `BenchState`, so a test can script the
//! world and afterwards read a single timeline of everything the components
//! did, in the order they did it.

use std::cell::RefCell;
use std::rc::Rc;

use embassy_futures::yield_now;
use embedded_hal_async::delay::DelayNs;
use node_core::button::{ButtonHandler, InterruptFlag, ShutdownLatch};
use node_core::config::{BrokerConfig, NodeConfig, WifiCredentials};
use node_core::connectivity::{
    BrokerSession, ConnectivityManager, PublishError, SessionError, StatusIndicator,
    WirelessLink,
};
use node_core::cycle::{
    BootCounter, CycleController, CycleParts, INITIAL_BOOT_COUNT, RetainedCell,
};
use node_core::events::{EventKind, EventSink, NodeEvent};
use node_core::power::{InterruptCause, PowerGateway, PowerRail, WakeSources};
use node_core::sensors::SoilProbe;
use node_core::update::{NoUpdates, UpdateListener};

/// Something observable that happened on the bench.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Event(EventKind, String),
    StationRestart,
    AssociationBegin,
    SessionOpen,
    Pump,
    SensorRead,
    BatteryRead,
    PublishAttempt {
        payload: String,
        associated: bool,
        session_active: bool,
    },
    PublishDone(bool),
    Rail(PowerRail, bool),
    LongPressArmed,
    Classify(InterruptCause),
    ClearInterrupt,
    Shutdown,
    DeepSleep(WakeSources),
    Restart,
}

pub struct BenchState {
    pub timeline: Vec<Action>,
    pub clock_ns: u64,
    pub associated: bool,
    /// Virtual time after `begin` at which association completes. `None` never.
    pub association_latency_ns: Option<u64>,
    pub associate_at: Option<u64>,
    pub session_active: bool,
    pub session_rejections: u32,
    pub publish_failures: u32,
    /// Next pump drops the link and the session with it.
    pub drop_link_on_pump: bool,
    pub pending_cause: InterruptCause,
    pub temperature: f32,
    pub moisture: f32,
    pub battery: f32,
    pub retained: u32,
    pub led_on: bool,
    pub led_toggles: u32,
}

impl Default for BenchState {
    fn default() -> Self {
        Self {
            timeline: Vec::new(),
            clock_ns: 0,
            associated: false,
            association_latency_ns: Some(0),
            associate_at: None,
            session_active: false,
            session_rejections: 0,
            publish_failures: 0,
            drop_link_on_pump: false,
            pending_cause: InterruptCause::None,
            temperature: 23.10,
            moisture: 41.07,
            battery: 3.987,
            retained: INITIAL_BOOT_COUNT,
            led_on: false,
            led_toggles: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct Bench(Rc<RefCell<BenchState>>);

impl Bench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut BenchState) -> T) -> T {
        f(&mut self.0.borrow_mut())
    }

    fn push(&self, action: Action) {
        self.with(|state| state.timeline.push(action));
    }

    pub fn timeline(&self) -> Vec<Action> {
        self.with(|state| state.timeline.clone())
    }

    pub fn events(&self) -> Vec<EventKind> {
        self.timeline()
            .into_iter()
            .filter_map(|action| match action {
                Action::Event(kind, _) => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn count_events(&self, kind: EventKind) -> usize {
        self.events().into_iter().filter(|k| *k == kind).count()
    }

    pub fn count(&self, predicate: impl Fn(&Action) -> bool) -> usize {
        self.timeline().iter().filter(|a| predicate(a)).count()
    }

    pub fn position(&self, predicate: impl Fn(&Action) -> bool) -> Option<usize> {
        self.timeline().iter().position(|a| predicate(a))
    }

    pub fn published_payloads(&self) -> Vec<String> {
        self.timeline()
            .into_iter()
            .filter_map(|action| match action {
                Action::Event(EventKind::Published, line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn retained(&self) -> u32 {
        self.with(|state| state.retained)
    }

    pub fn press(&self, cause: InterruptCause, flag: &InterruptFlag) {
        self.with(|state| state.pending_cause = cause);
        flag.raise();
    }

    fn link_up(&self) -> bool {
        self.with(|state| {
            if !state.associated && state.associate_at.is_some_and(|at| state.clock_ns >= at) {
                state.associated = true;
                state.associate_at = None;
            }
            state.associated
        })
    }
}

pub fn is_event(kind: EventKind) -> impl Fn(&Action) -> bool {
    move |action| matches!(action, Action::Event(k, _) if *k == kind)
}

pub struct VirtualDelay(pub Bench);

impl DelayNs for VirtualDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.with(|state| state.clock_ns += u64::from(ns));
        yield_now().await;
    }

    async fn delay_us(&mut self, us: u32) {
        self.0.with(|state| state.clock_ns += u64::from(us) * 1_000);
        yield_now().await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.0.with(|state| state.clock_ns += u64::from(ms) * 1_000_000);
        yield_now().await;
    }
}

pub struct MockLink(pub Bench);

impl WirelessLink for MockLink {
    async fn restart_station(&mut self) {
        self.0.with(|state| {
            state.associated = false;
            state.associate_at = None;
            state.session_active = false;
        });
        self.0.push(Action::StationRestart);
    }

    async fn begin(&mut self, _credentials: &WifiCredentials) {
        self.0.with(|state| {
            state.associate_at = state
                .association_latency_ns
                .map(|latency| state.clock_ns + latency);
        });
        self.0.push(Action::AssociationBegin);
    }

    fn is_associated(&self) -> bool {
        self.0.link_up()
    }

    fn address(&self) -> Option<core::net::Ipv4Addr> {
        Some(core::net::Ipv4Addr::new(10, 0, 0, 7))
    }
}

pub struct MockSession(pub Bench);

impl BrokerSession for MockSession {
    async fn open(&mut self, _broker: &BrokerConfig) -> Result<(), SessionError> {
        self.0.push(Action::SessionOpen);
        yield_now().await;
        self.0.with(|state| {
            if !state.associated {
                return Err(SessionError::Connect);
            }
            if state.session_rejections > 0 {
                state.session_rejections -= 1;
                return Err(SessionError::Refused(5));
            }
            state.session_active = true;
            Ok(())
        })
    }

    fn is_active(&self) -> bool {
        self.0.with(|state| state.session_active)
    }

    async fn publish(&mut self, _topic: &str, payload: &str) -> Result<(), PublishError> {
        let attempt = self.0.with(|state| Action::PublishAttempt {
            payload: payload.to_string(),
            associated: state.associated,
            session_active: state.session_active,
        });
        self.0.push(attempt);
        yield_now().await;
        let result = self.0.with(|state| {
            if state.publish_failures > 0 {
                state.publish_failures -= 1;
                Err(PublishError::Transport)
            } else {
                Ok(())
            }
        });
        self.0.push(Action::PublishDone(result.is_ok()));
        result
    }

    async fn pump(&mut self) {
        self.0.with(|state| {
            if state.drop_link_on_pump {
                state.drop_link_on_pump = false;
                state.associated = false;
                state.session_active = false;
            }
        });
        self.0.push(Action::Pump);
        yield_now().await;
    }
}

pub struct MockLed(pub Bench);

impl StatusIndicator for MockLed {
    fn set(&mut self, on: bool) {
        self.0.with(|state| state.led_on = on);
    }

    fn toggle(&mut self) {
        self.0.with(|state| {
            state.led_on = !state.led_on;
            state.led_toggles += 1;
        });
    }
}

pub struct MockPower(pub Bench);

impl PowerGateway for MockPower {
    fn battery_voltage(&mut self) -> f32 {
        self.0.push(Action::BatteryRead);
        self.0.with(|state| state.battery)
    }

    fn set_rail_enabled(&mut self, rail: PowerRail, on: bool) {
        self.0.push(Action::Rail(rail, on));
    }

    fn enable_long_press_detection(&mut self) {
        self.0.push(Action::LongPressArmed);
    }

    fn classify_pending_interrupt(&mut self) -> InterruptCause {
        let cause = self.0.with(|state| state.pending_cause);
        self.0.push(Action::Classify(cause));
        cause
    }

    fn clear_interrupt(&mut self) {
        self.0.with(|state| state.pending_cause = InterruptCause::None);
        self.0.push(Action::ClearInterrupt);
    }

    fn shutdown(&mut self) {
        self.0.push(Action::Shutdown);
    }

    fn enter_deep_sleep(&mut self, wake: WakeSources) {
        self.0.push(Action::DeepSleep(wake));
    }

    fn restart(&mut self) {
        self.0.push(Action::Restart);
    }
}

pub struct MockProbe(pub Bench);

impl SoilProbe for MockProbe {
    fn soil_temperature(&mut self) -> f32 {
        self.0.push(Action::SensorRead);
        self.0.with(|state| state.temperature)
    }

    fn soil_moisture(&mut self) -> f32 {
        self.0.with(|state| state.moisture)
    }
}

pub struct MockRetained(pub Bench);

impl RetainedCell for MockRetained {
    fn load(&self) -> u32 {
        self.0.with(|state| state.retained)
    }

    fn store(&mut self, value: u32) {
        self.0.with(|state| state.retained = value);
    }
}

pub struct BenchEvents(pub Bench);

impl EventSink for BenchEvents {
    fn record(&mut self, event: &NodeEvent<'_>) {
        let line = match event {
            NodeEvent::Published { payload } => (*payload).to_string(),
            other => other.to_string(),
        };
        self.0.push(Action::Event(event.kind(), line));
    }
}

pub type TestConnectivity = ConnectivityManager<MockLink, MockSession, MockLed, VirtualDelay>;

pub type TestCycle<'a> = CycleController<
    'a,
    MockLink,
    MockSession,
    MockLed,
    VirtualDelay,
    MockPower,
    MockProbe,
    MockRetained,
    NoUpdates,
    BenchEvents,
>;

pub type TestButton<'a> = ButtonHandler<'a, MockPower, VirtualDelay, BenchEvents>;

pub fn config() -> NodeConfig {
    let mut config = NodeConfig::DEFAULT;
    config.wifi.ssid = "field-ap";
    config.wifi.password = "hunter22";
    config.broker.access_token = "token";
    config
}

pub fn connectivity(bench: &Bench, config: &NodeConfig) -> TestConnectivity {
    ConnectivityManager::new(
        MockLink(bench.clone()),
        MockSession(bench.clone()),
        MockLed(bench.clone()),
        VirtualDelay(bench.clone()),
        config.timing,
    )
}

pub fn cycle_with<'a>(
    bench: &Bench,
    config: &'a NodeConfig,
    latch: &'a ShutdownLatch,
    connectivity: TestConnectivity,
) -> TestCycle<'a> {
    CycleController::new(
        config,
        latch,
        CycleParts {
            connectivity,
            power: MockPower(bench.clone()),
            probe: MockProbe(bench.clone()),
            counter: BootCounter::new(MockRetained(bench.clone())),
            updates: UpdateListener::new(NoUpdates),
            events: BenchEvents(bench.clone()),
            delay: VirtualDelay(bench.clone()),
        },
    )
}

pub fn cycle<'a>(bench: &Bench, config: &'a NodeConfig, latch: &'a ShutdownLatch) -> TestCycle<'a> {
    cycle_with(bench, config, latch, connectivity(bench, config))
}

pub fn button<'a>(
    bench: &Bench,
    config: &NodeConfig,
    flag: &'a InterruptFlag,
    latch: &'a ShutdownLatch,
) -> TestButton<'a> {
    ButtonHandler::new(
        flag,
        latch,
        MockPower(bench.clone()),
        VirtualDelay(bench.clone()),
        BenchEvents(bench.clone()),
        config.timing,
    )
}

/// Bench already associated with an open session.
pub fn online_bench() -> Bench {
    let bench = Bench::new();
    bench.with(|state| {
        state.associated = true;
        state.session_active = true;
    });
    bench
}
