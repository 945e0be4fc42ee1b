//! Host emulator for the soil-sensor node.
//!
//! Runs the real node-core state machines against a simulated board on the
//! embassy std executor. An operator drives the world from stdin; type `help`
//! for the command list.

mod commands;
mod console;
mod push;
mod sim;

use std::io::{self, BufRead};
use std::pin::pin;
use std::process;
use std::sync::LazyLock;
use std::thread;

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_time::{Delay, Duration, Instant, Timer};
use node_core::button::{ButtonHandler, InterruptFlag, ShutdownLatch};
use node_core::config::NodeConfig;
use node_core::connectivity::{Association, ConnectivityManager};
use node_core::cycle::{
    BootCounter, CycleController, CycleParts, INITIAL_BOOT_COUNT, PassOutcome,
};
use node_core::events::{EventLevel, EventSink, NodeEvent, WakeCause};
use node_core::power::{InterruptCause, WakeSources, prepare_power};
use node_core::sensors::SyntheticSoilProbe;
use node_core::update::UpdateListener;

use commands::Command;
use console::Console;
use push::MemorySink;
use sim::{
    PowerRequest, SimLed, SimLink, SimPower, SimRetained, SimSession, SimUpdates, World,
    XorShift,
};

static CONSOLE: LazyLock<Console> = LazyLock::new(Console::new);
static BUTTON_FLAG: InterruptFlag = InterruptFlag::new();

const SLEEP_POLL: Duration = Duration::from_millis(100);
const RECENT_EVENTS: usize = 8;
const EMULATED_ROOT_CA: &str = "-----BEGIN CERTIFICATE-----\nZW11bGF0ZWQ=\n-----END CERTIFICATE-----\n";

fn emulator_config() -> NodeConfig {
    let mut config = NodeConfig::from_build_env();
    if config.wifi.ssid.is_empty() {
        config.wifi.ssid = "emulated-ap";
    }
    if config.broker.root_ca.is_empty() {
        // The emulated broker never handshakes; any well-formed block passes.
        config.broker.root_ca = EMULATED_ROOT_CA;
    }
    config
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let config: &'static NodeConfig = Box::leak(Box::new(emulator_config()));
    if let Err(error) = config.validate() {
        CONSOLE.line(EventLevel::Error, format_args!("config: {error}"));
        process::exit(2);
    }

    let world = World::new();
    let operator_world = world.clone();
    thread::spawn(move || operator(&operator_world, config));
    CONSOLE.reply("Soil node emulator ready. Type `help` for commands or `quit` to exit.");

    let mut wake = WakeCause::ColdBoot;
    loop {
        match boot(&world, config, wake).await {
            PowerRequest::DeepSleep(sources) => wake = deep_sleep(&world, sources).await,
            PowerRequest::Restart => wake = WakeCause::ColdBoot,
            PowerRequest::Shutdown => {
                CONSOLE.reply("node powered off");
                process::exit(0);
            }
        }
    }
}

/// One boot, from reset to the terminal power request.
async fn boot(world: &World, config: &NodeConfig, wake: WakeCause) -> PowerRequest {
    world.with(sim::WorldState::power_cycle);
    // Edges latched before the reset are gone.
    let _ = BUTTON_FLAG.take();
    if wake == WakeCause::ColdBoot {
        world.with(|state| state.retained = INITIAL_BOOT_COUNT);
    }

    let latch = ShutdownLatch::new();
    let mut events = &*CONSOLE;
    let counter = BootCounter::new(SimRetained(world.clone()));
    events.record(&NodeEvent::Boot {
        boot_count: counter.value(),
        wake,
    });

    let mut power = SimPower(world.clone());
    prepare_power(&mut power);
    let mut button = ButtonHandler::new(
        &BUTTON_FLAG,
        &latch,
        power.clone(),
        Delay,
        &*CONSOLE,
        config.timing,
    );
    let mut connectivity = ConnectivityManager::new(
        SimLink(world.clone()),
        SimSession(world.clone()),
        SimLed(world.clone()),
        Delay,
        config.timing,
    );
    if connectivity
        .ensure_associated(&config.wifi, &mut button, &mut events)
        .await
        == Association::Aborted
    {
        return PowerRequest::Shutdown;
    }

    let mut cycle = CycleController::new(
        config,
        &latch,
        CycleParts {
            connectivity,
            power,
            probe: SyntheticSoilProbe::new(XorShift::seeded()),
            counter,
            updates: UpdateListener::new(SimUpdates(world.clone())),
            events: &*CONSOLE,
            delay: Delay,
        },
    );

    let mut button_run = pin!(button.run());
    match select(pin!(cycle.run()), button_run.as_mut()).await {
        // The button worker owns the grace delay and the shutdown itself.
        Either::First(PassOutcome::ShuttingDown) => button_run.await,
        Either::First(_) | Either::Second(()) => {}
    }
    world
        .with(|state| state.request)
        .unwrap_or(PowerRequest::Shutdown)
}

/// Waits out the timer unless the button wakes the node first.
async fn deep_sleep(world: &World, sources: WakeSources) -> WakeCause {
    let deadline = sources.timer.map(|duration| {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Instant::now() + Duration::from_millis(millis)
    });
    loop {
        if sources.button && BUTTON_FLAG.take() {
            world.with(|state| state.pending_cause = InterruptCause::None);
            return WakeCause::Button;
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            return WakeCause::Timer;
        }
        Timer::after(SLEEP_POLL).await;
    }
}

fn operator(world: &World, config: &NodeConfig) {
    let mut sink = MemorySink::default();
    let mut rng = XorShift::seeded();
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match commands::parse(&line) {
            Ok(Command::Quit) => process::exit(0),
            Ok(command) => apply(world, config, command, &mut sink, &mut rng),
            Err(error) => CONSOLE.reply(&error.to_string()),
        }
    }
}

fn press(world: &World, cause: InterruptCause) {
    world.with(|state| state.pending_cause = cause);
    BUTTON_FLAG.raise();
}

fn apply(
    world: &World,
    config: &NodeConfig,
    command: Command,
    sink: &mut MemorySink,
    rng: &mut XorShift,
) {
    match command {
        Command::ShortPress => press(world, InterruptCause::ShortPress),
        Command::LongPress => press(world, InterruptCause::LongPress),
        Command::Link { up } => {
            world.with(|state| state.set_link(up));
            CONSOLE.reply(if up { "access point back" } else { "access point gone" });
        }
        Command::FailPublishes(count) => {
            world.with(|state| {
                state.publish_failures = state.publish_failures.saturating_add(count);
            });
            CONSOLE.reply(&format!("next {count} publish(es) will fail"));
        }
        Command::RejectSessions(count) => {
            world.with(|state| {
                state.session_rejections = state.session_rejections.saturating_add(count);
            });
            CONSOLE.reply(&format!("broker will refuse the next {count} handshake(s)"));
        }
        Command::Battery { millivolts } => {
            world.with(|state| state.battery_millivolts = millivolts);
            CONSOLE.reply(&format!("battery at {millivolts} mV"));
        }
        Command::Update {
            kind,
            size,
            password,
        } => {
            let client_password = password.as_deref().unwrap_or(config.update.password);
            let node_password = config.update.password;
            let steps = push::push(sink, rng, kind, size, client_password, node_password);
            CONSOLE.reply(&format!(
                "pushed {size}-byte {kind} image to {}.local ({} step(s) queued)",
                config.update.hostname,
                steps.len()
            ));
            world.with(|state| state.updates.extend(steps));
        }
        Command::Status => {
            for line in status_lines(world) {
                CONSOLE.reply(&line);
            }
        }
        Command::Help(topic) => {
            for line in commands::help_text(topic.as_deref()) {
                CONSOLE.reply(&line);
            }
        }
        Command::Quit => process::exit(0),
    }
}

fn status_lines(world: &World) -> Vec<String> {
    let mut lines = world.with(|state| {
        vec![
            format!("boot counter: {}", state.retained),
            format!(
                "link: ap {} / {}",
                if state.ap_reachable { "reachable" } else { "gone" },
                if state.associated { "associated" } else { "unassociated" },
            ),
            format!(
                "session: {} ({} published)",
                if state.session_active { "active" } else { "none" },
                state.published
            ),
            format!(
                "scripted: {} publish failure(s), {} session rejection(s)",
                state.publish_failures, state.session_rejections
            ),
            format!(
                "power: battery {} mV, lora {}, gps {}, long press {}",
                state.battery_millivolts,
                on_off(state.lora_rail),
                on_off(state.gps_rail),
                if state.long_press_armed { "armed" } else { "unarmed" },
            ),
            format!("led: {}", on_off(state.led_on)),
            format!("update steps queued: {}", state.updates.len()),
        ]
    });
    let recent = CONSOLE.recent(RECENT_EVENTS);
    lines.push(format!("recent events: {recent:?}"));
    lines
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}
