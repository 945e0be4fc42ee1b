use core::cell::RefCell;

use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_net::{Config as NetConfig, StackResources};
use embassy_time::Delay;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Event, Input, InputConfig, Io, Level, Output, OutputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::rtc_cntl::{Rtc, wakeup_cause};
use esp_hal::system::SleepSource;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::{handler, ram};
use esp_mbedtls::Tls;
use esp_storage::FlashStorage;
use node_core::button::{ButtonHandler, InterruptFlag, ShutdownLatch};
use node_core::config::NodeConfig;
use node_core::connectivity::{Association, ConnectivityManager};
use node_core::cycle::{BootCounter, CycleController, CycleParts};
use node_core::events::{EventSink, NodeEvent, WakeCause};
use node_core::power::axp192::Axp192;
use node_core::power::prepare_power;
use node_core::sensors::SyntheticSoilProbe;
use node_core::update::UpdateListener;
use static_cell::StaticCell;

use crate::console::Console;
use crate::hw::power::BoardPower;
use crate::hw::rng::NodeRng;
use crate::net::ota::{FlashImageSink, PushUpdateService, UPDATE_STEPS};
use crate::net::session::MqttSession;
use crate::net::wifi::WifiLink;
use crate::retained::RtcBootCounter;

mod button_task;
mod cycle_task;
mod mdns_task;
mod net_task;
mod ota_task;

esp_bootloader_esp_idf::esp_app_desc!();

/// Sockets: DHCP, DNS, broker, update listener, mDNS.
const SOCKET_COUNT: usize = 6;

type Events = &'static Console<Output<'static>>;
type Power = &'static BoardPower;

pub(super) type NodeCycle = CycleController<
    'static,
    WifiLink,
    MqttSession,
    Events,
    Delay,
    Power,
    SyntheticSoilProbe<NodeRng>,
    RtcBootCounter,
    PushUpdateService,
    Events,
>;
pub(super) type NodeButton = ButtonHandler<'static, Power, Delay, Events>;

static CONSOLE: Console<Output<'static>> = Console::new();
static CONFIG: NodeConfig = NodeConfig::from_build_env();
static BUTTON_FLAG: InterruptFlag = InterruptFlag::new();
static SHUTDOWN: ShutdownLatch = ShutdownLatch::new();
static PMU_IRQ: critical_section::Mutex<RefCell<Option<Input<'static>>>> =
    critical_section::Mutex::new(RefCell::new(None));

static POWER: StaticCell<BoardPower> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<SOCKET_COUNT>> = StaticCell::new();
static IMAGE_SINK: StaticCell<FlashImageSink> = StaticCell::new();
static TLS: StaticCell<Tls<'static>> = StaticCell::new();

/// PMU IRQ line: acknowledge the GPIO and leave classification to the
/// button task, which may talk I2C.
#[handler]
#[ram]
fn pmu_irq_handler() {
    critical_section::with(|cs| {
        if let Some(pin) = PMU_IRQ.borrow_ref_mut(cs).as_mut()
            && pin.is_interrupt_set()
        {
            pin.clear_interrupt();
            BUTTON_FLAG.raise();
        }
    });
}

fn wake_cause() -> WakeCause {
    match wakeup_cause() {
        SleepSource::Undefined => WakeCause::ColdBoot,
        SleepSource::Timer => WakeCause::Timer,
        SleepSource::Ext0 => WakeCause::Button,
        _ => WakeCause::Other,
    }
}

async fn halt() -> ! {
    loop {
        core::future::pending::<()>().await;
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));
    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 65536);
    // mbedtls allocates its record buffers per handshake.
    esp_alloc::heap_allocator!(size: 48 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_interrupt = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_interrupt.software_interrupt0);

    let wake = wake_cause();
    let mut events: Events = &CONSOLE;

    if let Err(error) = CONFIG.validate() {
        CONSOLE.error(format_args!("config: {error}; halting"));
        halt().await;
    }

    CONSOLE.attach_led(Output::new(
        peripherals.GPIO4,
        Level::Low,
        OutputConfig::default(),
    ));

    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .expect("i2c configuration")
    .with_sda(peripherals.GPIO21)
    .with_scl(peripherals.GPIO22);
    let mut pmu = Axp192::new(i2c);
    if let Err(error) = pmu.detect() {
        CONSOLE.error(format_args!("pmu: not found ({error}); halting"));
        halt().await;
    }
    if let Err(error) = pmu.enable_battery_adc(true) {
        CONSOLE.error(format_args!("pmu: battery adc unavailable ({error})"));
    }
    let power: Power = POWER.init(BoardPower::new(
        pmu,
        Rtc::new(peripherals.LPWR),
        peripherals.GPIO38,
    ));
    let mut gateway = power;
    prepare_power(&mut gateway);

    let mut io = Io::new(peripherals.IO_MUX);
    io.set_interrupt_handler(pmu_irq_handler);
    // The PMU drives the line open-drain with its own pull-up.
    let mut irq = Input::new(
        peripherals.GPIO35,
        InputConfig::default().with_pull(Pull::None),
    );
    critical_section::with(|cs| {
        irq.listen(Event::FallingEdge);
        PMU_IRQ.borrow_ref_mut(cs).replace(irq);
    });

    let radio = RADIO.init(esp_radio::init().expect("radio init"));
    let (controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, esp_radio::wifi::Config::default())
            .expect("wifi init");
    let mut rng = NodeRng::new();
    let seed = (u64::from(rand_core::RngCore::next_u32(&mut rng)) << 32)
        | u64::from(rand_core::RngCore::next_u32(&mut rng));
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        NetConfig::dhcpv4(Default::default()),
        STACK_RESOURCES.init(StackResources::new()),
        seed,
    );
    spawner
        .spawn(net_task::run(runner))
        .expect("failed to spawn network task");

    // SAFETY: first and only handle, created before anything reads the word.
    let counter = BootCounter::new(unsafe { RtcBootCounter::attach(wake) });
    events.record(&NodeEvent::Boot {
        boot_count: counter.value(),
        wake,
    });

    let mut button: NodeButton = ButtonHandler::new(
        &BUTTON_FLAG,
        &SHUTDOWN,
        power,
        Delay,
        &CONSOLE,
        CONFIG.timing,
    );
    let tls: &'static Tls<'static> = TLS.init(
        Tls::new(peripherals.SHA)
            .expect("tls init")
            .with_hardware_rsa(peripherals.RSA),
    );
    let mut connectivity = ConnectivityManager::new(
        WifiLink::new(controller, stack),
        MqttSession::new(stack, tls, &CONFIG.broker),
        &CONSOLE,
        Delay,
        CONFIG.timing,
    );
    // Setup association services the button inline; nothing else runs yet.
    if connectivity
        .ensure_associated(&CONFIG.wifi, &mut button, &mut events)
        .await
        == Association::Aborted
    {
        halt().await;
    }

    let cycle: NodeCycle = CycleController::new(
        &CONFIG,
        &SHUTDOWN,
        CycleParts {
            connectivity,
            power,
            probe: SyntheticSoilProbe::new(rng),
            counter,
            updates: UpdateListener::new(PushUpdateService::new(&UPDATE_STEPS)),
            events: &CONSOLE,
            delay: Delay,
        },
    );

    let sink = IMAGE_SINK.init(FlashImageSink::new(FlashStorage::new(peripherals.FLASH)));

    spawner
        .spawn(button_task::run(button))
        .expect("failed to spawn button task");
    spawner
        .spawn(ota_task::run(stack, sink, rng, &CONFIG))
        .expect("failed to spawn update task");
    spawner
        .spawn(mdns_task::run(stack, &CONFIG))
        .expect("failed to spawn mdns task");
    spawner
        .spawn(cycle_task::run(cycle))
        .expect("failed to spawn cycle task");

    halt().await
}
