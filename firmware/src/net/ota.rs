//! Push-update endpoint: a TCP listener that runs the challenge/response
//! transfer into flash and reports each step to the cycle over a channel.

use defmt::{info, warn};
use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use embedded_io_async::{Read, Write};
use embedded_storage::Storage;
use esp_bootloader_esp_idf::ota::OtaImageState;
use esp_bootloader_esp_idf::ota_updater::OtaUpdater;
use esp_bootloader_esp_idf::partitions::{
    self, DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType,
};
use esp_storage::FlashStorage;
use node_core::update::protocol::{
    ImageSink, Line, MAX_LINE, NONCE_LEN, PushSession, SinkError, reply,
};
use node_core::update::{ImageKind, UpdateError, UpdateService, UpdateStep};
use rand_core::RngCore;

use crate::hw::rng::NodeRng;

const STEP_DEPTH: usize = 8;
const CHUNK_LEN: usize = 1024;
const SOCKET_BUFFER_LEN: usize = 2048;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

pub type StepChannel = Channel<CriticalSectionRawMutex, UpdateStep, STEP_DEPTH>;

/// Steps observed by the listener task, drained by the cycle.
pub static UPDATE_STEPS: StepChannel = Channel::new();

/// Cycle-side view of the listener task.
pub struct PushUpdateService {
    steps: &'static StepChannel,
}

impl PushUpdateService {
    pub const fn new(steps: &'static StepChannel) -> Self {
        Self { steps }
    }
}

impl UpdateService for PushUpdateService {
    async fn step(&mut self) -> UpdateStep {
        self.steps.try_receive().unwrap_or(UpdateStep::Idle)
    }
}

struct Region {
    kind: ImageKind,
    base: u32,
    capacity: u32,
    written: u32,
}

/// Writes images into the inactive application slot or the data partition.
pub struct FlashImageSink {
    flash: FlashStorage<'static>,
    table: [u8; PARTITION_TABLE_MAX_LEN],
    region: Option<Region>,
}

impl FlashImageSink {
    pub fn new(flash: FlashStorage<'static>) -> Self {
        Self {
            flash,
            table: [0; PARTITION_TABLE_MAX_LEN],
            region: None,
        }
    }

    fn locate(&mut self, kind: ImageKind) -> Result<(u32, u32), SinkError> {
        let wanted = match kind {
            ImageKind::Application => {
                let mut updater =
                    OtaUpdater::new(&mut self.flash, &mut self.table).map_err(|_| SinkError::Io)?;
                let (_, slot) = updater.next_partition().map_err(|_| SinkError::Io)?;
                PartitionType::App(slot)
            }
            ImageKind::Filesystem => PartitionType::Data(DataPartitionSubType::Spiffs),
        };
        let table = partitions::read_partition_table(&mut self.flash, &mut self.table)
            .map_err(|_| SinkError::Io)?;
        let entry = table
            .find_partition(wanted)
            .map_err(|_| SinkError::Io)?
            .ok_or(SinkError::NoSpace)?;
        Ok((entry.offset(), entry.len()))
    }
}

impl ImageSink for FlashImageSink {
    fn begin(&mut self, kind: ImageKind, size: u32) -> Result<(), SinkError> {
        let (base, capacity) = self.locate(kind)?;
        if size > capacity {
            return Err(SinkError::NoSpace);
        }
        self.region = Some(Region {
            kind,
            base,
            capacity,
            written: 0,
        });
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        let Some(region) = self.region.as_mut() else {
            return Err(SinkError::Io);
        };
        let len = u32::try_from(chunk.len()).map_err(|_| SinkError::NoSpace)?;
        let end = region
            .written
            .checked_add(len)
            .filter(|end| *end <= region.capacity)
            .ok_or(SinkError::NoSpace)?;
        self.flash
            .write(region.base + region.written, chunk)
            .map_err(|_| SinkError::Io)?;
        region.written = end;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let region = self.region.take().ok_or(SinkError::Io)?;
        if region.kind == ImageKind::Application {
            let mut updater =
                OtaUpdater::new(&mut self.flash, &mut self.table).map_err(|_| SinkError::Io)?;
            updater
                .activate_next_partition()
                .map_err(|_| SinkError::Io)?;
            updater
                .set_current_ota_state(OtaImageState::New)
                .map_err(|_| SinkError::Io)?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        // An unactivated application slot is never booted. A partial
        // filesystem image stays until the next successful push.
        if let Some(region) = self.region.take() {
            warn!(
                "update: dropped partial {} image after {} bytes",
                defmt::Display2Format(&region.kind),
                region.written
            );
        }
    }
}

/// Accepts pushes on `port` forever, one client at a time.
pub async fn serve(
    stack: Stack<'static>,
    sink: &mut FlashImageSink,
    mut rng: NodeRng,
    password: &'static str,
    port: u16,
    steps: &'static StepChannel,
) -> ! {
    let mut rx = [0u8; SOCKET_BUFFER_LEN];
    let mut tx = [0u8; SOCKET_BUFFER_LEN];
    loop {
        stack.wait_config_up().await;
        let mut socket = TcpSocket::new(stack, &mut rx, &mut tx);
        socket.set_timeout(Some(CLIENT_TIMEOUT));
        if let Err(error) = socket.accept(port).await {
            warn!("update: accept failed: {:?}", error);
            continue;
        }

        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        let mut session = PushSession::new(&mut *sink, nonce, password);
        match transfer(&mut socket, &mut session, steps).await {
            Ok(kind) => {
                info!("update: {} image accepted", defmt::Display2Format(&kind));
                steps.send(UpdateStep::Completed(kind)).await;
            }
            Err(error) => {
                // Best effort; the peer may already be gone.
                let _ = socket.write_all(reply(Err(error)).as_bytes()).await;
                session.abort();
                steps.send(UpdateStep::Failed(error)).await;
            }
        }
        let _ = socket.flush().await;
        socket.close();
    }
}

async fn transfer(
    socket: &mut TcpSocket<'_>,
    session: &mut PushSession<'_, &mut FlashImageSink>,
    steps: &'static StepChannel,
) -> Result<ImageKind, UpdateError> {
    send(socket, session.challenge().as_str(), UpdateError::Connect).await?;
    let line = read_line(socket).await.ok_or(UpdateError::Begin)?;
    let header = session.accept_header(&line)?;
    steps
        .send(UpdateStep::Started {
            kind: header.kind,
            size: header.size,
        })
        .await;
    send(socket, reply(Ok(())), UpdateError::Receive).await?;

    let mut chunk = [0u8; CHUNK_LEN];
    loop {
        let read = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return Err(UpdateError::Receive),
            Ok(read) => read,
        };
        let progress = session.receive(&chunk[..read])?;
        // Progress is advisory; a full channel just skips a report.
        let _ = steps.try_send(UpdateStep::Progress {
            received: progress.received,
            total: progress.total,
        });
        if progress.is_complete() {
            break;
        }
    }

    let kind = session.finish()?;
    send(socket, reply(Ok(())), UpdateError::End).await?;
    Ok(kind)
}

async fn send(
    socket: &mut TcpSocket<'_>,
    line: &str,
    on_error: UpdateError,
) -> Result<(), UpdateError> {
    socket
        .write_all(line.as_bytes())
        .await
        .map_err(|_| on_error)?;
    socket.flush().await.map_err(|_| on_error)
}

/// Reads one `\n`-terminated line, without the terminator.
async fn read_line(socket: &mut TcpSocket<'_>) -> Option<Line> {
    let mut line = Line::new();
    let mut byte = [0u8; 1];
    loop {
        match socket.read(&mut byte).await {
            Ok(1) => {}
            _ => return None,
        }
        match byte[0] {
            b'\n' => return Some(line),
            b'\r' => {}
            other if line.len() < MAX_LINE => line.push(char::from(other)).ok()?,
            _ => return None,
        }
    }
}
