//! Broker session: MQTT 5 over TLS over an embassy-net TCP socket.
//!
//! The socket and MQTT layers borrow fixed static buffers. A session owns
//! them from a successful handshake until it is dropped, and only one session
//! exists. The broker must present a chain that verifies against the
//! configured root certificate and names the configured host.

use core::ffi::CStr;
use core::net::Ipv4Addr;

use defmt::{Debug2Format, info, warn};
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Stack, dns::DnsQueryType};
use embassy_time::{Duration, Instant};
use esp_mbedtls::asynch::Session;
use esp_mbedtls::{Certificates, Mode, Tls, TlsVersion, X509};
use heapless::Vec;
use node_core::config::BrokerConfig;
use node_core::connectivity::{BrokerSession, PublishError, SessionError};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;
use static_cell::StaticCell;

const TCP_BUFFER_LEN: usize = 4096;
const MQTT_BUFFER_LEN: usize = 1024;
const MAX_PROPERTIES: usize = 5;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const ROOT_CA_CAPACITY: usize = 4096;
const HOST_CAPACITY: usize = 128;

static mut TCP_RX: [u8; TCP_BUFFER_LEN] = [0; TCP_BUFFER_LEN];
static mut TCP_TX: [u8; TCP_BUFFER_LEN] = [0; TCP_BUFFER_LEN];
static mut MQTT_RX: [u8; MQTT_BUFFER_LEN] = [0; MQTT_BUFFER_LEN];
static mut MQTT_TX: [u8; MQTT_BUFFER_LEN] = [0; MQTT_BUFFER_LEN];

static ROOT_CA: StaticCell<Vec<u8, ROOT_CA_CAPACITY>> = StaticCell::new();
static SERVER_NAME: StaticCell<Vec<u8, HOST_CAPACITY>> = StaticCell::new();

type Transport = Session<'static, TcpSocket<'static>>;
type Client = MqttClient<'static, Transport, MAX_PROPERTIES, CountingRng>;

struct Buffers {
    tcp_rx: &'static mut [u8],
    tcp_tx: &'static mut [u8],
    mqtt_rx: &'static mut [u8],
    mqtt_tx: &'static mut [u8],
}

impl Buffers {
    /// # Safety
    ///
    /// Everything built from a previous claim must already be dropped.
    unsafe fn claim() -> Self {
        unsafe {
            Self {
                tcp_rx: &mut *(&raw mut TCP_RX),
                tcp_tx: &mut *(&raw mut TCP_TX),
                mqtt_rx: &mut *(&raw mut MQTT_RX),
                mqtt_tx: &mut *(&raw mut MQTT_TX),
            }
        }
    }
}

/// Copies `text` with the trailing NUL mbedtls expects.
fn nul_terminated<const N: usize>(text: &str) -> Option<Vec<u8, N>> {
    if text.as_bytes().contains(&0) {
        return None;
    }
    let mut out = Vec::new();
    out.extend_from_slice(text.as_bytes()).ok()?;
    out.push(0).ok()?;
    Some(out)
}

/// Trust settings fixed at boot.
struct Trust {
    tls: &'static Tls<'static>,
    /// NUL-terminated PEM.
    root_ca: Option<&'static [u8]>,
    server_name: Option<&'static CStr>,
}

pub struct MqttSession {
    stack: Stack<'static>,
    trust: Trust,
    client: Option<Client>,
    keep_alive: Duration,
    last_traffic: Instant,
}

impl MqttSession {
    /// Must be called at most once: the trust material lives in statics.
    pub fn new(stack: Stack<'static>, tls: &'static Tls<'static>, broker: &BrokerConfig) -> Self {
        let root_ca = nul_terminated::<ROOT_CA_CAPACITY>(broker.root_ca)
            .map(|pem| -> &'static [u8] { ROOT_CA.init(pem) })
            .filter(|pem| X509::pem(pem).is_ok());
        if root_ca.is_none() {
            warn!("mqtt: root certificate unusable; every handshake will be refused");
        }
        let server_name = nul_terminated::<HOST_CAPACITY>(broker.host)
            .map(|name| -> &'static [u8] { SERVER_NAME.init(name) })
            .and_then(|name| CStr::from_bytes_with_nul(name).ok());
        Self {
            stack,
            trust: Trust {
                tls,
                root_ca,
                server_name,
            },
            client: None,
            keep_alive: Duration::from_secs(15),
            last_traffic: Instant::now(),
        }
    }

    async fn resolve(&self, host: &str) -> Result<Ipv4Addr, SessionError> {
        if let Ok(address) = host.parse::<Ipv4Addr>() {
            return Ok(address);
        }
        let addresses = self
            .stack
            .dns_query(host, DnsQueryType::A)
            .await
            .map_err(|error| {
                warn!("mqtt: dns lookup of {} failed: {:?}", host, error);
                SessionError::Resolve
            })?;
        addresses
            .first()
            .map(|&IpAddress::Ipv4(address)| address)
            .ok_or(SessionError::Resolve)
    }
}

fn refusal(code: ReasonCode) -> SessionError {
    match code {
        ReasonCode::NetworkError => SessionError::Connect,
        ReasonCode::BadUserNameOrPassword => SessionError::Refused(0x86),
        ReasonCode::NotAuthorized => SessionError::Refused(0x87),
        ReasonCode::ServerUnavailable => SessionError::Refused(0x88),
        ReasonCode::ServerBusy => SessionError::Refused(0x89),
        ReasonCode::Banned => SessionError::Refused(0x8A),
        _ => SessionError::Protocol,
    }
}

impl BrokerSession for MqttSession {
    async fn open(&mut self, broker: &BrokerConfig) -> Result<(), SessionError> {
        self.client = None;
        let (Some(root_ca), Some(server_name)) = (self.trust.root_ca, self.trust.server_name)
        else {
            return Err(SessionError::Tls);
        };
        let root_ca = X509::pem(root_ca).map_err(|_| SessionError::Tls)?;
        let address = self.resolve(broker.host).await?;
        // SAFETY: the only previous holder was dropped above.
        let buffers = unsafe { Buffers::claim() };

        let mut socket = TcpSocket::new(self.stack, buffers.tcp_rx, buffers.tcp_tx);
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        socket
            .connect((address, broker.port))
            .await
            .map_err(|error| {
                warn!("mqtt: tcp connect failed: {:?}", error);
                SessionError::Connect
            })?;

        let mut tls = Session::new(
            socket,
            Mode::Client {
                servername: server_name,
            },
            TlsVersion::Tls1_2,
            Certificates {
                ca_chain: Some(root_ca),
                ..Default::default()
            },
            self.trust.tls.reference(),
        )
        .map_err(|error| {
            warn!("mqtt: tls setup failed: {:?}", Debug2Format(&error));
            SessionError::Tls
        })?;
        // Fails unless the chain verifies against the root and names the host.
        tls.connect().await.map_err(|error| {
            warn!("mqtt: tls handshake failed: {:?}", Debug2Format(&error));
            SessionError::Tls
        })?;

        let mut mqtt_config = ClientConfig::new(MqttVersion::MQTTv5, CountingRng(20_000));
        mqtt_config.add_client_id(broker.client_id);
        // The broker identifies devices by access token in the user name.
        mqtt_config.add_username(broker.access_token);
        mqtt_config.keep_alive = broker.keep_alive_secs;

        let mut client = MqttClient::<_, MAX_PROPERTIES, _>::new(
            tls,
            buffers.mqtt_tx,
            MQTT_BUFFER_LEN,
            buffers.mqtt_rx,
            MQTT_BUFFER_LEN,
            mqtt_config,
        );
        client.connect_to_broker().await.map_err(|code| {
            warn!("mqtt: connect refused: {:?}", Debug2Format(&code));
            refusal(code)
        })?;

        info!("mqtt: connected as {}", broker.client_id);
        self.keep_alive = Duration::from_secs(u64::from(broker.keep_alive_secs));
        self.last_traffic = Instant::now();
        self.client = Some(client);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.client.is_some()
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishError> {
        let Some(client) = self.client.as_mut() else {
            return Err(PublishError::NoSession);
        };
        match client
            .send_message(topic, payload.as_bytes(), QualityOfService::QoS0, false)
            .await
        {
            Ok(()) | Err(ReasonCode::NoMatchingSubscribers) => {
                self.last_traffic = Instant::now();
                Ok(())
            }
            Err(ReasonCode::NetworkError) => {
                self.client = None;
                Err(PublishError::Transport)
            }
            Err(ReasonCode::PacketTooLarge) => Err(PublishError::BufferFull),
            Err(code) => {
                warn!("mqtt: publish rejected: {:?}", Debug2Format(&code));
                Err(PublishError::Rejected)
            }
        }
    }

    async fn pump(&mut self) {
        // A session cannot outlive the lease it was opened on.
        if !self.stack.is_config_up() {
            self.client = None;
            return;
        }
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if self.last_traffic.elapsed() < self.keep_alive / 2 {
            return;
        }
        match client.send_ping().await {
            Ok(()) => self.last_traffic = Instant::now(),
            Err(code) => {
                warn!("mqtt: keep-alive failed: {:?}", Debug2Format(&code));
                self.client = None;
            }
        }
    }
}
