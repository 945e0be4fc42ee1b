//! Answers A queries for `<hostname>.local` so update clients can find the
//! node without knowing its lease.

use defmt::warn;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use node_core::config::NodeConfig;
use node_core::update::mdns::{MDNS_GROUP, MDNS_PORT, answer};

const PACKET_LEN: usize = 512;

#[embassy_executor::task]
pub async fn run(stack: Stack<'static>, config: &'static NodeConfig) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx = [0u8; PACKET_LEN];
    let mut tx = [0u8; PACKET_LEN];
    let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx, &mut tx_meta, &mut tx);

    stack.wait_config_up().await;
    if let Err(error) = stack.join_multicast_group(MDNS_GROUP) {
        warn!("mdns: join failed: {:?}", error);
    }
    if let Err(error) = socket.bind(MDNS_PORT) {
        warn!("mdns: bind failed: {:?}", error);
        loop {
            core::future::pending::<()>().await;
        }
    }

    let mut query = [0u8; PACKET_LEN];
    let mut response = [0u8; PACKET_LEN];
    loop {
        let Ok((len, _)) = socket.recv_from(&mut query).await else {
            continue;
        };
        // The lease can change across reassociation.
        let Some(address) = stack.config_v4().map(|config| config.address.address()) else {
            continue;
        };
        let hostname = config.update.hostname;
        if let Some(reply_len) = answer(&query[..len], hostname, address, &mut response) {
            let group = IpEndpoint::new(IpAddress::Ipv4(MDNS_GROUP), MDNS_PORT);
            if let Err(error) = socket.send_to(&response[..reply_len], group).await {
                warn!("mdns: reply failed: {:?}", error);
            }
        }
    }
}
