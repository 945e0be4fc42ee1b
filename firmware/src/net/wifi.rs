use core::net::Ipv4Addr;

use defmt::warn;
use embassy_net::Stack;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use node_core::config::WifiCredentials;
use node_core::connectivity::WirelessLink;

/// Station link: the radio controller plus the DHCP-configured stack on top.
/// Associated means both a joined AP and a leased address.
pub struct WifiLink {
    controller: WifiController<'static>,
    stack: Stack<'static>,
}

impl WifiLink {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>) -> Self {
        Self { controller, stack }
    }
}

impl WirelessLink for WifiLink {
    async fn restart_station(&mut self) {
        if matches!(self.controller.is_connected(), Ok(true))
            && let Err(error) = self.controller.disconnect_async().await
        {
            warn!("wifi: disconnect failed: {:?}", error);
        }
        if matches!(self.controller.is_started(), Ok(true))
            && let Err(error) = self.controller.stop_async().await
        {
            warn!("wifi: stop failed: {:?}", error);
        }
    }

    async fn begin(&mut self, credentials: &WifiCredentials) {
        let client = ClientConfig::default()
            .with_ssid(credentials.ssid.into())
            .with_password(credentials.password.into());
        if let Err(error) = self.controller.set_config(&ModeConfig::Client(client)) {
            warn!("wifi: set_config failed: {:?}", error);
            return;
        }
        if let Err(error) = self.controller.start_async().await {
            warn!("wifi: start failed: {:?}", error);
            return;
        }
        // Completion is polled through `is_associated`.
        if let Err(error) = self.controller.connect() {
            warn!("wifi: connect failed: {:?}", error);
        }
    }

    fn is_associated(&self) -> bool {
        matches!(self.controller.is_connected(), Ok(true)) && self.stack.is_config_up()
    }

    fn address(&self) -> Option<Ipv4Addr> {
        self.stack.config_v4().map(|config| config.address.address())
    }
}
