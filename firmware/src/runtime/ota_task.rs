use embassy_net::Stack;
use node_core::config::NodeConfig;

use crate::hw::rng::NodeRng;
use crate::net::ota::{FlashImageSink, UPDATE_STEPS, serve};

#[embassy_executor::task]
pub async fn run(
    stack: Stack<'static>,
    sink: &'static mut FlashImageSink,
    rng: NodeRng,
    config: &'static NodeConfig,
) -> ! {
    serve(
        stack,
        sink,
        rng,
        config.update.password,
        config.update.port,
        &UPDATE_STEPS,
    )
    .await
}
