use defmt::info;

use super::NodeButton;

#[embassy_executor::task]
pub async fn run(mut button: NodeButton) {
    button.run().await;
    // Only reachable off-board; the PMU cuts power on shutdown.
    info!("button: shutdown returned");
}
