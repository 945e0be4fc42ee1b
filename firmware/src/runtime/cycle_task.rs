use defmt::{Debug2Format, info};

use super::NodeCycle;

#[embassy_executor::task]
pub async fn run(mut cycle: NodeCycle) {
    let outcome = cycle.run().await;
    // Sleep, restart and shutdown do not return on hardware, so this only
    // logs the shutdown hand-off to the button task.
    info!("cycle: stopped ({:?})", Debug2Format(&outcome));
}
