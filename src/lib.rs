pub mod clock;
pub mod config;
pub mod counters;
pub mod encoding;
pub mod error;
pub mod hw;
pub mod message;
pub mod rx;
pub mod service;
pub mod shm;
pub mod sync;
pub mod timing;
pub mod tx;

use std::sync::Arc;

use tokio::sync::mpsc::{Sender, channel};
use tokio::task::JoinHandle;

use crate::hw::{HostAudioClock, OhciRegisters};

/// Spawn the isochronous service on the current runtime. Returns the control
/// channel and the service task handle.
pub fn init(
    regs: Arc<dyn OhciRegisters>,
    host_clock: Option<Arc<dyn HostAudioClock>>,
) -> (Sender<message::Message>, JoinHandle<()>) {
    let (tx, rx) = channel::<message::Message>(32);
    let mut service = service::IsochService::new(regs, host_clock, rx, tx.clone());
    let handle = tokio::spawn(async move {
        service.work().await;
    });
    (tx, handle)
}
