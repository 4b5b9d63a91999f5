use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::clock::ClockEngine;
use crate::config::{MAX_PCM_CHANNELS, StartParams};
use crate::counters::{CountersSnapshot, RxCountersSnapshot, TxCountersSnapshot};
use crate::error::IsochError;
use crate::hw::{HostAudioClock, OhciRegisters, SharedDmaMemory};
use crate::message::{Action, Message, Reply};
use crate::rx::RxContext;
use crate::sync::ExternalSyncBridge;
use crate::timing::{host_now_ns, host_sleep_until_ns};
use crate::tx::{TxContext, TxState};

const SYT_GATE_TIMEOUT_MS: u32 = 500;
const SYT_GATE_POLL_MS: u32 = 5;
const FILL_WAIT_TIMEOUT_MS: u32 = 100;
const WATCHDOG_PERIOD_NS: u64 = 1_000_000;

struct Workers {
    stop: Arc<AtomicBool>,
    it_thread: Option<thread::JoinHandle<()>>,
    ir_thread: Option<thread::JoinHandle<()>>,
    verifier_task: Option<tokio::task::JoinHandle<()>>,
    clock_stop: Arc<AtomicBool>,
    clock_task: Option<tokio::task::JoinHandle<()>>,
}

/// Owns the duplex isochronous session: IR first, the SYT gate, then IT,
/// with the watchdog threads and cooperative tasks around them. The control
/// loop follows the engine's message-channel shape.
pub struct IsochService {
    regs: Arc<dyn OhciRegisters>,
    host_clock: Option<Arc<dyn HostAudioClock>>,
    bridge: Arc<ExternalSyncBridge>,

    rx: Option<Arc<Mutex<RxContext>>>,
    tx: Option<Arc<Mutex<TxContext>>>,
    workers: Option<Workers>,
    active_guid: u64,

    messages: Receiver<Message>,
    sender: Sender<Message>,
    reply_to: Option<Sender<Message>>,
}

/// 1 kHz absolute-deadline loop for the watchdog threads.
fn watchdog_loop<F: FnMut()>(stop: Arc<AtomicBool>, mut tick: F) {
    let mut deadline = host_now_ns() + WATCHDOG_PERIOD_NS;
    while !stop.load(Ordering::Acquire) {
        tick();
        host_sleep_until_ns(deadline);
        deadline += WATCHDOG_PERIOD_NS;
        let now = host_now_ns();
        if deadline + 100 * WATCHDOG_PERIOD_NS < now {
            // Fell far behind (debugger, suspend); resynchronize.
            deadline = now + WATCHDOG_PERIOD_NS;
        }
    }
}

impl IsochService {
    pub fn new(
        regs: Arc<dyn OhciRegisters>,
        host_clock: Option<Arc<dyn HostAudioClock>>,
        messages: Receiver<Message>,
        sender: Sender<Message>,
    ) -> IsochService {
        IsochService {
            regs,
            host_clock,
            bridge: Arc::new(ExternalSyncBridge::default()),
            rx: None,
            tx: None,
            workers: None,
            active_guid: 0,
            messages,
            sender,
            reply_to: None,
        }
    }

    pub fn bridge(&self) -> &Arc<ExternalSyncBridge> {
        &self.bridge
    }

    pub async fn work(&mut self) {
        while let Some(message) = self.messages.recv().await {
            match message {
                Message::Channel(reply) => {
                    self.reply_to = Some(reply);
                }
                Message::Request(Action::Quit) => {
                    self.stop_all().await;
                    self.respond(Ok(Reply::Quitting)).await;
                    return;
                }
                Message::Request(action) => {
                    let response = self.handle(action).await;
                    self.respond(response).await;
                }
                Message::Response(_) => {}
            }
        }
        self.stop_all().await;
    }

    async fn respond(&self, response: Result<Reply, IsochError>) {
        if let Some(reply_to) = &self.reply_to {
            if let Err(e) = reply_to.send(Message::Response(response)).await {
                error!("service: failed to deliver response: {e}");
            }
        }
    }

    async fn handle(&mut self, action: Action) -> Result<Reply, IsochError> {
        match action {
            Action::StartDuplex(params) => {
                let guid = params.guid;
                self.start_duplex(*params).await?;
                Ok(Reply::Started { guid })
            }
            Action::StopDuplex { guid } => {
                self.stop_duplex(guid).await?;
                Ok(Reply::Stopped { guid })
            }
            Action::Counters => Ok(Reply::Counters(Box::new(self.counters()))),
            Action::Quit => Ok(Reply::Quitting),
        }
    }

    pub fn counters(&self) -> CountersSnapshot {
        CountersSnapshot {
            tx: self
                .tx
                .as_ref()
                .map(|tx| TxCountersSnapshot::collect(&tx.lock().expect("tx context poisoned"))),
            rx: self
                .rx
                .as_ref()
                .map(|rx| RxCountersSnapshot::collect(&rx.lock().expect("rx context poisoned"))),
        }
    }

    pub async fn start_duplex(&mut self, params: StartParams) -> crate::error::Result<()> {
        if params.guid == 0 {
            return Err(IsochError::BadArgument);
        }
        if self.active_guid != 0 && self.active_guid != params.guid {
            return Err(IsochError::Busy);
        }
        if params.pcm_channels == 0 || params.pcm_channels > MAX_PCM_CHANNELS {
            return Err(IsochError::BadArgument);
        }
        if params.agere_flush_quirk {
            info!("service: agere wake-flush quirk active for this session");
        }

        self.start_receive(&params)?;

        match self.start_transmit(&params).await {
            Ok(()) => {}
            Err(e) => {
                self.teardown_workers().await;
                if let Some(rx) = &self.rx {
                    rx.lock().expect("rx context poisoned").stop();
                }
                self.bridge.reset();
                return Err(e);
            }
        }

        self.spawn_it_watchdog();
        self.spawn_clock_engine(&params);

        self.active_guid = params.guid;
        info!("service: duplex started guid={:#x}", params.guid);
        Ok(())
    }

    fn start_receive(&mut self, params: &StartParams) -> crate::error::Result<()> {
        let rx = match &self.rx {
            Some(rx) => rx.clone(),
            None => {
                let dma = SharedDmaMemory::new();
                let ctx = RxContext::new(self.regs.clone(), Box::new(dma), 0);
                let ctx = Arc::new(Mutex::new(ctx));
                self.rx = Some(ctx.clone());
                ctx
            }
        };

        {
            let mut ctx = rx.lock().expect("rx context poisoned");
            ctx.set_external_sync_bridge(Some(self.bridge.clone()));
            ctx.configure(params.ir_channel)?;
            if let Some(q) = params.rx_queue {
                ctx.set_shared_rx_queue(q.base, q.bytes);
            }
            ctx.start()?;
        }

        // IR poll thread: sister of the IT watchdog at the same cadence.
        let stop = Arc::new(AtomicBool::new(false));
        let rx_thread = {
            let rx = rx.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("isofire-ir-poll".into())
                .spawn(move || {
                    watchdog_loop(stop, move || {
                        rx.lock().expect("rx context poisoned").poll();
                    });
                })
                .expect("spawn ir poll thread")
        };

        self.workers = Some(Workers {
            stop,
            it_thread: None,
            ir_thread: Some(rx_thread),
            verifier_task: None,
            clock_stop: Arc::new(AtomicBool::new(false)),
            clock_task: None,
        });

        info!("service: IR running ch={}", params.ir_channel);
        Ok(())
    }

    async fn start_transmit(&mut self, params: &StartParams) -> crate::error::Result<()> {
        let tx = match &self.tx {
            Some(tx) => tx.clone(),
            None => {
                let dma = SharedDmaMemory::new();
                let ctx = TxContext::new(self.regs.clone(), Box::new(dma), 0, params.tx_profile);
                let ctx = Arc::new(Mutex::new(ctx));
                self.tx = Some(ctx.clone());
                ctx
            }
        };

        if tx.lock().expect("tx context poisoned").state() == TxState::Running {
            info!("service: IT already running, start is idempotent");
            return Ok(());
        }

        let mut start_target_fill = params.tx_profile.start_wait_target_frames;
        {
            let mut ctx = tx.lock().expect("tx context poisoned");
            let Some(q) = params.tx_queue else {
                warn!("service: start blocked, shared TX queue metadata missing");
                return Err(IsochError::NotReady);
            };
            ctx.set_shared_tx_queue(q.base, q.bytes);
            if ctx.shared_tx_capacity_frames() == 0 {
                warn!("service: start blocked, shared TX queue invalid");
                return Err(IsochError::NotReady);
            }

            if let Some(zc) = params.zero_copy {
                ctx.set_zero_copy_buffer(Some(zc));
                start_target_fill = ((zc.frames * 5) / 8).max(8);
            } else {
                ctx.set_zero_copy_buffer(None);
            }
        }

        let ir_running = self
            .rx
            .as_ref()
            .map(|rx| rx.lock().expect("rx context poisoned").state() == crate::rx::RxState::Running)
            .unwrap_or(false);
        if !ir_running {
            warn!("service: start blocked, IR context is not running");
            return Err(IsochError::NotReady);
        }

        // The first outgoing SYT must be meaningful: wait for the IR side to
        // establish the device clock.
        let mut established = false;
        for _ in 0..(SYT_GATE_TIMEOUT_MS / SYT_GATE_POLL_MS) {
            if self.bridge.clock_established.load(Ordering::Acquire) {
                established = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(SYT_GATE_POLL_MS as u64)).await;
        }
        if !established {
            warn!(
                "service: start timeout, no established IR SYT clock after {}ms (seq={})",
                SYT_GATE_TIMEOUT_MS,
                self.bridge.update_seq.load(Ordering::Acquire)
            );
            return Err(IsochError::Timeout);
        }

        {
            let mut ctx = tx.lock().expect("tx context poisoned");
            ctx.set_external_sync_bridge(Some(self.bridge.clone()));
            ctx.configure(
                params.it_channel,
                params.sid,
                params.stream_mode,
                params.pcm_channels,
                params.am824_slots,
            )?;
        }

        // Give the producer a window to reach the start-wait fill target.
        let target = {
            let ctx = tx.lock().expect("tx context poisoned");
            start_target_fill.min(ctx.shared_tx_capacity_frames())
        };
        for _ in 0..(FILL_WAIT_TIMEOUT_MS / 5) {
            let fill = tx.lock().expect("tx context poisoned").shared_tx_fill_frames();
            if fill >= target {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tx.lock().expect("tx context poisoned").start()?;
        info!("service: IT running ch={}", params.it_channel);
        Ok(())
    }

    fn spawn_it_watchdog(&mut self) {
        let Some(workers) = self.workers.as_mut() else {
            return;
        };
        let Some(tx) = self.tx.clone() else {
            return;
        };

        let stop = workers.stop.clone();
        let it_thread = {
            let tx = tx.clone();
            thread::Builder::new()
                .name("isofire-it-watchdog".into())
                .spawn(move || {
                    watchdog_loop(stop, move || {
                        let mut ctx = tx.lock().expect("tx context poisoned");
                        ctx.poll();
                        ctx.kick_verifier();
                        ctx.service_recovery();
                        ctx.check_dead_context();
                    });
                })
                .expect("spawn it watchdog thread")
        };
        workers.it_thread = Some(it_thread);

        let verifier = tx.lock().expect("tx context poisoned").verifier().clone();
        workers.verifier_task = Some(tokio::spawn(verifier.run()));
    }

    fn spawn_clock_engine(&mut self, params: &StartParams) {
        let Some(workers) = self.workers.as_mut() else {
            return;
        };
        let Some(host_clock) = self.host_clock.clone() else {
            return;
        };
        let mut engine = ClockEngine::new(
            host_clock,
            params.tx_queue,
            params.rx_queue,
            params.zero_copy.map(|z| z.frames).unwrap_or(0),
            48_000.0,
        );
        engine.set_rx_profile(params.rx_profile);
        workers.clock_stop = Arc::new(AtomicBool::new(false));
        workers.clock_task = Some(tokio::spawn(engine.run(workers.clock_stop.clone())));
    }

    async fn teardown_workers(&mut self) {
        let Some(mut workers) = self.workers.take() else {
            return;
        };
        workers.stop.store(true, Ordering::Release);
        workers.clock_stop.store(true, Ordering::Release);

        if let Some(handle) = workers.it_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = workers.ir_thread.take() {
            let _ = handle.join();
        }
        if let Some(task) = workers.verifier_task.take() {
            // The verifier exits through its shutdown flag; wait for the
            // barrier before anything touches the trace ring again.
            if let Some(tx) = &self.tx {
                tx.lock().expect("tx context poisoned").verifier().shutdown();
            }
            let _ = task.await;
        }
        if let Some(task) = workers.clock_task.take() {
            let _ = task.await;
        }
    }

    pub async fn stop_duplex(&mut self, guid: u64) -> crate::error::Result<()> {
        if guid == 0 {
            return Err(IsochError::BadArgument);
        }
        if self.active_guid != 0 && self.active_guid != guid {
            return Err(IsochError::Busy);
        }

        // Sequenced stop: clear Run on both contexts, quiesce the timers and
        // workers, reset the sync bridge, then drop queue attachments.
        if let Some(tx) = &self.tx {
            tx.lock().expect("tx context poisoned").stop();
        }
        if let Some(rx) = &self.rx {
            rx.lock().expect("rx context poisoned").stop();
        }
        self.teardown_workers().await;
        self.bridge.reset();
        if let Some(tx) = &self.tx {
            let mut ctx = tx.lock().expect("tx context poisoned");
            ctx.set_shared_tx_queue(std::ptr::null_mut(), 0);
            ctx.set_zero_copy_buffer(None);
        }
        if let Some(rx) = &self.rx {
            rx.lock()
                .expect("rx context poisoned")
                .set_shared_rx_queue(std::ptr::null_mut(), 0);
        }

        match serde_json::to_string(&self.counters()) {
            Ok(json) => info!("service: duplex stopped guid={guid:#x} counters={json}"),
            Err(e) => warn!("service: counters snapshot failed: {e}"),
        }

        self.active_guid = 0;
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        if let Some(tx) = &self.tx {
            tx.lock().expect("tx context poisoned").stop();
        }
        if let Some(rx) = &self.rx {
            rx.lock().expect("rx context poisoned").stop();
        }
        self.teardown_workers().await;
        self.bridge.reset();
        self.tx = None;
        self.rx = None;
        self.active_guid = 0;
    }

    pub fn sender(&self) -> Sender<Message> {
        self.sender.clone()
    }
}
