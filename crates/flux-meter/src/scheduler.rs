//! Process-wide redraw ticker
//!
//! One background service thread drives every active meter channel's
//! `on_tick` at ~30 Hz, sequentially, from a single consumer thread. There
//! is no per-channel timer: the ticker keeps a list of weak references and
//! drops entries whose channels have been destroyed, so no ownership cycle
//! exists between a meter and its clock.
//!
//! Init and teardown are explicit (spawn at application start, shutdown at
//! stop). Tests bypass the thread entirely and drive
//! [`Metering::tick_all`](crate::registry::Metering::tick_all) with
//! synthetic timestamps.

use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{Receiver, Sender};
use flux_dsp::spectrum::FftScratch;

use crate::channel::{MeterChannel, TICK_INTERVAL};
use crate::types::{monotonic_now_ns, DEFAULT_FFT_WINDOW};

enum SchedulerCommand {
    Register(Weak<MeterChannel>),
    Shutdown,
}

/// Handle to the running ticker thread. Dropping it shuts the thread down.
pub struct MeterScheduler {
    command_tx: Sender<SchedulerCommand>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl MeterScheduler {
    /// Spawn the ticker thread.
    pub fn spawn() -> Result<Self, String> {
        let (command_tx, command_rx) = crossbeam::channel::unbounded();

        let handle = thread::Builder::new()
            .name("meter-scheduler".into())
            .spawn(move || run(command_rx))
            .map_err(|e| format!("failed to spawn meter scheduler thread: {}", e))?;

        Ok(Self {
            command_tx,
            thread_handle: Some(handle),
        })
    }

    /// Add a channel to the tick list. The scheduler holds only a weak
    /// reference; a destroyed channel is pruned on the next tick.
    pub fn register(&self, channel: &Arc<MeterChannel>) {
        let _ = self
            .command_tx
            .send(SchedulerCommand::Register(Arc::downgrade(channel)));
    }

    /// Stop the ticker and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.command_tx.send(SchedulerCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MeterScheduler {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

/// Ticker loop: commands between ticks, one fan-out pass per tick period.
/// The FFT scratch lives here - one set for the one consumer thread.
fn run(command_rx: Receiver<SchedulerCommand>) {
    log::info!("meter scheduler started ({:?} tick)", TICK_INTERVAL);

    let mut channels: Vec<Weak<MeterChannel>> = Vec::new();
    let mut fft = FftScratch::new(DEFAULT_FFT_WINDOW);

    loop {
        crossbeam::select! {
            recv(command_rx) -> cmd => match cmd {
                Ok(SchedulerCommand::Register(channel)) => channels.push(channel),
                Ok(SchedulerCommand::Shutdown) | Err(_) => break,
            },
            default(TICK_INTERVAL) => {
                let now = monotonic_now_ns();
                channels.retain(|weak| match weak.upgrade() {
                    Some(channel) => {
                        channel.on_tick(now, &mut fft);
                        true
                    }
                    None => false,
                });
            }
        }
    }

    log::info!("meter scheduler stopped");
}
