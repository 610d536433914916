//! Poll cadence runner: drives the processor and drains the queues on a
//! fixed tick schedule.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::error::FronmodError;
use crate::gateway::ValueSink;
use crate::processor::MetricProcessor;
use crate::reader::RegisterSource;
use crate::registers::{Priority, ResultMap};

/// Single-threaded scheduler for one processor/gateway pair.
///
/// Each tick (2 s by default) advances a five-phase rotation — idle,
/// inverter, mppt, meter, fast drain — so every value class is refreshed
/// about every 10 seconds and the inverter always runs before the mppt
/// batch of the same cycle. Storage fetches, medium/slow drains, and
/// reconnects run on their own tick periods.
///
/// Sub-model failures are logged and skipped; the loop never stops on them.
pub struct Runner<S, G> {
    processor: MetricProcessor<S>,
    gateway: G,
    poll: PollConfig,
    tick: u64,
}

impl<S: RegisterSource, G: ValueSink> Runner<S, G> {
    /// Creates a runner over a processor and a gateway sink.
    pub fn new(processor: MetricProcessor<S>, gateway: G, poll: PollConfig) -> Self {
        Self {
            processor,
            gateway,
            poll,
            tick: 0,
        }
    }

    /// The gateway sink (inspection hook for tests).
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// The processor (inspection hook for tests).
    pub fn processor(&self) -> &MetricProcessor<S> {
        &self.processor
    }

    /// Number of ticks executed so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Executes one scheduler tick.
    pub fn step(&mut self) {
        let tick = self.tick;
        self.tick += 1;

        match tick % 5 {
            1 => log_outcome("inverter", self.processor.process_inverter()),
            2 => log_outcome("mppt", self.processor.process_mppt()),
            3 => log_outcome("meter", self.processor.process_meter()),
            4 => self.send(Priority::Fast),
            _ => {}
        }

        if tick % self.poll.storage_period_ticks == 0 {
            log_outcome("storage", self.processor.process_storage());
        }
        if tick % self.poll.medium_send_ticks == self.poll.medium_send_ticks - 1 {
            self.send(Priority::Medium);
        }
        if tick % self.poll.slow_send_ticks == self.poll.slow_send_ticks - 1 {
            self.send(Priority::Slow);
        }
        if tick % self.poll.reconnect_ticks == self.poll.reconnect_ticks - 1 {
            if let Err(err) = self.processor.reconnect() {
                warn!("reconnect failed: {err}");
            }
        }
    }

    /// Runs the tick loop, sleeping between ticks.
    ///
    /// Stops after `poll.cycles` ticks when configured, then performs the
    /// shutdown reset; otherwise loops until the process is killed.
    pub fn run(&mut self) {
        let tick_duration = Duration::from_secs(self.poll.tick_secs);

        loop {
            let started = Instant::now();
            self.step();

            if let Some(cycles) = self.poll.cycles {
                if self.tick >= cycles {
                    break;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < tick_duration {
                thread::sleep(tick_duration - elapsed);
            }
        }

        self.close();
    }

    /// Pushes a NULL update for every published item so the gateway's
    /// displayed state does not go stale.
    pub fn close(&mut self) {
        info!("shutting down, resetting published items");
        if let Err(err) = self.gateway.reset_all() {
            warn!("reset failed: {err}");
        }
    }

    fn send(&mut self, priority: Priority) {
        let values = self.processor.get_send_data(priority);
        if values.is_empty() {
            return;
        }
        debug!(?priority, count = values.len(), "publishing");
        if let Err(err) = self.gateway.publish(&values) {
            warn!(?priority, "publish failed: {err}");
        }
    }
}

fn log_outcome(model: &'static str, outcome: Result<ResultMap, FronmodError>) {
    match outcome {
        Ok(results) => debug!(model, results = results.len(), "batch processed"),
        Err(err) => warn!(model, "batch processing failed: {err}"),
    }
}
