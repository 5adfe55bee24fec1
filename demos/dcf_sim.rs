//! DCF contention simulation
//!
//! Runs a number of saturated stations sharing a single simulated medium
//! and reports per station delivery and contention statistics.
//
// Copyright 2021 Ryan Kurte

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use structopt::StructOpt;

use wifi_dcf::mac::AccessCategory;
use wifi_dcf::phy::OfdmTiming;
use wifi_dcf::prelude::*;
use wifi_dcf::timer::sim::SimScheduler;

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "5")]
    /// Number of contending stations
    pub stations: usize,

    #[structopt(long, default_value = "1s")]
    /// Simulated time to run for
    pub duration: humantime::Duration,

    #[structopt(long, default_value = "1000")]
    /// Payload length of generated frames in bytes
    pub payload: usize,

    #[structopt(long, default_value = "54000")]
    /// Data rate in kbit/s
    pub rate: u32,

    #[structopt(long, default_value = "65535")]
    /// Protect frames larger than this with RTS/CTS
    pub rts_threshold: usize,

    #[structopt(long)]
    /// Use EDCA queues, station traffic is spread across TIDs
    pub qos: bool,

    #[structopt(long, default_value = "1")]
    /// Seed for backoff generation
    pub seed: u64,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

/// Frames kept queued at each station
const BACKLOG: usize = 4;

/// PHY attached to the shared medium, transmissions are collected for delivery by the driver
#[derive(Clone)]
struct SimPhy {
    index: usize,
    timing: OfdmTiming,
    sched: SimScheduler,
    outbox: Arc<Mutex<Vec<Transmission>>>,
}

impl Phy for SimPhy {
    fn sifs(&self) -> Ts {
        self.timing.sifs
    }

    fn slot(&self) -> Ts {
        self.timing.slot
    }

    fn preamble_and_header_duration(&self, _tx: &TxVector) -> Ts {
        self.timing.preamble
    }

    fn tx_duration(&self, size: usize, tx: &TxVector) -> Ts {
        self.timing.tx_duration(size, tx)
    }

    fn ack_tx_time(&self) -> Ts {
        self.timing.ack_tx_time()
    }

    fn send(&mut self, frame: &Frame, tx: &TxVector) {
        let start = self.sched.now();
        let end = start + self.tx_duration(frame.size(), tx);

        self.outbox.lock().unwrap().push(Transmission {
            from: self.index,
            start,
            end,
            frame: frame.clone(),
            tx: *tx,
            collided: false,
        });
    }
}

#[derive(Clone, Debug)]
struct Transmission {
    from: usize,
    start: Ts,
    end: Ts,
    frame: Frame,
    tx: TxVector,
    collided: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    accesses: u64,
    acked: u64,
    retry_drops: u64,
    expired: u64,
    internal_collisions: u64,
    received: u64,
}

/// Observer accumulating station statistics
#[derive(Clone, Debug, Default)]
struct Stats {
    inner: Arc<Mutex<Counters>>,
}

impl Stats {
    fn get(&self) -> Counters {
        *self.inner.lock().unwrap()
    }
}

impl MacObserver for Stats {
    fn channel_accessed(&mut self, _ac: AccessCategory) {
        self.inner.lock().unwrap().accesses += 1;
    }

    fn internal_collision(&mut self, _ac: AccessCategory) {
        self.inner.lock().unwrap().internal_collisions += 1;
    }

    fn frame_acked(&mut self, _frame: &Frame) {
        self.inner.lock().unwrap().acked += 1;
    }

    fn frame_dropped(&mut self, _frame: &Frame, reason: DropReason) {
        let mut c = self.inner.lock().unwrap();
        match reason {
            DropReason::RetryLimitExceeded => c.retry_drops += 1,
            DropReason::Expired => c.expired += 1,
        }
    }

    fn frame_received(&mut self, _frame: &Frame) {
        self.inner.lock().unwrap().received += 1;
    }
}

type Station = Mac<SimPhy, ConstantRateManager, SimScheduler, Stats, StdRng>;

/// Medium events, delivering a transmission to a station
#[derive(Clone, Copy, Debug)]
enum Delivery {
    Start { to: usize, tx: usize },
    End { to: usize, tx: usize },
}

fn main() -> anyhow::Result<()> {
    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    if opts.stations < 2 {
        return Err(anyhow::anyhow!("At least two stations are required"));
    }

    info!(
        "Simulating {} stations for {} ({} byte payloads at {} kbit/s)",
        opts.stations, opts.duration, opts.payload, opts.rate
    );

    let duration: Duration = opts.duration.into();
    let end = duration.as_micros() as Ts;

    let sched = SimScheduler::new();
    let mut medium = sched.handle(opts.stations);
    let outbox = Arc::new(Mutex::new(Vec::new()));
    let timing = OfdmTiming::default();

    let mac_config = MacConfig {
        qos_supported: opts.qos,
        ..Default::default()
    };
    let manager_config = ManagerConfig {
        data_rate_kbps: opts.rate,
        rts_cts_threshold: opts.rts_threshold,
        ..Default::default()
    };

    let mut stations: Vec<Station> = Vec::new();
    let mut stats = Vec::new();

    for i in 0..opts.stations {
        let phy = SimPhy {
            index: i,
            timing,
            sched: sched.clone(),
            outbox: outbox.clone(),
        };
        let observer = Stats::default();

        let mac = Mac::new(
            MacAddr::local(i as u16 + 1),
            mac_config.clone(),
            phy,
            ConstantRateManager::new(manager_config.clone()),
            sched.handle(i),
            observer.clone(),
            StdRng::seed_from_u64(opts.seed.wrapping_add(i as u64)),
        )
        .map_err(|e| anyhow::anyhow!("Error initialising MAC {}: {:?}", i, e))?;

        stations.push(mac);
        stats.push(observer);
    }

    let payload = Bytes::from(vec![0xa5u8; opts.payload]);
    let mut air: Vec<Transmission> = Vec::new();
    let mut deliveries = BTreeMap::new();
    let mut medium_events = 0usize;

    debug!("Starting loop");

    loop {
        // Keep every station saturated
        for (i, mac) in stations.iter_mut().enumerate() {
            let tid = (i % 8) as u8;
            let ac = match opts.qos {
                true => AccessCategory::from_tid(tid),
                false => AccessCategory::Legacy,
            };

            while mac.queue_len(ac).unwrap_or(BACKLOG) < BACKLOG {
                let dest = MacAddr::local(((i + 1) % opts.stations) as u16 + 1);
                if let Err(e) = mac.transmit_data(dest, payload.clone(), tid) {
                    error!("Station {} enqueue error: {:?}", i, e);
                    break;
                }
            }
        }

        // Put new transmissions on the air
        let sent: Vec<_> = outbox.lock().unwrap().drain(..).collect();
        for mut t in sent {
            let start = t.start;
            for other in air.iter_mut().filter(|o| o.end > start) {
                trace!("Collision between {} and {} at {} us", other.from, t.from, t.start);
                other.collided = true;
                t.collided = true;
            }

            let index = air.len();
            for to in 0..stations.len() {
                // Stations are half duplex
                if to == t.from || air.iter().any(|o| o.from == to && o.end > t.start) {
                    continue;
                }

                let id = medium.schedule(t.start);
                deliveries.insert(id, Delivery::Start { to, tx: index });
            }

            air.push(t);
        }

        let (owner, id) = match sched.next() {
            Some(v) => v,
            None => break,
        };
        if sched.now() > end {
            break;
        }

        if owner < stations.len() {
            if let Err(e) = stations[owner].handle_timeout(id) {
                error!("Station {} timer error: {:?}", owner, e);
            }
            continue;
        }

        match deliveries.remove(&id) {
            Some(Delivery::Start { to, tx }) => {
                let t = &air[tx];
                stations[to].notify_rx_start(t.end - t.start);

                let id = medium.schedule(t.end);
                deliveries.insert(id, Delivery::End { to, tx });
            }
            Some(Delivery::End { to, tx }) => {
                let t = &air[tx];
                if t.collided {
                    stations[to].notify_rx_end_error();
                } else if let Err(e) = stations[to].notify_rx_end_ok(t.frame.clone(), t.tx) {
                    error!("Station {} rx error: {:?}", to, e);
                }
            }
            None => (),
        }

        medium_events += 1;
    }

    let collided = air.iter().filter(|t| t.collided).count();
    info!(
        "Processed {} medium events, {} transmissions ({} collided)",
        medium_events,
        air.len(),
        collided
    );

    let mut total = 0;
    for (i, s) in stats.iter().enumerate() {
        let c = s.get();
        let cw = match opts.qos {
            true => stations[i].cw(AccessCategory::from_tid((i % 8) as u8)),
            false => stations[i].cw(AccessCategory::Legacy),
        };

        println!(
            "station {:2}: {:6} acked {:4} retry drops {:4} expired {:6} accesses {:4} internal collisions {:6} received (cw {:?})",
            i, c.acked, c.retry_drops, c.expired, c.accesses, c.internal_collisions, c.received, cw,
        );
        total += c.acked;
    }

    let mbps = (total * opts.payload as u64 * 8) as f64 / end.max(1) as f64;
    println!("aggregate throughput: {:.2} Mbit/s", mbps);

    Ok(())
}
