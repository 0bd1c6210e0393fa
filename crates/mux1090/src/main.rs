mod aircraftdb;
mod cli;
mod fleet;
mod net;
mod raw;
mod replay;
mod sbs;
mod services;
mod stats;
mod web;
mod webfs;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use rx1090::decode::time::now_in_s;
use rx1090::demod::DemodConfig;
use rx1090::prelude::*;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aircraftdb::AircraftDb;
use fleet::FleetTable;
use services::{ServiceKind, ServiceSet};
use stats::Stats;

/// What the inputs queue for the decode loop: a Mode S frame from the
/// demodulator or a raw-in connection, or a pre-decoded SBS record
pub enum Input {
    Frame {
        bytes: Vec<u8>,
        /// 12 MHz sample clock at the end of bit 56, when demodulated here
        timestamp: Option<u64>,
        system_timestamp: f64,
        /// mean signal power, linear 0..1, when demodulated here
        signal: Option<f64>,
    },
    Sbs(sbs::SbsMessage),
}

/// Everything behind the shared lock: the fleet table, the service
/// registries and the counters
pub struct App {
    pub fleet: FleetTable,
    pub services: ServiceSet,
    pub stats: Stats,
    exit: watch::Sender<bool>,
}

impl App {
    pub fn new(fleet: FleetTable, services: ServiceSet) -> Self {
        let (exit, _) = watch::channel(false);
        App {
            fleet,
            services,
            stats: Stats::default(),
            exit,
        }
    }

    /// Ask the main loop to wind down
    pub fn request_exit(&self) {
        let _ = self.exit.send(true);
    }

    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }
}

type Shared = Arc<Mutex<App>>;

/// Half the interactive refresh interval; fleet maintenance runs on it
const TICK: Duration = Duration::from_millis(125);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = cli::Options::parse();

    let db = match &options.aircraft_db {
        Some(path) => match AircraftDb::load(Path::new(path)) {
            Ok(db) => db,
            Err(e) => {
                warn!("could not load aircraft database {path}: {e}");
                AircraftDb::empty()
            }
        },
        None => AircraftDb::empty(),
    };

    let fleet = FleetTable::new(
        options.home(),
        options.max_range,
        options.expire as f64,
    );
    let mut services = ServiceSet::new(
        options.net_ri_port,
        options.net_ro_port,
        options.net_sbsi_port,
        options.net_sbs_port,
        options.net_http_port,
    );
    if let Some(deny) = &options.deny_raw {
        services.raw_in.deny = deny.0.clone();
        services.raw_out.deny = deny.0.clone();
    }
    if let Some(deny) = &options.deny_sbs {
        services.sbs_in.deny = deny.0.clone();
        services.sbs_out.deny = deny.0.clone();
    }
    if let Some(deny) = &options.deny_http {
        services.http.deny = deny.0.clone();
    }

    let app: Shared = Arc::new(Mutex::new(App::new(fleet, services)));
    let mut exit = app.lock().await.subscribe_exit();

    let (tx, mut rx) = mpsc::channel::<Input>(100);

    // ctrl-c flips the exit flag; handlers notice and return early
    {
        let app = app.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
                app.lock().await.request_exit();
            }
        });
    }

    net::start_listeners(app.clone(), tx.clone(), options.net_ri_udp)
        .await?;

    if let Some(endpoint) = options.host_raw.clone() {
        net::start_active(ServiceKind::RawIn, endpoint, app.clone(), tx.clone());
    }
    if let Some(endpoint) = options.host_sbs.clone() {
        net::start_active(ServiceKind::SbsIn, endpoint, app.clone(), tx.clone());
    }

    // the HTTP service, on its own listener
    {
        let fs: Arc<dyn webfs::WebFs> = if options.packed_web {
            Arc::new(webfs::PackedFs::builtin())
        } else {
            Arc::new(webfs::DiskFs::new(options.web_root.clone()))
        };
        let config = web::WebConfig {
            web_page: options.web_page.clone(),
            keep_alive: !options.no_keep_alive,
            json_interval: options.json_interval,
        };
        let port = options.net_http_port;
        app.lock().await.services.http.url =
            Some(format!("http://0.0.0.0:{port}"));
        let routes = web::routes(app.clone(), fs, config);
        tokio::spawn(warp::serve(routes).run(([0, 0, 0, 0], port)));
    }

    // fleet maintenance: dead reckoning on every tick, the show-state
    // machine on every publish interval
    {
        let app = app.clone();
        let publish_every =
            (options.json_interval / TICK.as_millis() as u64).max(1);
        tokio::spawn(async move {
            let mut ticker = interval(TICK);
            let mut count: u64 = 0;
            loop {
                ticker.tick().await;
                let now = now_in_s();
                let mut app = app.lock().await;
                app.fleet.tick(now);
                count += 1;
                if count % publish_every == 0 {
                    app.fleet.publish_cycle(now);
                }
            }
        });
    }

    // the sample source: a prerecorded file in place of an SDR front end
    if let Some(path) = options.ifile.clone() {
        let app = app.clone();
        let tx = tx.clone();
        let config = replay::Replay {
            path,
            throttle: options.throttle,
            demod: DemodConfig {
                preamble_threshold: options.preamble_threshold,
                fix_df: options.fix_df,
                nfix_crc: u8::from(options.fix_crc),
            },
        };
        tokio::spawn(async move {
            match replay::run(config, tx).await {
                Ok(demod_stats) => {
                    let mut app = app.lock().await;
                    app.stats.merge_demod(&demod_stats);
                    // end of the recording ends the run
                    app.request_exit();
                }
                Err(e) => {
                    error!("sample replay failed: {e}");
                    app.lock().await.request_exit();
                }
            }
        });
    }

    // the decode loop: everything the queue delivers goes through the
    // fleet table and out to the subscribers
    loop {
        tokio::select! {
            _ = exit.changed() => break,
            input = rx.recv() => match input {
                None => break,
                Some(input) => handle_input(&app, input, &db, &options).await,
            },
        }
    }

    // orderly shutdown: report, then a short drain for pending closes
    {
        let app = app.lock().await;
        stats::report(
            &app.services,
            &app.stats,
            &app.fleet.cpr,
            app.fleet.messages_total,
        );
    }
    sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn handle_input(
    app: &Shared,
    input: Input,
    db: &AircraftDb,
    options: &cli::Options,
) {
    match input {
        Input::Frame {
            bytes,
            timestamp,
            system_timestamp,
            signal,
        } => {
            let msg = match Message::from_bytes((&bytes, 0)) {
                Ok((_, msg)) => msg,
                Err(_) => {
                    // a frame with a wrong CRC got here over the network
                    app.lock().await.stats.unrecognized_raw += 1;
                    return;
                }
            };

            let mut app = app.lock().await;
            let App {
                fleet, services, ..
            } = &mut *app;
            let position =
                fleet.update(&msg, system_timestamp, signal, db);

            if options.verbose {
                if let Ok(mut value) = serde_json::to_value(&msg) {
                    value["timestamp"] = system_timestamp.into();
                    if let Some(clock) = timestamp {
                        value["nanoseconds"] = clock.into();
                    }
                    value["frame"] = hex::encode(&bytes).into();
                    println!("{value}");
                }
            }

            // re-encode once, deliver to every subscriber
            let line = raw::encode_frame(&bytes);
            services.broadcast(ServiceKind::RawOut, line.as_bytes());

            if let Some(line) =
                sbs::encode(&msg, position, chrono::Local::now())
            {
                services.broadcast(ServiceKind::SbsOut, line.as_bytes());
            }
        }
        Input::Sbs(record) => {
            let now = now_in_s();
            app.lock().await.fleet.apply_sbs(&record, now, db);
        }
    }
}
