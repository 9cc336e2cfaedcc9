// Copyright 2026 Joyent, Inc.

use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::sync::watch;

use jacdac_rpc::bus::Bus;
use jacdac_rpc::config::{BusConfig, Hf2Config};
use jacdac_rpc::constants::SRV_BUTTON;
use jacdac_rpc::frame::frame_to_packets;
use jacdac_rpc::hf2::{Hf2FrameTransport, Hf2Transport, HF2_MODE_BOOTLOADER, HF2_MODE_USERSPACE};
use jacdac_rpc::server::{ProviderOptions, ServiceProvider, ServiceServer};
use jacdac_rpc::simulator::{self, SimulatorOptions};
use jacdac_rpc::transport::{SingleDevice, StreamReportTransport};

static APP: &'static str = "jdhf2";
const DEFAULT_LISTEN_MS: u64 = 1200;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Talk HF2 to a simulated USB device")
        .version(crate_version!())
        .arg(
            Arg::with_name("bootloader")
                .help("Start the device in bootloader mode")
                .long("bootloader")
                .short("b")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("dmesg")
                .help("Print the device log buffer")
                .long("dmesg")
                .short("d")
                .takes_value(false),
        )
        .arg(
            Arg::with_name("listen")
                .help("Run a bus over the device for this many milliseconds (Default: 1200)")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn root_log(verbose: bool) -> Logger {
    let level = if verbose { Level::Debug } else { Level::Info };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    )
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let log = root_log(matches.is_present("verbose"));
    let listen = value_t!(matches, "listen", u64).unwrap_or(DEFAULT_LISTEN_MS);
    let mode = if matches.is_present("bootloader") {
        HF2_MODE_BOOTLOADER
    } else {
        HF2_MODE_USERSPACE
    };

    let (host, dev) = tokio::io::duplex(4096);
    let sim = simulator::spawn(
        Arc::new(StreamReportTransport::new(dev)),
        SimulatorOptions {
            mode,
            dmesg: String::from("jacdac: up\nhf2: ready\n"),
            banner: Some(String::from("simulated firmware 0.1\n")),
            ..SimulatorOptions::default()
        },
        Some(&log),
    );

    let enumerator = Arc::new(SingleDevice::new(Arc::new(StreamReportTransport::new(host))));
    let hf2 = Hf2Transport::new(enumerator, Hf2Config::default(), Some(&log));
    let proto = hf2.connect().await.unwrap_or_else(|e| {
        eprintln!("Failed to connect: {}", e);
        process::exit(1)
    });

    match proto.info().await {
        Ok(info) => println!("{}", info),
        Err(e) => eprintln!("Error: {}", e),
    }
    if matches.is_present("dmesg") {
        match proto.dmesg().await {
            Ok(text) => print!("{}", text),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    if listen > 0 {
        let frames = Hf2FrameTransport::new(proto).await.unwrap_or_else(|e| {
            eprintln!("Failed to enable Jacdac forwarding: {}", e);
            process::exit(1)
        });
        let mut bus = Bus::new(BusConfig::default(), Some(&log));
        bus.add_provider(ServiceProvider::new(
            vec![ServiceServer::new(SRV_BUTTON)],
            ProviderOptions::default(),
            Some(&log),
        ));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            if let Err(e) = bus.run(&frames, rx).await {
                eprintln!("Error: {}", e);
            }
        });

        let deadline = tokio::time::sleep(Duration::from_millis(listen));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                frame = sim.next_sent_frame() => match frame {
                    Some(f) => {
                        for pkt in frame_to_packets(&f, 0, None, false, &log) {
                            println!("{}", pkt);
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = tx.send(true);
        let _ = task.await;
    }

    hf2.disconnect().await;
}
