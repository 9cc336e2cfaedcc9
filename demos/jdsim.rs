// Copyright 2026 Joyent, Inc.

use std::env;
use std::fs;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use slog::{error, info, o, Drain, Logger};
use tokio::sync::watch;

use jacdac_rpc::bus::{Bus, BusEvent};
use jacdac_rpc::config::BusConfig;
use jacdac_rpc::constants::{system_event, system_reg, SRV_BUTTON};
use jacdac_rpc::pack::Value;
use jacdac_rpc::server::{ProviderOptions, RegisterServer, ServiceProvider, ServiceServer};
use jacdac_rpc::transport::{FrameTransport, LoopbackTransport};

const PRESS_PERIOD_MS: u64 = 700;
const RUN_FOR_MS: u64 = 4000;

fn load_config(log: &Logger) -> BusConfig {
    let path = match env::var("JDSIM_CONFIG") {
        Ok(p) => p,
        Err(_) => return BusConfig::default(),
    };
    match fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|s| BusConfig::from_json_str(&s).map_err(|e| e.to_string()))
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(log, "ignoring config"; "path" => path, "error" => e);
            BusConfig::default()
        }
    }
}

fn button(log: &Logger) -> ServiceProvider {
    let mut srv = ServiceServer::new(SRV_BUTTON).with_instance_name("button");
    if let Ok(reg) = RegisterServer::new(system_reg::READING, "u16", Some(&[Value::Num(0.0)])) {
        srv.add_register(reg);
    }
    ServiceProvider::new(
        vec![srv],
        ProviderOptions {
            description: String::from("simulated button"),
            ..ProviderOptions::default()
        },
        Some(log),
    )
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );
    let cfg = load_config(&root_log);

    let (near, far) = LoopbackTransport::pair();
    let (tx, rx) = watch::channel(false);

    let mut observer = Bus::new(cfg.clone(), Some(&root_log.new(o!("side" => "observer"))));
    let obs_log = root_log.new(o!("side" => "observer"));
    observer.subscribe(move |ev| match ev {
        BusEvent::DeviceAnnounce(d) => {
            info!(obs_log, "announce"; "device" => d.short_id(),
                  "classes" => format!("{:x?}", d.service_classes()));
        }
        BusEvent::Event(p) => {
            info!(obs_log, "event"; "pkt" => %p, "code" => p.event_code());
        }
        BusEvent::DeviceLost(d) => info!(obs_log, "lost"; "device" => d.short_id()),
        _ => (),
    });
    let observer_task = tokio::spawn(async move {
        if let Err(e) = observer.run(&far, rx).await {
            eprintln!("Error: {}", e);
        }
    });

    let log = root_log.new(o!("side" => "button"));
    let mut bus = Bus::new(cfg.clone(), Some(&log));
    let idx = bus.add_provider(button(&log));

    let start = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_millis(cfg.delayed_send_poll_ms.max(1)));
    let mut next_press = PRESS_PERIOD_MS;
    let mut pressed = false;
    loop {
        interval.tick().await;
        let now = start.elapsed().as_millis() as u64;
        if now >= RUN_FOR_MS {
            break;
        }
        if now >= next_press {
            next_press += PRESS_PERIOD_MS;
            pressed = !pressed;
            if let Some(provider) = bus.provider_mut(idx) {
                let (reading, ev) = if pressed {
                    (1.0, system_event::ACTIVE)
                } else {
                    (0.0, system_event::INACTIVE)
                };
                if let Some(srv) = provider.service_mut(1) {
                    let _ = srv.set_register(system_reg::READING, &[Value::Num(reading)], false);
                }
                if let Err(e) = provider.send_event(1, ev, &[], now) {
                    error!(log, "event failed"; "error" => %e);
                }
            }
        }
        bus.tick(now);
        for frame in bus.take_outgoing_frames() {
            if let Err(e) = near.send_frame(frame).await {
                error!(log, "send failed"; "error" => %e);
            }
        }
    }

    let _ = tx.send(true);
    let _ = observer_task.await;
}
