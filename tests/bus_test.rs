// Copyright 2026 Joyent, Inc.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::sync::watch;

use jacdac_rpc::bus::{Bus, BusEvent};
use jacdac_rpc::config::BusConfig;
use jacdac_rpc::constants::{system_reg, CMD_SET_REG, JD_FRAME_FLAG_COMMAND, SRV_BUTTON};
use jacdac_rpc::device::DeviceId;
use jacdac_rpc::pack::Value;
use jacdac_rpc::packet::Packet;
use jacdac_rpc::server::{
    FieldBounds, Notification, ProviderOptions, RegisterServer, ServiceProvider, ServiceServer,
};
use jacdac_rpc::transport::LoopbackTransport;

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("test" => "bus"),
    )
}

fn dimmer(id: DeviceId, log: &Logger) -> ServiceProvider {
    let mut srv = ServiceServer::new(SRV_BUTTON).with_instance_name("dimmer");
    srv.add_register(
        RegisterServer::new(system_reg::INTENSITY, "u8", Some(&[Value::Num(0.0)]))
            .unwrap()
            .with_bounds(0, FieldBounds::new(0.0, 100.0)),
    );
    ServiceProvider::new(
        vec![srv],
        ProviderOptions {
            device_id: Some(id),
            description: String::from("dimmer"),
            ..ProviderOptions::default()
        },
        Some(log),
    )
}

#[tokio::test]
async fn two_buses_over_loopback() {
    let log = test_log();
    let a_id = DeviceId::new([0xa; 8]);
    let b_id = DeviceId::new([0xb; 8]);

    let mut a = Bus::new(BusConfig::default(), Some(&log));
    a.add_provider(dimmer(a_id, &log));
    let mut b = Bus::new(BusConfig::default(), Some(&log));
    b.add_provider(dimmer(b_id, &log));

    let changes = Arc::new(Mutex::new(Vec::new()));
    let c = changes.clone();
    b.subscribe(move |ev| {
        if let BusEvent::Notification {
            device_id,
            notification: Notification::RegisterChanged { service_index, code },
        } = ev
        {
            c.lock().unwrap().push((*device_id, *service_index, *code));
        }
    });

    // out of range, clamped to 100 on the other side
    let set = Packet::encode(
        CMD_SET_REG | system_reg::INTENSITY,
        JD_FRAME_FLAG_COMMAND,
        b_id,
        1,
        &[250],
    )
    .unwrap();
    a.send_packet(set, 0);

    let (near, far) = LoopbackTransport::pair();
    let (tx, rx) = watch::channel(false);
    let ta = {
        let rx = rx.clone();
        tokio::spawn(async move {
            a.run(&near, rx).await.unwrap();
            a
        })
    };
    let tb = tokio::spawn(async move {
        b.run(&far, rx).await.unwrap();
        b
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    let a = ta.await.unwrap();
    let b = tb.await.unwrap();

    for bus in [&a, &b].iter() {
        let ids: Vec<DeviceId> = {
            let mut ids: Vec<DeviceId> = bus.devices().map(|d| d.device_id()).collect();
            ids.sort();
            ids
        };
        assert_eq!(ids, vec![a_id, b_id]);
    }
    let remote = a.device(&b_id).unwrap();
    assert!(remote.announced());
    assert!(remote.has_service(SRV_BUTTON));

    assert_eq!(
        *changes.lock().unwrap(),
        vec![(b_id, 1, system_reg::INTENSITY)]
    );
    let reg = b.providers()[0]
        .service(1)
        .unwrap()
        .register(system_reg::INTENSITY)
        .unwrap();
    assert_eq!(reg.data(), Some(&[100u8][..]));
}
