mod common;
use common::*;
use energy_bridge::facade::Action;
use energy_bridge::host::{ChannelData, StateValue};
use energy_bridge::prelude::*;
use energy_bridge::wallbox::cion::Cion;
use energy_bridge::wallbox::ev11::Ev11;
use energy_bridge::wallbox::CurrentLimits;

use std::time::Duration;

fn last_state(messages: &[ChannelData], name: &str) -> Option<StateValue> {
    messages.iter().rev().find_map(|m| match m {
        ChannelData::StateChanged(_, n, value) if *n == name => Some(value.clone()),
        _ => None,
    })
}

fn ev11_device() -> MockDevice {
    let device = MockDevice::new();
    device.set_ascii(100, "EV11-0042", 8);
    device.set_ascii(108, "1.2.3", 4);
    // C2, three phase relay, 16 A dip, 15.8 A, 35 C, 12345 Wh, no error, auto switch on
    device.set(200, &[5, 2, 16000, 15800, 35, 0, 12345, 0, 1]);
    device
}

fn ev11(connection: std::sync::Arc<Connection>) -> (Ev11, energy_bridge::host::Receiver) {
    let (tx, rx) = broadcast::channel(256);
    let ev11 = Ev11::new(ThingId::new("ev11/garage"), connection, Duration::from_secs(30), tx);
    (ev11, rx)
}

#[tokio::test]
async fn ev11_writes_heartbeat_before_reading() {
    common_setup();

    let device = ev11_device();
    let connection = connected(&device).await;
    let (mut ev11, mut rx) = ev11(connection);

    ev11.on_reachable_changed(true);
    ev11.update().await.unwrap();

    assert_eq!(
        device.transactions(),
        vec![Op::Write(300, vec![1]), Op::Read(200, 9), Op::Read(100, 12)]
    );

    let messages = drain(&mut rx);
    assert_eq!(last_state(&messages, "pluggedIn"), Some(StateValue::Bool(true)));
    assert_eq!(last_state(&messages, "charging"), Some(StateValue::Bool(true)));
    assert_eq!(last_state(&messages, "phaseCount"), Some(StateValue::Int(3)));
    assert_eq!(last_state(&messages, "sessionEnergy"), Some(StateValue::Double(12.345)));
    assert_eq!(last_state(&messages, "chargingCurrent"), Some(StateValue::Double(15.8)));
    assert_eq!(last_state(&messages, "serialNumber"), Some(StateValue::Text("EV11-0042".to_string())));
    assert_eq!(last_state(&messages, "firmwareVersion"), Some(StateValue::Text("1.2.3".to_string())));
    assert_eq!(last_state(&messages, "error"), Some(StateValue::Text("No error".to_string())));
    assert_eq!(ev11.limits(), CurrentLimits { min: 6, max: 16 });
}

#[tokio::test(start_paused = true)]
async fn ev11_heartbeat_follows_the_watchdog_interval() {
    common_setup();

    let device = ev11_device();
    let connection = connected(&device).await;
    let (mut ev11, _rx) = ev11(connection);

    ev11.on_reachable_changed(true);
    ev11.update().await.unwrap();
    device.clear_log();

    ev11.update().await.unwrap();
    assert_eq!(device.transactions(), vec![Op::Read(200, 9)]);
    device.clear_log();

    tokio::time::advance(Duration::from_secs(30)).await;
    ev11.update().await.unwrap();
    assert_eq!(device.transactions(), vec![Op::Write(300, vec![1]), Op::Read(200, 9)]);
}

#[tokio::test]
async fn ev11_failed_heartbeat_does_not_stop_the_poll() {
    common_setup();

    let device = ev11_device();
    let connection = connected(&device).await;
    let (mut ev11, _rx) = ev11(connection);

    ev11.on_reachable_changed(true);
    device.fail_next(TransactionError::ProtocolError(4));
    device.fail_next(TransactionError::ProtocolError(4));
    device.fail_next(TransactionError::ProtocolError(4));

    ev11.update().await.unwrap();
    assert_eq!(device.writes().len(), 3);
    assert!(device.transactions().contains(&Op::Read(200, 9)));
}

#[tokio::test]
async fn ev11_current_is_cached_while_off() {
    common_setup();

    let device = ev11_device();
    let connection = connected(&device).await;
    let (mut ev11, _rx) = ev11(connection);
    ev11.on_reachable_changed(true);

    ev11.execute(Action::MaxChargingCurrent(16)).await.unwrap();
    assert!(device.writes().is_empty());
    assert_eq!(ev11.max_charging_current(), 16);

    ev11.execute(Action::Power(true)).await.unwrap();
    assert_eq!(device.writes(), vec![(301, vec![48768])]);
    assert!(ev11.is_powered());

    // while on, a new current goes straight to the wallbox
    ev11.execute(Action::MaxChargingCurrent(10)).await.unwrap();
    ev11.execute(Action::Power(false)).await.unwrap();
    assert_eq!(
        device.writes(),
        vec![(301, vec![48768]), (301, vec![10000 | 0x8000]), (301, vec![0])]
    );
}

#[tokio::test]
async fn ev11_rejects_out_of_range_and_single_phase_without_auto_switch() {
    common_setup();

    let device = ev11_device();
    device.set(208, &[0]);
    let connection = connected(&device).await;
    let (mut ev11, _rx) = ev11(connection);
    ev11.on_reachable_changed(true);
    ev11.update().await.unwrap();

    assert_eq!(ev11.execute(Action::MaxChargingCurrent(40)).await, Err(ThingError::InvalidParameter));
    assert_eq!(ev11.execute(Action::DesiredPhaseCount(1)).await, Err(ThingError::InvalidParameter));
    assert_eq!(ev11.execute(Action::GridCharging(true)).await, Err(ThingError::UnsupportedFeature));
    assert_eq!(ev11.execute(Action::DesiredPhaseCount(3)).await, Ok(()));
}

#[tokio::test]
async fn ev11_single_phase_clears_the_phase_bit() {
    common_setup();

    let device = ev11_device();
    let connection = connected(&device).await;
    let (mut ev11, _rx) = ev11(connection);
    ev11.on_reachable_changed(true);
    ev11.update().await.unwrap();
    device.clear_log();

    ev11.execute(Action::DesiredPhaseCount(1)).await.unwrap();
    ev11.execute(Action::MaxChargingCurrent(8)).await.unwrap();
    ev11.execute(Action::Power(true)).await.unwrap();
    assert_eq!(device.writes(), vec![(301, vec![8000])]);
}

#[tokio::test]
async fn ev11_does_nothing_while_unreachable() {
    common_setup();

    let device = ev11_device();
    let connection = connected(&device).await;
    let (mut ev11, _rx) = ev11(connection.clone());
    ev11.on_reachable_changed(true);

    connection.disconnect().await;
    ev11.on_reachable_changed(false);
    device.clear_log();

    assert_eq!(ev11.update().await, Err(ThingError::HardwareNotAvailable));
    assert_eq!(ev11.execute(Action::Power(true)).await, Err(ThingError::HardwareNotAvailable));
    assert!(device.log().is_empty());
}

fn cion_device() -> MockDevice {
    let device = MockDevice::new();
    device.set(100, &[1, 16]);
    device.set(121, &[67, 0, 0, 600, 0, 900, 16, 32]);
    device.set(507, &[6]);
    device.set_ascii(700, "2.04", 4);
    device
}

fn cion(connection: std::sync::Arc<Connection>) -> (Cion, energy_bridge::host::Receiver) {
    let (tx, rx) = broadcast::channel(256);
    (Cion::new(ThingId::new("cion/carport"), connection, tx), rx)
}

#[tokio::test]
async fn cion_reads_state() {
    common_setup();

    let device = cion_device();
    let connection = connected(&device).await;
    let (mut cion, mut rx) = cion(connection);
    cion.on_reachable_changed(true);

    cion.update().await.unwrap();
    assert_eq!(
        device.transactions(),
        vec![Op::Read(100, 2), Op::Read(121, 12), Op::Read(507, 1), Op::Read(700, 5)]
    );

    let messages = drain(&mut rx);
    assert_eq!(last_state(&messages, "pluggedIn"), Some(StateValue::Bool(true)));
    assert_eq!(last_state(&messages, "charging"), Some(StateValue::Bool(true)));
    assert_eq!(last_state(&messages, "power"), Some(StateValue::Bool(true)));
    assert_eq!(last_state(&messages, "maxChargingCurrent"), Some(StateValue::Int(16)));
    assert_eq!(last_state(&messages, "chargingTime"), Some(StateValue::Int(10)));
    assert_eq!(last_state(&messages, "firmwareVersion"), Some(StateValue::Text("2.04".to_string())));
    assert!(cion.is_powered());
}

#[tokio::test]
async fn cion_ignores_implausible_minimum() {
    common_setup();

    let device = cion_device();
    device.set(507, &[255]);
    let connection = connected(&device).await;
    let (mut cion, _rx) = cion(connection);
    cion.on_reachable_changed(true);

    cion.update().await.unwrap();
    assert_eq!(cion.limits().min, 6);

    device.set(507, &[10]);
    cion.update().await.unwrap();
    assert_eq!(cion.limits(), CurrentLimits { min: 10, max: 32 });
}

#[tokio::test]
async fn cion_ignores_unknown_cp_states() {
    common_setup();

    let device = cion_device();
    device.set(121, &[70]);
    let connection = connected(&device).await;
    let (mut cion, mut rx) = cion(connection);
    cion.on_reachable_changed(true);

    cion.update().await.unwrap();
    let messages = drain(&mut rx);
    assert_eq!(last_state(&messages, "pluggedIn"), None);
    assert_eq!(last_state(&messages, "charging"), None);
}

#[tokio::test]
async fn cion_power_writes_enable_then_setpoint() {
    common_setup();

    let device = cion_device();
    device.set(100, &[0, 0]);
    let connection = connected(&device).await;
    let (mut cion, _rx) = cion(connection);
    cion.on_reachable_changed(true);
    cion.update().await.unwrap();
    assert!(!cion.is_powered());
    device.clear_log();

    cion.execute(Action::MaxChargingCurrent(12)).await.unwrap();
    assert!(device.writes().is_empty());

    cion.execute(Action::Power(true)).await.unwrap();
    cion.execute(Action::Power(false)).await.unwrap();
    assert_eq!(
        device.writes(),
        vec![(100, vec![1]), (101, vec![12]), (100, vec![0]), (101, vec![0])]
    );
}

#[tokio::test(start_paused = true)]
async fn cion_timeout_drops_the_link() {
    common_setup();

    let device = cion_device();
    device.delay_reads(Duration::from_secs(5));
    let connection = connected(&device).await;
    let (mut cion, _rx) = cion(connection.clone());
    cion.on_reachable_changed(true);

    assert_eq!(cion.update().await, Err(ThingError::HardwareFailure));
    assert!(!connection.is_reachable());
    assert_eq!(device.log().last(), Some(&Op::Disconnect));
}
