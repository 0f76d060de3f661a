mod common;
use common::*;
use energy_bridge::prelude::*;
use energy_bridge::sunspec::discovery::{discover, Walker, WalkerState};
use energy_bridge::sunspec::models::ModelId;

use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn walks_the_model_chain() {
    common_setup();

    let device = sunspec_device();
    let connection = connected(&device).await;

    let result = discover(&connection, 40000, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.base_register, 40000);
    let starts: Vec<(ModelId, u16, u16)> = result.models.iter().map(|m| (m.id, m.start, m.length)).collect();
    assert_eq!(
        starts,
        vec![(ModelId::Common, 40004, 66), (ModelId::InverterThreePhase, 40072, 50)]
    );
    assert_eq!(result.common.manufacturer, "SolarEdge");
    assert_eq!(result.common.model, "SE10K");
    assert_eq!(result.common.version, "4.12");
    assert_eq!(result.common.serial_number, "7F123456");
    assert_eq!(result.models[1].parent, *connection.id());

    // nothing past the end marker is read
    for op in device.transactions() {
        if let Op::Read(start, count) = op {
            assert!(u32::from(start) + u32::from(count) - 1 <= 40123, "read {}+{}", start, count);
        }
    }
}

#[tokio::test]
async fn falls_back_to_the_alternate_base() {
    common_setup();

    let device = MockDevice::new();
    device.missing(40000..40002);
    device.set(50000, &[0x5375, 0x6e53]);
    device.set(50002, &[1, 66]);
    device.set(50070, &[0xFFFF, 0]);
    let connection = connected(&device).await;

    let result = discover(&connection, 40000, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.base_register, 50000);
    assert_eq!(result.models.len(), 1);
    assert_eq!(result.models[0].start, 50004);
}

#[tokio::test]
async fn custom_base_is_the_only_candidate() {
    common_setup();

    let device = MockDevice::new();
    device.set(50000, &[0x5375, 0x6e53]);
    let connection = connected(&device).await;

    let error = discover(&connection, 1000, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(error, DiscoveryError::NoSunSpecMarkerFound(1000));
    assert_eq!(device.transactions(), vec![Op::Read(1000, 2)]);
}

#[tokio::test]
async fn unknown_and_short_models_are_skipped() {
    common_setup();

    let device = MockDevice::new();
    device.set(40000, &[0x5375, 0x6e53]);
    device.set(40002, &[1, 66]);
    // vendor model, then an inverter too short for its fields
    device.set(40070, &[64110, 10]);
    device.set(40082, &[103, 20]);
    device.set(40104, &[124, 24]);
    device.set(40130, &[0xFFFF, 0]);
    let connection = connected(&device).await;

    let result = discover(&connection, 40000, &CancellationToken::new()).await.unwrap();
    let ids: Vec<ModelId> = result.models.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![ModelId::Common, ModelId::Storage]);
    assert_eq!(result.models[1].start, 40106);
}

#[tokio::test]
async fn header_running_off_the_register_space() {
    common_setup();

    let device = MockDevice::new();
    device.set(65000, &[0x5375, 0x6e53]);
    device.set(65002, &[103, 1000]);
    let connection = connected(&device).await;

    let error = discover(&connection, 65000, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(
        error,
        DiscoveryError::HeaderOutOfRange {
            address: 65002,
            id: 103,
            length: 1000
        }
    );
}

#[tokio::test]
async fn cancelled_walk_stops() {
    common_setup();

    let device = sunspec_device();
    let connection = connected(&device).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut walker = Walker::new(&connection, 40000);
    assert_eq!(walker.run(&cancel).await.unwrap_err(), DiscoveryError::Cancelled);
    assert_eq!(walker.state(), WalkerState::Failed);
    assert!(device.transactions().is_empty());
}

#[tokio::test]
async fn unreachable_connection_fails_without_traffic() {
    common_setup();

    let device = sunspec_device();
    let (connection, _) = connection(&device);

    let error = discover(&connection, 40000, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(error, DiscoveryError::Transaction(TransactionError::NotConnected));
    assert!(device.log().is_empty());
}
