mod common;
use common::*;
use energy_bridge::channels::responder;
use energy_bridge::facade::Action;
use energy_bridge::host::{ChannelData as HostData, Family, StateValue};
use energy_bridge::network::StaticDiscovery;
use energy_bridge::plugin::{ChannelData, Plugin};
use energy_bridge::prelude::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Harness {
    channels: Channels,
    from_plugin: energy_bridge::host::Receiver,
    factory: MockFactory,
    monitor: Arc<MockMonitor>,
    plugin: JoinHandle<Result<()>>,
}

fn start(family: Family, yaml: &str) -> Harness {
    common_setup();

    let config = ConfigWrapper::from_config(serde_yaml::from_str(yaml).unwrap());
    let channels = Channels::new();
    let factory = MockFactory::default();
    let monitor = Arc::new(MockMonitor::default());
    let discovery = Arc::new(StaticDiscovery::new(&config.network()));

    let plugin = Plugin::new(
        family,
        &config,
        channels.clone(),
        Arc::new(factory.clone()),
        discovery,
        monitor.clone(),
    );

    Harness {
        from_plugin: channels.from_plugin.subscribe(),
        channels: channels.clone(),
        factory,
        monitor,
        plugin: tokio::spawn(plugin.start()),
    }
}

impl Harness {
    fn send(&self, data: ChannelData) {
        self.channels.to_plugin.send(data).unwrap();
    }

    async fn wait_for(&mut self, matches: impl Fn(&HostData) -> bool) -> HostData {
        let rx = &mut self.from_plugin;
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let data = rx.recv().await.unwrap();
                if matches(&data) {
                    return data;
                }
            }
        })
        .await
        .expect("plugin went quiet")
    }

    async fn stop(self) {
        self.send(ChannelData::Shutdown);
        self.plugin.await.unwrap().unwrap();
    }
}

fn roof(mac: Option<&str>) -> Thing {
    Thing {
        id: ThingId::new("sunspec/roof"),
        class: ThingClass::SunSpecConnection,
        name: "roof".to_string(),
        parent: None,
        params: ThingParams::SunSpecConnection {
            address: "10.0.0.2".to_string(),
            port: 502,
            slave_id: 1,
            mac: mac.map(str::to_string),
            base_register: 40000,
        },
    }
}

const GARAGE_MAC: &str = "00:27:02:aa:bb:cc";

fn garage(mac: Option<&str>) -> Thing {
    Thing {
        id: ThingId::new("ev11/garage"),
        class: ThingClass::Ev11,
        name: "garage".to_string(),
        parent: None,
        params: ThingParams::Ev11 {
            address: "10.0.0.7".to_string(),
            mac: mac.map(str::to_string),
            serial_number: None,
        },
    }
}

#[tokio::test]
async fn sunspec_connection_offers_and_polls_children() {
    let mut h = start(Family::SunSpec, "{}");
    let device = sunspec_device();
    // 5000 W, scale 0
    device.set(40084, &[5000, 0]);
    h.factory.add("sunspec/roof", device.clone());

    let parent = ThingId::new("sunspec/roof");
    h.send(ChannelData::SetupThing(roof(None), true));

    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(finished, HostData::SetupFinished(parent.clone(), Ok(())));

    let HostData::AutoThingsAppeared(offered) = h.wait_for(|m| matches!(m, HostData::AutoThingsAppeared(_))).await
    else {
        unreachable!()
    };
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].class, ThingClass::SunSpecThreePhaseInverter);
    assert_eq!(offered[0].title, "SE10K Three Phase Inverter");
    assert_eq!(offered[0].parent_id, Some(parent.clone()));
    assert_eq!(
        offered[0].params,
        ThingParams::SunSpecModel {
            model_id: 103,
            start: 40072,
            length: 50
        }
    );

    let child = ThingId::child(&parent, 103, 40072);
    h.send(ChannelData::SetupThing(offered[0].clone().into_thing(child.clone()), false));
    let finished = h
        .wait_for(|m| matches!(m, HostData::SetupFinished(id, _) if *id == child))
        .await;
    assert_eq!(finished, HostData::SetupFinished(child.clone(), Ok(())));

    h.send(ChannelData::PostSetup(parent.clone()));
    let state = h
        .wait_for(|m| matches!(m, HostData::StateChanged(id, "currentPower", _) if *id == child))
        .await;
    assert_eq!(state, HostData::StateChanged(child, "currentPower", StateValue::Double(5000.0)));

    h.stop().await;
    assert_eq!(device.log().last(), Some(&Op::Disconnect));
}

#[tokio::test]
async fn child_without_its_model_fails() {
    let mut h = start(Family::SunSpec, "{}");
    h.factory.add("sunspec/roof", sunspec_device());

    let parent = ThingId::new("sunspec/roof");
    h.send(ChannelData::SetupThing(roof(None), true));
    h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;

    let mut child = roof(None);
    child.id = ThingId::child(&parent, 203, 41000);
    child.class = ThingClass::SunSpecThreePhaseMeter;
    child.parent = Some(parent);
    child.params = ThingParams::SunSpecModel {
        model_id: 203,
        start: 41000,
        length: 105,
    };
    let id = child.id.clone();
    h.send(ChannelData::SetupThing(child, false));

    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(i, _) if *i == id)).await;
    assert_eq!(finished, HostData::SetupFinished(id, Err(ThingError::HardwareNotAvailable)));
    h.stop().await;
}

#[tokio::test]
async fn unreachable_device_fails_setup() {
    let mut h = start(Family::SunSpec, "{}");
    let device = sunspec_device();
    device.fail_connect(Some(TransactionError::TransportUnavailable("refused".to_string())));
    h.factory.add("sunspec/roof", device);

    h.send(ChannelData::SetupThing(roof(None), true));
    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(
        finished,
        HostData::SetupFinished(ThingId::new("sunspec/roof"), Err(ThingError::HardwareNotAvailable))
    );
    h.stop().await;
}

#[tokio::test]
async fn missing_marker_fails_setup() {
    let mut h = start(Family::SunSpec, "{}");
    h.factory.add("sunspec/roof", MockDevice::new());

    h.send(ChannelData::SetupThing(roof(None), true));
    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(
        finished,
        HostData::SetupFinished(ThingId::new("sunspec/roof"), Err(ThingError::HardwareFailure))
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn aborted_setup_stays_silent() {
    let mut h = start(Family::SunSpec, "sunspec:\n  timeout: 60000\n");
    let device = sunspec_device();
    device.delay_reads(Duration::from_secs(10));
    h.factory.add("sunspec/roof", device.clone());

    let id = ThingId::new("sunspec/roof");
    h.send(ChannelData::SetupThing(roof(None), true));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(device.log().contains(&Op::Read(40000, 2)));

    h.send(ChannelData::AbortSetup(id));
    tokio::time::sleep(Duration::from_secs(30)).await;

    let messages = drain(&mut h.from_plugin);
    assert!(!messages.iter().any(|m| matches!(m, HostData::SetupFinished(..))));
    assert!(!messages.iter().any(|m| matches!(m, HostData::AutoThingsAppeared(_))));
    assert_eq!(device.log().last(), Some(&Op::Disconnect));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn network_monitor_gates_reconnects() {
    let mut h = start(Family::SunSpec, "{}");
    let device = sunspec_device();
    h.factory.add("sunspec/roof", device.clone());

    h.send(ChannelData::SetupThing(roof(Some("aa:bb:cc:dd:ee:ff")), true));
    h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    let connects = || device.log().iter().filter(|op| **op == Op::Connect).count();
    assert_eq!(connects(), 1);

    h.monitor.set_reachable("aa:bb:cc:dd:ee:ff", false);
    h.wait_for(|m| matches!(m, HostData::StateChanged(_, "connected", StateValue::Bool(false))))
        .await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connects(), 1);

    h.monitor.set_reachable("aa:bb:cc:dd:ee:ff", true);
    h.wait_for(|m| matches!(m, HostData::StateChanged(_, "connected", StateValue::Bool(true))))
        .await;
    assert_eq!(connects(), 2);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wallbox_setup_waits_for_the_device_to_join_the_network() {
    let mut h = start(Family::PcElectric, "{}");
    let device = MockDevice::new();
    device.fail_connect(Some(TransactionError::TransportUnavailable("no route".to_string())));
    h.factory.add("ev11/garage", device.clone());
    h.monitor.set_reachable(GARAGE_MAC, false);

    let id = ThingId::new("ev11/garage");
    h.send(ChannelData::SetupThing(garage(Some(GARAGE_MAC)), true));
    tokio::time::sleep(Duration::from_secs(60)).await;

    let messages = drain(&mut h.from_plugin);
    assert!(!messages.iter().any(|m| matches!(m, HostData::SetupFinished(..))));
    assert!(!device.log().contains(&Op::Connect));

    device.fail_connect(None);
    h.monitor.set_reachable(GARAGE_MAC, true);
    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(finished, HostData::SetupFinished(id, Ok(())));
    assert_eq!(device.log().iter().filter(|op| **op == Op::Connect).count(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wallbox_setup_retries_while_the_device_boots() {
    let mut h = start(Family::PcElectric, "{}");
    let device = MockDevice::new();
    device.fail_connect(Some(TransactionError::TransportUnavailable("refused".to_string())));
    h.factory.add("ev11/garage", device.clone());

    let id = ThingId::new("ev11/garage");
    h.send(ChannelData::SetupThing(garage(Some(GARAGE_MAC)), true));
    tokio::time::sleep(Duration::from_secs(10)).await;

    let messages = drain(&mut h.from_plugin);
    assert!(!messages.iter().any(|m| matches!(m, HostData::SetupFinished(..))));
    assert!(device.log().iter().filter(|op| **op == Op::Connect).count() > 1);

    device.fail_connect(None);
    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(finished, HostData::SetupFinished(id, Ok(())));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wallbox_setup_gives_up_after_the_timeout() {
    let mut h = start(Family::PcElectric, "pcelectric:\n  setup_timeout: 30\n");
    let device = MockDevice::new();
    h.factory.add("ev11/garage", device.clone());
    h.monitor.set_reachable(GARAGE_MAC, false);

    h.send(ChannelData::SetupThing(garage(Some(GARAGE_MAC)), true));
    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(
        finished,
        HostData::SetupFinished(ThingId::new("ev11/garage"), Err(ThingError::HardwareNotAvailable))
    );
    assert!(!device.log().contains(&Op::Connect));
    h.stop().await;
}

#[tokio::test]
async fn wallbox_actions_reach_the_device() {
    let mut h = start(Family::PcElectric, "{}");
    let device = MockDevice::new();
    h.factory.add("ev11/garage", device.clone());

    let id = ThingId::new("ev11/garage");
    h.send(ChannelData::SetupThing(garage(None), true));
    let finished = h.wait_for(|m| matches!(m, HostData::SetupFinished(..))).await;
    assert_eq!(finished, HostData::SetupFinished(id.clone(), Ok(())));

    let (tx, rx) = responder();
    h.send(ChannelData::ExecuteAction(id.clone(), Action::MaxChargingCurrent(16), tx));
    assert_eq!(rx.await.unwrap(), Ok(()));

    let (tx, rx) = responder();
    h.send(ChannelData::ExecuteAction(id.clone(), Action::Power(true), tx));
    assert_eq!(rx.await.unwrap(), Ok(()));
    assert!(device.writes().contains(&(301, vec![48768])));

    let finished = h.wait_for(|m| matches!(m, HostData::ActionFinished(..))).await;
    assert_eq!(finished, HostData::ActionFinished(id.clone(), Ok(())));

    // other families leave the thing alone
    let (tx, rx) = responder();
    h.send(ChannelData::ExecuteAction(ThingId::new("cion/carport"), Action::Power(true), tx));
    h.send(ChannelData::ThingRemoved(id));
    h.stop().await;
    assert!(rx.await.is_err());
    assert_eq!(device.log().last(), Some(&Op::Disconnect));
}

#[tokio::test]
async fn discovery_finds_wallboxes_on_the_network() {
    let h = start(
        Family::PcElectric,
        "network:\n  devices:\n    - address: 10.0.0.7\n      mac: aa:bb:cc:00:11:22\n    - address: 10.0.0.8\n      mac: aa:bb:cc:00:11:33\n",
    );
    let device = MockDevice::new();
    device.set_ascii(100, "EV11-0042", 8);
    device.set_ascii(108, "1.2.3", 4);
    h.factory.add("discovery/10.0.0.7", device);

    let (tx, rx) = responder();
    h.send(ChannelData::DiscoverThings(ThingClass::Ev11, tx));
    let found = rx.await.unwrap().unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].title, "PCE EV11.3 (EV11-0042)");
    assert_eq!(found[0].description, "Version: 1.2.3 - 10.0.0.7");
    assert_eq!(
        found[0].params,
        ThingParams::Ev11 {
            address: "10.0.0.7".to_string(),
            mac: Some("aa:bb:cc:00:11:22".to_string()),
            serial_number: Some("EV11-0042".to_string()),
        }
    );
    h.stop().await;
}

#[tokio::test]
async fn sunspec_discovery_lists_the_network_without_connecting() {
    let h = start(
        Family::SunSpec,
        "network:\n  devices:\n    - address: 10.0.0.2\n      mac: 84:d6:c5:00:00:01\n      manufacturer: SolarEdge Technologies\n    - address: 10.0.0.3\n      mac: 00:03:ac:00:00:02\n      hostname: fronius\n",
    );

    let (tx, rx) = responder();
    h.send(ChannelData::DiscoverThings(ThingClass::SolarEdgeConnection, tx));
    let found = rx.await.unwrap().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].class, ThingClass::SolarEdgeConnection);
    assert_eq!(found[0].title, "SolarEdge (10.0.0.2)");

    let (tx, rx) = responder();
    h.send(ChannelData::DiscoverThings(ThingClass::SunSpecConnection, tx));
    let found = rx.await.unwrap().unwrap();
    let titles: Vec<&str> = found.iter().map(|d| d.title.as_str()).collect();
    assert_eq!(titles, ["10.0.0.2", "10.0.0.3 (fronius)"]);
    assert_eq!(found[1].description, "00:03:ac:00:00:02");
    h.stop().await;
}

#[tokio::test]
async fn serial_wallboxes_cannot_be_discovered() {
    let h = start(Family::Schrack, "{}");

    let (tx, rx) = responder();
    h.send(ChannelData::DiscoverThings(ThingClass::Cion, tx));
    assert_eq!(rx.await.unwrap(), Err(ThingError::UnsupportedFeature));
    h.stop().await;
}
