mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Faults, LoopbackDiscovery, ReplyFault, SharedDevice};
use secrecy::SecretString;
use sensorlink::{
    HandshakeError, LinkRepository, ProvisionError, Provisioner, ProvisioningDevice,
    ProvisioningStatus, WiFiCredentials, WifiStationState,
};
use sensorlink_device::{DeviceResponder, SimulatedWifi};
use sensorlink_proto::endpoints;
use sensorlink_proto::version::CAP_WIFI_SCAN;

type TestProvisioner = Provisioner<LinkRepository<LoopbackDiscovery>>;

fn provisioner(device: SharedDevice) -> (TestProvisioner, Faults) {
    let discovery = LoopbackDiscovery::new(device);
    let faults = discovery.faults.clone();
    let config = common::config();
    (
        Provisioner::new(LinkRepository::new(discovery, config.clone()), config),
        faults,
    )
}

fn pop(text: &str) -> SecretString {
    SecretString::from(text.to_string())
}

async fn secured(device: SharedDevice) -> (TestProvisioner, Faults) {
    let (mut provisioner, faults) = provisioner(device);
    provisioner.connect(&common::descriptor()).await.unwrap();
    provisioner.query_version().await.unwrap();
    provisioner
        .establish_secure_session(&pop(common::POP))
        .await
        .unwrap();
    (provisioner, faults)
}

#[tokio::test]
async fn provisions_device_end_to_end() {
    let device = common::device();
    let (mut provisioner, _) = provisioner(device.clone());

    let found = provisioner.scan(None).await.unwrap().collect().await;
    assert_eq!(found, vec![common::descriptor()]);

    provisioner.connect(&found[0]).await.unwrap();
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);

    let version = provisioner.query_version().await.unwrap();
    assert!(version.has_capability(CAP_WIFI_SCAN));
    assert_eq!(provisioner.session().unwrap().version(), Some("v1.1"));

    provisioner
        .establish_secure_session(&pop(common::POP))
        .await
        .unwrap();
    assert!(provisioner.session().unwrap().is_secure());
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);

    // five networks arrive over two pages, strongest first
    let networks = provisioner.scan_wifi().await.unwrap();
    let ssids: Vec<_> = networks.iter().map(|n| n.ssid.as_str()).collect();
    assert_eq!(ssids, ["HomeNet", "Office", "Cafe", "Garage", "Attic"]);
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);

    provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap();
    assert_eq!(provisioner.status(), ProvisioningStatus::ConfigApplied);

    // the simulated station reports Connecting twice before joining
    assert_eq!(
        provisioner.get_status().await.unwrap(),
        ProvisioningStatus::ConfigApplied
    );
    assert_eq!(
        provisioner.wait_for_completion().await.unwrap(),
        ProvisioningStatus::Success
    );
    assert_eq!(device.lock().unwrap().wifi().connect_attempts(), 1);

    provisioner.disconnect().await;
    assert_eq!(provisioner.status(), ProvisioningStatus::Idle);
    assert!(provisioner.session().is_none());
}

#[tokio::test]
async fn wrong_pop_fails_without_a_session_key() {
    let device = common::device();
    let (mut provisioner, _) = provisioner(device.clone());
    provisioner.connect(&common::descriptor()).await.unwrap();

    let err = provisioner
        .establish_secure_session(&pop("not-the-pop"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Handshake(HandshakeError::Rejected)));
    assert_eq!(provisioner.status(), ProvisioningStatus::Failed);

    let session = provisioner.session().unwrap();
    assert!(session.session_key().is_none());
    assert!(!device.lock().unwrap().is_secure());

    // the message never carries the proof of possession
    assert!(!err.to_string().contains("not-the-pop"));
    assert!(!provisioner.last_error().unwrap().contains("not-the-pop"));
}

#[tokio::test]
async fn recoverable_send_failures_are_retried() {
    let (mut provisioner, faults) = provisioner(common::device());
    provisioner.connect(&common::descriptor()).await.unwrap();

    faults.fail_next_sends(2);
    provisioner
        .establish_secure_session(&pop(common::POP))
        .await
        .unwrap();
    // two rejected writes, then both handshake rounds
    assert_eq!(faults.sends(), 4);
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
}

#[tokio::test]
async fn retries_stop_at_the_configured_limit() {
    let (mut provisioner, faults) = secured(common::device()).await;
    let max_retries = provisioner.config().max_retries;

    faults.fail_next_sends(u32::MAX);
    let before = faults.sends();
    let err = provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap_err();

    match err {
        ProvisionError::RetriesExhausted {
            operation,
            attempts,
            ..
        } => {
            assert_eq!(operation, "send wifi config");
            assert_eq!(attempts, max_retries + 1);
        }
        other => panic!("expected exhausted retries, got {other}"),
    }
    assert_eq!(faults.sends() - before, max_retries + 1);
    assert_eq!(provisioner.status(), ProvisioningStatus::Failed);
}

#[tokio::test]
async fn tampered_response_aborts_the_step() {
    let (mut provisioner, faults) = secured(common::device()).await;

    faults
        .corrupt_replies
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let before = faults.sends();
    let err = provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Protocol { .. }));
    // not retried
    assert_eq!(faults.sends() - before, 1);
    assert_eq!(provisioner.status(), ProvisioningStatus::Failed);
}

#[tokio::test]
async fn wrong_wifi_password_ends_in_failed() {
    let (mut provisioner, _) = secured(common::device()).await;

    provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "letmein"))
        .await
        .unwrap();
    assert_eq!(
        provisioner.wait_for_completion().await.unwrap(),
        ProvisioningStatus::Failed
    );
    assert!(provisioner.last_error().unwrap().contains("AuthError"));
}

#[tokio::test]
async fn idle_only_reaches_connected() {
    let (mut provisioner, _) = provisioner(common::device());

    let refused = [
        provisioner
            .establish_secure_session(&pop(common::POP))
            .await
            .unwrap_err(),
        provisioner
            .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
            .await
            .unwrap_err(),
        provisioner.get_status().await.unwrap_err(),
        provisioner.scan_wifi().await.unwrap_err(),
    ];
    for err in refused {
        assert!(matches!(err, ProvisionError::InvalidState { .. }), "{err}");
        assert_eq!(provisioner.status(), ProvisioningStatus::Idle);
    }

    provisioner.connect(&common::descriptor()).await.unwrap();
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
}

#[tokio::test]
async fn failed_connect_stays_idle() {
    let (mut provisioner, faults) = provisioner(common::device());

    let stranger = ProvisioningDevice {
        name: "PROV_OTHER".to_string(),
        ..common::descriptor()
    };
    assert!(provisioner.connect(&stranger).await.is_err());
    assert_eq!(provisioner.status(), ProvisioningStatus::Idle);

    faults
        .unreachable
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = provisioner.connect(&common::descriptor()).await.unwrap_err();
    // a missing service is fatal, so no retries
    assert!(matches!(err, ProvisionError::Transport(_)));
    assert_eq!(provisioner.status(), ProvisioningStatus::Idle);
    assert!(provisioner.last_error().is_some());
}

#[tokio::test]
async fn terminal_states_need_a_fresh_connect() {
    let (mut provisioner, _) = secured(common::device()).await;
    provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap();
    provisioner.wait_for_completion().await.unwrap();
    assert_eq!(provisioner.status(), ProvisioningStatus::Success);

    assert!(matches!(
        provisioner.scan_wifi().await,
        Err(ProvisionError::InvalidState { .. })
    ));
    assert!(matches!(
        provisioner
            .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
            .await,
        Err(ProvisionError::InvalidState { .. })
    ));
    assert_eq!(provisioner.status(), ProvisioningStatus::Success);

    // connecting again starts over with a keyless session
    provisioner.connect(&common::descriptor()).await.unwrap();
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
    assert!(!provisioner.session().unwrap().is_secure());
}

#[tokio::test]
async fn encrypted_calls_need_a_session() {
    let (mut provisioner, _) = provisioner(common::device());
    provisioner.connect(&common::descriptor()).await.unwrap();

    assert!(matches!(
        provisioner.scan_wifi().await,
        Err(ProvisionError::NotSecure)
    ));
    assert!(matches!(
        provisioner
            .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
            .await,
        Err(ProvisionError::NotSecure)
    ));
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
}

#[tokio::test]
async fn invalid_credentials_are_refused_locally() {
    let (mut provisioner, faults) = secured(common::device()).await;
    let before = faults.sends();

    let err = provisioner
        .provision_wifi(WiFiCredentials::new("", "hunter22"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidCredentials(_)));
    assert_eq!(faults.sends(), before);
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
}

#[tokio::test]
async fn custom_data_follows_capabilities() {
    let plain = common::device();
    let (mut provisioner, _) = secured(plain).await;
    assert!(matches!(
        provisioner.send_custom_data(b"site=7").await,
        Err(ProvisionError::Unsupported(_))
    ));
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);

    let echo: SharedDevice = Arc::new(Mutex::new(
        DeviceResponder::new(common::POP.as_bytes(), SimulatedWifi::new())
            .with_custom_data(Box::new(|data| [b"ack:".as_slice(), data].concat())),
    ));
    let (mut provisioner, _) = secured(echo).await;
    assert_eq!(
        provisioner.send_custom_data(b"site=7").await.unwrap(),
        b"ack:site=7"
    );
}

#[tokio::test]
async fn provision_runs_the_whole_flow_and_disconnects() {
    let device = common::device();
    let (mut provisioner, _) = provisioner(device.clone());

    let status = provisioner
        .provision(
            &common::descriptor(),
            &pop(common::POP),
            WiFiCredentials::new("HomeNet", "hunter22"),
        )
        .await
        .unwrap();
    assert_eq!(status, ProvisioningStatus::Success);
    assert_eq!(provisioner.status(), ProvisioningStatus::Idle);
    assert!(provisioner.session().is_none());
}

/// A reply that turns up only after the request has timed out
fn late() -> ReplyFault {
    ReplyFault::Late(common::config().timeouts.operation_timeout + Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn handshake_survives_a_late_reply() {
    for fault in [late(), ReplyFault::Lost] {
        let device = common::device();
        let (mut provisioner, faults) = provisioner(device.clone());
        provisioner.connect(&common::descriptor()).await.unwrap();

        faults.fault_next_reply(endpoints::SESSION, fault);
        provisioner
            .establish_secure_session(&pop(common::POP))
            .await
            .unwrap();
        // the unanswered start, then a fresh start and verify
        assert_eq!(faults.sends(), 3, "{fault:?}");
        assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
        assert!(device.lock().unwrap().is_secure());

        // both ends hold the same key
        assert_eq!(provisioner.scan_wifi().await.unwrap().len(), 5);
    }
}

#[tokio::test(start_paused = true)]
async fn late_config_ack_is_retried() {
    let (mut provisioner, faults) = secured(common::device()).await;

    faults.fault_next_reply(endpoints::CONFIG, late());
    let before = faults.sends();
    provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap();
    // config twice, then apply
    assert_eq!(faults.sends() - before, 3);
    assert_eq!(provisioner.status(), ProvisioningStatus::ConfigApplied);
    assert_eq!(
        provisioner.wait_for_completion().await.unwrap(),
        ProvisioningStatus::Success
    );
}

#[tokio::test(start_paused = true)]
async fn missing_apply_ack_is_retried_without_rejoining() {
    for fault in [ReplyFault::Lost, late()] {
        let device = common::device();
        let (mut provisioner, faults) = secured(device.clone()).await;

        faults.fault_next_reply(endpoints::APPLY, fault);
        provisioner
            .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
            .await
            .unwrap();
        assert_eq!(provisioner.status(), ProvisioningStatus::ConfigApplied);
        assert_eq!(
            provisioner.wait_for_completion().await.unwrap(),
            ProvisioningStatus::Success,
            "{fault:?}"
        );
        assert_eq!(device.lock().unwrap().wifi().connect_attempts(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn late_status_reply_is_retried() {
    let (mut provisioner, faults) = secured(common::device()).await;
    provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap();

    faults.fault_next_reply(endpoints::CONFIG, late());
    let before = faults.sends();
    assert_eq!(
        provisioner.get_status().await.unwrap(),
        ProvisioningStatus::ConfigApplied
    );
    assert_eq!(faults.sends() - before, 2);
    assert_eq!(
        provisioner.wait_for_completion().await.unwrap(),
        ProvisioningStatus::Success
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_requests_exhaust_retries() {
    let (mut provisioner, faults) = secured(common::device()).await;
    let max_retries = provisioner.config().max_retries;
    for _ in 0..=max_retries {
        faults.fault_next_reply(endpoints::CONFIG, ReplyFault::Lost);
    }

    let err = provisioner
        .provision_wifi(WiFiCredentials::new("HomeNet", "hunter22"))
        .await
        .unwrap_err();
    match err {
        ProvisionError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, max_retries + 1);
            assert!(last.to_string().contains("timed out"), "{last}");
        }
        other => panic!("expected exhausted retries, got {other}"),
    }
    assert_eq!(provisioner.status(), ProvisioningStatus::Failed);
}

#[tokio::test]
async fn status_before_apply_leaves_state_alone() {
    let (mut provisioner, _) = provisioner(common::device());
    provisioner
        .provision(
            &common::descriptor(),
            &pop(common::POP),
            WiFiCredentials::new("HomeNet", "hunter22"),
        )
        .await
        .unwrap();

    // a later session with the device that already joined
    provisioner.connect(&common::descriptor()).await.unwrap();
    provisioner
        .establish_secure_session(&pop(common::POP))
        .await
        .unwrap();
    assert_eq!(
        provisioner.get_status().await.unwrap(),
        ProvisioningStatus::Connected
    );
    let report = provisioner.station_status().await.unwrap();
    assert_eq!(report.state, WifiStationState::Connected);
    assert_eq!(provisioner.status(), ProvisioningStatus::Connected);
}
