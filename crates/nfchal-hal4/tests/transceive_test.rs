//! Integration tests for connections, exchanges and disconnects.

mod common;

use common::{
    Harness, assert_pending, completion, felica, iso_dep_a, nfc_dep_target, outcome, poll_a,
    remote_initiator, ultralight,
};
use nfchal_core::{DeviceKind, HalError, ReleaseType, RfProtocol};
use nfchal_hal4::{
    ControllerState, DefaultEvent, P2pNotification, TransceiveRequest, TransceiveStatus,
};
use nfchal_transport::{
    Command, DeactivationKind, Opcode, TransportError, TransportEvent,
};
use rstest::rstest;

const RF: u8 = 0x00;

#[test]
fn test_connect_to_activated_device_is_simulated() {
    let mut h = Harness::open();
    let devices = h.discover(iso_dep_a(1));
    let before = h.mock.commands().len();

    let (tx, mut rx) = completion();
    h.hal.connect(devices[0].handle, tx).unwrap();
    assert_eq!(h.hal.next_state(), Some(ControllerState::TargetConnected));
    assert_pending(&mut rx);
    h.hal.run_deferred();

    let device = outcome(&mut rx).unwrap();
    assert!(device.session_open);
    assert_eq!(h.mock.commands().len(), before);
    assert_eq!(h.hal.current_state(), ControllerState::TargetConnected);
    assert_eq!(h.hal.connected_device().map(|d| d.handle), Some(device.handle));
}

#[test]
fn test_connect_to_other_protocol_activates_target() {
    let mut h = Harness::open();
    h.start_discovery();
    h.activate(poll_a(3, RfProtocol::IsoDep, 0x28, vec![0x08, 0x01, 0x02, 0x03]));
    let devices = h.next_round();
    let mifare = devices
        .iter()
        .find(|d| d.kind() == DeviceKind::Mifare)
        .unwrap()
        .handle;

    let (tx, mut rx) = completion();
    h.hal.connect(mifare, tx).unwrap();
    assert_eq!(
        h.last_command(),
        Some(Command::ActivateTarget {
            discovery_id: 3,
            protocol: RfProtocol::Mifare
        })
    );
    assert_pending(&mut rx);

    h.complete(Opcode::ActivateTarget);
    assert_eq!(outcome(&mut rx).unwrap().handle, mifare);
    // The other protocols stay candidates.
    assert_eq!(h.hal.candidates().len(), 2);
}

#[test]
fn test_failed_activation_keeps_the_round() {
    let mut h = Harness::open();
    h.start_discovery();
    h.activate(poll_a(3, RfProtocol::IsoDep, 0x28, vec![0x08, 0x01, 0x02, 0x03]));
    let mifare = h.next_round()[1].handle;

    let (tx, mut rx) = completion();
    h.hal.connect(mifare, tx).unwrap();
    h.fail(Opcode::ActivateTarget, TransportError::TargetActivationFailed);

    assert_eq!(outcome(&mut rx), Err(HalError::TargetActivationFailed));
    assert_eq!(h.hal.current_state(), ControllerState::TargetDiscovered);
    assert_eq!(h.hal.candidates().len(), 3);
}

#[test]
fn test_connect_rejects_unknown_handle() {
    let mut h = Harness::open();
    let devices = h.discover(iso_dep_a(1));
    let (tx, _rx) = completion();
    let bogus = nfchal_core::DeviceHandle::new(devices[0].handle.as_u32() + 100);
    assert_eq!(h.hal.connect(bogus, tx), Err(HalError::InvalidRemoteDevice));
}

#[test]
fn test_reconnect_is_idempotent() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));
    let before = h.mock.commands().len();

    let again = h.connect(device.handle);
    assert_eq!(again.handle, device.handle);
    assert_eq!(h.mock.commands().len(), before);
}

#[test]
fn test_iso_dep_transceive_is_raw() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00, 0xA4, 0x04, 0x00], 256), tx)
        .unwrap();
    let packet = h.mock.last_data().unwrap();
    assert_eq!(packet.conn_id, RF);
    assert_eq!(packet.payload, vec![0x00, 0xA4, 0x04, 0x00]);
    assert_eq!(h.hal.current_state(), ControllerState::TargetConnected);
    assert_eq!(h.armed_timers(), 1);

    h.receive(RF, vec![0x90, 0x00], false);
    let response = outcome(&mut rx).unwrap();
    assert_eq!(response.data, vec![0x90, 0x00]);
    assert_eq!(response.status, TransceiveStatus::Complete);
    assert_eq!(h.armed_timers(), 0);
}

#[test]
fn test_memory_tag_frame_and_status_trailer() {
    let mut h = Harness::open();
    let device = h.connected(ultralight(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::memory(0x30, 0x04, Vec::new(), 16), tx)
        .unwrap();
    assert_eq!(h.mock.last_data().unwrap().payload, vec![0x30, 0x04]);

    let mut page = vec![0xAB; 16];
    page.push(0x00);
    h.receive(RF, page, false);
    assert_eq!(outcome(&mut rx).unwrap().data, vec![0xAB; 16]);
}

#[test]
fn test_felica_length_byte_is_added_and_stripped() {
    let mut h = Harness::open();
    let device = h.connected(felica(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x06, 0x01], 64), tx)
        .unwrap();
    assert_eq!(h.mock.last_data().unwrap().payload, vec![0x03, 0x06, 0x01]);

    h.receive(RF, vec![0x04, 0x07, 0xAA, 0xBB, 0x00], false);
    assert_eq!(outcome(&mut rx).unwrap().data, vec![0x07, 0xAA, 0xBB]);
}

#[test]
fn test_chained_response_is_reassembled() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00, 0xB0], 256), tx)
        .unwrap();
    h.receive(RF, vec![0x01, 0x02], true);
    assert_pending(&mut rx);
    h.receive(RF, vec![0x03, 0x90, 0x00], false);

    assert_eq!(outcome(&mut rx).unwrap().data, vec![0x01, 0x02, 0x03, 0x90, 0x00]);
}

#[test]
fn test_oversized_response_is_served_in_pieces() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00, 0xB0], 4), tx)
        .unwrap();
    h.receive(RF, (0u8..10).collect(), false);
    let first = outcome(&mut rx).unwrap();
    assert_eq!(first.data, vec![0, 1, 2, 3]);
    assert_eq!(first.status, TransceiveStatus::MoreInformation);
    assert_eq!(h.hal.surplus_len(), 6);

    let sent = h.mock.data_packets().len();
    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::drain(4), tx)
        .unwrap();
    h.hal.run_deferred();
    let second = outcome(&mut rx).unwrap();
    assert_eq!(second.data, vec![4, 5, 6, 7]);
    assert_eq!(second.status, TransceiveStatus::MoreInformation);

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::drain(4), tx)
        .unwrap();
    h.hal.run_deferred();
    let last = outcome(&mut rx).unwrap();
    assert_eq!(last.data, vec![8, 9]);
    assert_eq!(last.status, TransceiveStatus::Complete);
    assert_eq!(h.mock.data_packets().len(), sent);
}

#[test]
fn test_corrupted_frame_is_dropped() {
    let mut h = Harness::open();
    let device = h.connected(ultralight(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::memory(0x30, 0x00, Vec::new(), 16), tx)
        .unwrap();
    h.receive(RF, vec![0xFF, 0xFF, 0x02], false);
    assert_pending(&mut rx);

    h.receive(RF, vec![0x11, 0x22, 0x00], false);
    assert_eq!(outcome(&mut rx).unwrap().data, vec![0x11, 0x22]);
}

#[test]
fn test_bad_frame_status_fails_exchange() {
    let mut h = Harness::open();
    let device = h.connected(ultralight(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::memory(0x30, 0x00, Vec::new(), 16), tx)
        .unwrap();
    h.receive(RF, vec![0x11, 0x09], false);

    assert_eq!(outcome(&mut rx), Err(HalError::RfError));
    assert_eq!(h.hal.next_state(), None);
}

#[test]
fn test_second_exchange_is_busy() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, _rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00], 16), tx)
        .unwrap();
    let (tx2, _rx2) = completion();
    assert_eq!(
        h.hal
            .transceive(device.handle, TransceiveRequest::raw(vec![0x00], 16), tx2),
        Err(HalError::Busy)
    );
}

#[test]
fn test_transceive_argument_checks() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, _rx) = completion();
    assert!(matches!(
        h.hal
            .transceive(device.handle, TransceiveRequest::raw(vec![0x00], 0), tx),
        Err(HalError::InvalidParameter(_))
    ));
    let (tx, _rx) = completion();
    assert!(matches!(
        h.hal.transceive(device.handle, TransceiveRequest::drain(16), tx),
        Err(HalError::InvalidParameter(_))
    ));
    assert_eq!(h.hal.next_state(), None);
}

#[test]
fn test_exchange_timeout_reports_rf_timeout() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00, 0xB0], 16), tx)
        .unwrap();
    h.expire_timer();

    assert_eq!(outcome(&mut rx), Err(HalError::RfTimeout));
    assert_eq!(h.hal.current_state(), ControllerState::TargetConnected);
    assert_eq!(h.hal.next_state(), None);

    // A late response after the timeout goes nowhere.
    h.receive(RF, vec![0x90, 0x00], false);
    assert!(h.hal.connected_device().is_some());
}

#[test]
fn test_disconnect_after_exchange_timeout() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00, 0xB0], 16), tx)
        .unwrap();
    h.expire_timer();
    assert_eq!(outcome(&mut rx), Err(HalError::RfTimeout));
    assert!(rx.try_recv().is_err());

    let (tx, mut rx) = completion();
    h.hal
        .disconnect(device.handle, ReleaseType::Release, tx)
        .unwrap();
    assert_eq!(
        h.last_command(),
        Some(Command::Deactivate(DeactivationKind::Idle))
    );
    h.complete(Opcode::Deactivate);

    assert_eq!(outcome(&mut rx), Ok(()));
    assert!(h.hal.connected_device().is_none());
    assert!(h.hal.candidates().is_empty());
    assert_eq!(h.hal.current_state(), ControllerState::OpenAndReady);
}

#[test]
fn test_p2p_target_exchange_is_fragmented() {
    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(nfc_dep_target(1, 64));

    let payload: Vec<u8> = (0..150).map(|i| i as u8).collect();
    let (tx, mut rx) = completion();
    h.hal
        .transceive(peer.handle, TransceiveRequest::raw(payload.clone(), 512), tx)
        .unwrap();
    let first = h.mock.last_data().unwrap();
    assert_eq!(first.payload.len(), 64);
    assert!(first.more);

    h.data_sent(RF);
    h.data_sent(RF);
    let packets = h.mock.data_packets();
    let last = packets.last().unwrap();
    assert_eq!(packets.len(), 3);
    assert_eq!(last.payload.len(), 22);
    assert!(!last.more);
    let sent: Vec<u8> = packets.iter().flat_map(|p| p.payload.clone()).collect();
    assert_eq!(sent, payload);

    h.data_sent(RF);
    assert_pending(&mut rx);
    h.receive(RF, vec![0xD5, 0x07], true);
    h.receive(RF, vec![0x00], false);
    assert_eq!(outcome(&mut rx).unwrap().data, vec![0xD5, 0x07, 0x00]);
}

#[test]
fn test_p2p_target_without_negotiated_length_uses_default() {
    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(nfc_dep_target(1, 0));
    assert_eq!(peer.info.max_frame_len(), Some(0));

    let (tx, _rx) = completion();
    h.hal
        .transceive(peer.handle, TransceiveRequest::raw(vec![0x55; 300], 16), tx)
        .unwrap();
    assert_eq!(
        h.mock.last_data().unwrap().payload.len(),
        h.hal.config().p2p_max_frame_len
    );
}

#[test]
fn test_p2p_initiator_send_and_receive() {
    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(remote_initiator(1, 128));
    assert_eq!(peer.kind(), DeviceKind::P2pInitiator);

    let (tx, mut rx) = completion();
    h.hal.send(peer.handle, vec![0x01; 200], tx).unwrap();
    assert_eq!(h.mock.last_data().unwrap().payload.len(), 128);
    h.data_sent(RF);
    assert_eq!(h.mock.last_data().unwrap().payload.len(), 72);
    assert_pending(&mut rx);
    h.data_sent(RF);
    assert_eq!(outcome(&mut rx), Ok(()));

    let (tx, mut rx) = completion();
    h.hal.receive(peer.handle, tx).unwrap();
    assert_eq!(h.armed_timers(), 1);
    h.receive(RF, vec![0xAA], true);
    h.receive(RF, vec![0xBB], false);
    assert_eq!(outcome(&mut rx), Ok(vec![0xAA, 0xBB]));
    assert_eq!(h.armed_timers(), 0);
}

#[test]
fn test_p2p_initiator_messages_are_queued() {
    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(remote_initiator(1, 0));

    h.receive(RF, vec![0x01], false);
    h.receive(RF, vec![0x02], false);

    for expected in [vec![0x01], vec![0x02]] {
        let (tx, mut rx) = completion();
        h.hal.receive(peer.handle, tx).unwrap();
        h.hal.run_deferred();
        assert_eq!(outcome(&mut rx), Ok(expected));
    }
}

#[test]
fn test_send_and_transceive_are_peer_specific() {
    let mut h = Harness::open();
    let tag = h.connected(iso_dep_a(1));
    let (tx, _rx) = completion();
    assert!(matches!(
        h.hal.send(tag.handle, vec![0x01], tx),
        Err(HalError::FeatureNotSupported(_))
    ));

    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(remote_initiator(1, 0));
    let (tx, _rx) = completion();
    assert!(matches!(
        h.hal
            .transceive(peer.handle, TransceiveRequest::raw(vec![0x01], 16), tx),
        Err(HalError::FeatureNotSupported(_))
    ));
}

#[test]
fn test_disconnect_during_send_waits_for_the_send() {
    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(remote_initiator(1, 0));

    let (send_tx, mut send_rx) = completion();
    h.hal.send(peer.handle, vec![0x01; 4], send_tx).unwrap();
    let (tx, mut rx) = completion();
    h.hal
        .disconnect(peer.handle, ReleaseType::Release, tx)
        .unwrap();
    assert_pending(&mut rx);
    let (tx2, _rx2) = completion();
    assert_eq!(
        h.hal.disconnect(peer.handle, ReleaseType::Release, tx2),
        Err(HalError::Busy)
    );

    h.data_sent(RF);
    assert_eq!(outcome(&mut send_rx), Ok(()));
    assert_eq!(
        h.last_command(),
        Some(Command::Deactivate(DeactivationKind::Idle))
    );
    assert_pending(&mut rx);

    h.complete(Opcode::Deactivate);
    assert_eq!(outcome(&mut rx), Ok(()));
    assert_eq!(h.hal.current_state(), ControllerState::OpenAndReady);
}

#[test]
fn test_deferred_disconnect_completes_when_peer_leaves() {
    let mut h = Harness::open().with_p2p_listener();
    let peer = h.connected_peer(remote_initiator(1, 0));

    let (send_tx, mut send_rx) = completion();
    h.hal.send(peer.handle, vec![0x01; 4], send_tx).unwrap();
    let (tx, mut rx) = completion();
    h.hal
        .disconnect(peer.handle, ReleaseType::Release, tx)
        .unwrap();

    h.event(TransportEvent::Deactivated(DeactivationKind::Idle));
    assert_eq!(outcome(&mut send_rx), Err(HalError::TargetDeactivated));
    assert_eq!(outcome(&mut rx), Ok(()));
    assert_eq!(
        h.p2p.try_recv().unwrap(),
        P2pNotification::Deactivated(peer.handle)
    );
}

#[test]
fn test_presence_check_on_iso_dep_uses_command() {
    let mut h = Harness::open();
    h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal.presence_check(tx).unwrap();
    assert_eq!(h.last_command(), Some(Command::IsoDepPresenceCheck));
    assert_eq!(h.hal.next_state(), Some(ControllerState::PresenceCheck));

    h.complete(Opcode::IsoDepPresenceCheck);
    assert_eq!(outcome(&mut rx), Ok(()));
    assert_eq!(h.hal.current_state(), ControllerState::TargetConnected);
}

#[test]
fn test_presence_check_failure_closes_session() {
    let mut h = Harness::open();
    h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal.presence_check(tx).unwrap();
    h.fail(Opcode::IsoDepPresenceCheck, TransportError::RfTimeout);

    assert_eq!(outcome(&mut rx), Err(HalError::RfTimeout));
    assert!(!h.hal.connected_device().unwrap().session_open);
    let (tx, _rx) = completion();
    assert!(matches!(
        h.hal.presence_check(tx),
        Err(HalError::InvalidState { .. })
    ));
}

#[test]
fn test_presence_check_on_memory_tag_reads() {
    let mut h = Harness::open();
    h.connected(ultralight(1));

    let (tx, mut rx) = completion();
    h.hal.presence_check(tx).unwrap();
    assert_eq!(h.mock.last_data().unwrap().payload, vec![0x30, 0x00]);

    h.expire_timer();
    assert_eq!(outcome(&mut rx), Err(HalError::RfTimeout));
    assert!(!h.hal.connected_device().unwrap().session_open);
}

#[test]
fn test_disconnect_after_presence_check_timeout() {
    let mut h = Harness::open();
    let device = h.connected(ultralight(1));

    let (tx, mut rx) = completion();
    h.hal.presence_check(tx).unwrap();
    h.expire_timer();
    assert_eq!(outcome(&mut rx), Err(HalError::RfTimeout));

    let (tx, mut rx) = completion();
    h.hal
        .disconnect(device.handle, ReleaseType::Release, tx)
        .unwrap();
    h.complete(Opcode::Deactivate);

    assert_eq!(outcome(&mut rx), Ok(()));
    assert!(h.hal.connected_device().is_none());
    assert!(!h.hal.has_session());
    assert_eq!(h.armed_timers(), 0);
}

#[rstest]
#[case(vec![0x01, 0x02, 0x00], Ok(()))]
#[case(vec![0x01, 0x02, 0x02], Err(HalError::FrameCorrupted))]
#[case(vec![0x01, 0x02, 0x09], Err(HalError::RfError))]
fn test_presence_reply_trailer_decides_presence(
    #[case] reply: Vec<u8>,
    #[case] expected: nfchal_core::Result<()>,
) {
    let mut h = Harness::open();
    h.connected(ultralight(1));

    let (tx, mut rx) = completion();
    h.hal.presence_check(tx).unwrap();
    h.receive(RF, reply, false);

    let present = expected.is_ok();
    assert_eq!(outcome(&mut rx), expected);
    assert_eq!(h.hal.connected_device().unwrap().session_open, present);
    assert_eq!(h.hal.current_state(), ControllerState::TargetConnected);
    assert_eq!(h.armed_timers(), 0);
}

#[test]
fn test_presence_check_on_p2p_peer_is_unsupported() {
    let mut h = Harness::open().with_p2p_listener();
    h.connected_peer(nfc_dep_target(1, 0));
    let (tx, _rx) = completion();
    assert!(matches!(
        h.hal.presence_check(tx),
        Err(HalError::FeatureNotSupported(_))
    ));
}

#[test]
fn test_disconnect_restarting_discovery() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .disconnect(device.handle, ReleaseType::RestartDiscovery, tx)
        .unwrap();
    assert_eq!(
        h.last_command(),
        Some(Command::Deactivate(DeactivationKind::Discovery))
    );
    h.complete(Opcode::Deactivate);

    assert_eq!(outcome(&mut rx), Ok(()));
    assert_eq!(h.hal.current_state(), ControllerState::Configuring);
    assert!(h.hal.connected_device().is_none());
    assert!(!h.hal.has_session());
}

#[test]
fn test_disconnect_with_unknown_release_still_releases() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .disconnect(device.handle, ReleaseType::Unknown(9), tx)
        .unwrap();
    h.complete(Opcode::Deactivate);

    assert!(matches!(outcome(&mut rx), Err(HalError::FeatureNotSupported(_))));
    assert!(h.hal.connected_device().is_none());
    assert_eq!(h.hal.current_state(), ControllerState::OpenAndReady);
}

#[test]
fn test_failed_deactivate_still_releases() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .disconnect(device.handle, ReleaseType::Release, tx)
        .unwrap();
    h.fail(Opcode::Deactivate, TransportError::Status(0x06));

    assert_eq!(outcome(&mut rx), Err(HalError::Failed { status: 0x06 }));
    assert!(h.hal.connected_device().is_none());
}

#[test]
fn test_disconnect_rejects_wrong_handle() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));
    let other = nfchal_core::DeviceHandle::new(device.handle.as_u32() + 1);
    let (tx, _rx) = completion();
    assert_eq!(
        h.hal.disconnect(other, ReleaseType::Release, tx),
        Err(HalError::InvalidRemoteDevice)
    );
}

#[test]
fn test_device_lost_while_connected() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00], 16), tx)
        .unwrap();
    h.event(TransportEvent::Deactivated(DeactivationKind::Idle));

    assert_eq!(outcome(&mut rx), Err(HalError::TargetDeactivated));
    assert_eq!(
        h.events.try_recv().unwrap(),
        DefaultEvent::TargetLost(device.handle)
    );
    assert_eq!(h.hal.current_state(), ControllerState::OpenAndReady);
    assert!(h.hal.connected_device().is_none());
    assert_eq!(h.armed_timers(), 0);
}

#[test]
fn test_interface_error_fails_the_exchange() {
    let mut h = Harness::open();
    let device = h.connected(iso_dep_a(1));

    let (tx, mut rx) = completion();
    h.hal
        .transceive(device.handle, TransceiveRequest::raw(vec![0x00], 16), tx)
        .unwrap();
    h.event(TransportEvent::InterfaceError(TransportError::FrameCorrupted));

    assert_eq!(outcome(&mut rx), Err(HalError::FrameCorrupted));
    assert!(h.hal.connected_device().is_some());
    assert_eq!(h.hal.next_state(), None);
}
