mod common;

use std::collections::BTreeMap;

use common::{ScriptedTransport, ack, status_frame, value_u16};
use stservo_controller::bus::{ServoBus, StsBus};
use stservo_controller::protocol::encode_instruction;
use stservo_controller::registers::{BROADCAST_ID, INST_READ, PRESENT_POSITION, TORQUE_ENABLE};
use stservo_controller::{CommResult, DeviceStatus, ServoError};

fn torque_targets(ids: &[u8]) -> BTreeMap<u8, Vec<u8>> {
    ids.iter().map(|&id| (id, vec![1])).collect()
}

#[test]
fn sync_write_is_one_broadcast_frame_without_reply() {
    let bus = ScriptedTransport::new();
    bus.reply(ack(1)); // must stay unread
    let mut handler = bus.handler();

    let result = handler.group_write(TORQUE_ENABLE, &torque_targets(&[1, 2]));
    assert_eq!(result, CommResult::Success);
    assert_eq!(
        bus.sent(),
        vec![vec![
            0xFF, 0xFF, 0xFE, 0x08, 0x83, 0x28, 0x01, 0x01, 0x01, 0x02, 0x01, 0x48
        ]]
    );
    assert_eq!(bus.receive_calls(), 0);
    assert_eq!(bus.unused_replies(), 1);
}

#[test]
fn malformed_sync_writes_are_never_sent() {
    let bus = ScriptedTransport::new();
    let mut handler = bus.handler();

    assert_eq!(
        handler.group_write(TORQUE_ENABLE, &BTreeMap::new()),
        CommResult::TxError
    );

    let mut uneven = torque_targets(&[1]);
    uneven.insert(2, vec![1, 0]);
    assert_eq!(handler.group_write(TORQUE_ENABLE, &uneven), CommResult::TxError);

    // 2 + 50 * (1 + 5) parameter bytes do not fit in one packet.
    let oversized: BTreeMap<u8, Vec<u8>> = (1..=50).map(|id| (id, vec![0; 5])).collect();
    assert_eq!(handler.group_write(TORQUE_ENABLE, &oversized), CommResult::TxError);

    assert!(bus.sent().is_empty());
}

#[test]
fn bus_sync_write_reports_broadcast_failures() {
    let bus = ScriptedTransport::new();
    let mut sts = StsBus::new(bus.handler());

    sts.sync_write(TORQUE_ENABLE, &torque_targets(&[3, 4])).unwrap();
    assert_eq!(bus.sent().len(), 1);
    assert_eq!(bus.sent()[0][2], BROADCAST_ID);

    assert!(matches!(
        sts.sync_write(TORQUE_ENABLE, &BTreeMap::new()),
        Err(ServoError::Communication {
            id: BROADCAST_ID,
            result: CommResult::TxError
        })
    ));
}

#[test]
fn scan_skips_silent_and_faulted_servos() {
    let bus = ScriptedTransport::new();
    bus.ping_ok(1, 777)
        .reply(None)
        .reply(Some(status_frame(3, DeviceStatus::OVERHEAT.bits(), &[])))
        .ping_ok(4, 777);

    let found = bus.handler().scan(1..=4);
    assert_eq!(found, vec![(1, 777), (4, 777)]);
    assert_eq!(bus.unused_replies(), 0);
}

#[test]
fn late_reply_from_another_servo_is_skipped() {
    let bus = ScriptedTransport::new();
    let mut late_then_answer = status_frame(8, 0, &[0x10, 0x00]);
    late_then_answer.extend(status_frame(2, 0, &[0x00, 0x08]));
    bus.reply(Some(late_then_answer));

    let reply = bus.handler().read_u16(2, PRESENT_POSITION);
    assert!(reply.is_ok());
    assert_eq!(reply.value, Some(2048));
    assert_eq!(
        bus.sent(),
        vec![encode_instruction(2, INST_READ, &[PRESENT_POSITION, 2]).unwrap()]
    );
}

#[test]
fn silence_and_partial_frames_are_told_apart() {
    let bus = ScriptedTransport::new();
    let partial = value_u16(5, 100).map(|frame| frame[..4].to_vec());
    bus.reply(None).reply(partial);
    let mut handler = bus.handler();

    assert_eq!(handler.read_u16(5, PRESENT_POSITION).comm, CommResult::NoResponse);
    assert_eq!(handler.read_u16(5, PRESENT_POSITION).comm, CommResult::Timeout);

    handler.close();
    assert!(handler.transport().is_closed());
}
