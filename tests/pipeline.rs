//! End-to-end tests of the communication engine over the scriptable mock
//! link: discovery probing, binary upload chunking, pipelined ordering and
//! interrupt dispatch.

use boardlink::protocol::checksum::xor_parity;
use boardlink::protocol::{
    ACK, CLASS_MCU, CLASS_MCU_BUSY, CLASS_SOC, DETECT_PROBE, DETECT_REPLY, INTERRUPT, NACK,
    OP_REGISTER_READ, OP_SECTOR_WRITE, SECTOR_SIZE,
};
use boardlink::{CommError, Communicator, MockLink, Settings, Target};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

fn fast_settings() -> Settings {
    Settings {
        settle_delay_ms: 0,
        reconfigure_delay_ms: 0,
        ..Settings::default()
    }
}

fn detect_reply(class: u8) -> Vec<u8> {
    vec![DETECT_REPLY, class, class]
}

fn comm_at(class: u8) -> Communicator<MockLink> {
    let mut link = MockLink::new();
    link.enqueue_reply(&detect_reply(class));
    let mut comm = Communicator::new(link, fast_settings());
    comm.probe().unwrap();
    comm
}

#[test]
fn write_binary_of_two_exact_sectors_sends_two_unpadded_frames() {
    let mut comm = comm_at(CLASS_MCU);
    comm.link_mut().enqueue_reply(&[ACK]);
    comm.link_mut().enqueue_reply(&[ACK]);

    let data: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| (i % 256) as u8).collect();
    comm.write_binary(&data).unwrap();

    let sent = comm.link_mut().sent();
    let sectors: Vec<_> = sent
        .iter()
        .filter(|frame| frame[0] == OP_SECTOR_WRITE)
        .collect();
    assert_eq!(sectors.len(), 2);
    for (index, frame) in sectors.iter().enumerate() {
        assert_eq!(frame.len(), 1 + 2 + SECTOR_SIZE + 4);
        assert_eq!(&frame[1..3], &(index as u16).to_le_bytes());
        assert_eq!(
            &frame[3..3 + SECTOR_SIZE],
            &data[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
        );
    }
}

#[test]
fn write_binary_pads_the_final_partial_sector_with_zeros() {
    let mut comm = comm_at(CLASS_MCU);
    for _ in 0..3 {
        comm.link_mut().enqueue_reply(&[ACK]);
    }

    let data = vec![0xFFu8; 2 * SECTOR_SIZE + 1];
    comm.write_binary(&data).unwrap();

    let sent = comm.link_mut().sent();
    let sectors: Vec<_> = sent
        .iter()
        .filter(|frame| frame[0] == OP_SECTOR_WRITE)
        .collect();
    assert_eq!(sectors.len(), 3);
    let last = &sectors[2][3..3 + SECTOR_SIZE];
    assert_eq!(last[0], 0xFF);
    assert!(last[1..].iter().all(|&byte| byte == 0));
}

#[test]
fn write_binary_aborts_on_the_first_sector_failure() {
    let mut comm = comm_at(CLASS_MCU);
    comm.link_mut().enqueue_reply(&[ACK]);
    // Sector 1 NACKs past the whole retry budget.
    for _ in 0..=fast_settings().max_retries {
        comm.link_mut().enqueue_reply(&[NACK]);
    }

    let data = vec![0u8; 3 * SECTOR_SIZE];
    assert!(comm.write_binary(&data).is_err());

    let sectors = comm
        .link_mut()
        .sent()
        .iter()
        .filter(|frame| frame[0] == OP_SECTOR_WRITE)
        .count();
    // Sector 0 once, sector 1 with retries, sector 2 never.
    assert_eq!(sectors, 1 + 1 + fast_settings().max_retries as usize);
}

#[test]
fn write_binary_rejects_uploads_past_the_sector_index_range() {
    let mut comm = comm_at(CLASS_MCU);
    // One sector more than the 16-bit sector index can address.
    let data = vec![0u8; (usize::from(u16::MAX) + 2) * SECTOR_SIZE];
    let err = comm.write_binary(&data).unwrap_err();
    assert!(matches!(err, CommError::PayloadTooLarge { .. }));
    // Nothing beyond the probe reached the wire.
    assert_eq!(comm.link_mut().sent().len(), 1);

    let mut comm = comm_at(CLASS_SOC);
    let oversized = vec![0u8; 70_000];
    let err = comm.write_multi_register(0, 0x01, &oversized).unwrap_err();
    assert!(matches!(err, CommError::PayloadTooLarge { .. }));
    assert_eq!(comm.link_mut().sent().len(), 1);
}

#[test]
fn detect_waits_out_mcu_reconfiguration() {
    let mut link = MockLink::new();
    link.enqueue_reply(&detect_reply(CLASS_MCU_BUSY));
    link.enqueue_reply(&detect_reply(CLASS_MCU_BUSY));
    link.enqueue_reply(&detect_reply(CLASS_MCU));

    let settings = Settings {
        settle_delay_ms: 0,
        reconfigure_delay_ms: 30,
        ..Settings::default()
    };
    let mut comm = Communicator::new(link, settings);
    assert_eq!(comm.probe().unwrap(), Target::Mcu);

    let link = comm.link_mut();
    let probes: Vec<_> = link
        .sent()
        .iter()
        .enumerate()
        .filter(|(_, frame)| frame[0] == DETECT_PROBE)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(probes.len(), 3);

    // The configured inter-probe delay is observed between probes.
    let stamps = link.sent_at();
    assert!(stamps[probes[1]] - stamps[probes[0]] >= Duration::from_millis(30));
}

#[test]
fn dependent_read_is_held_until_the_write_completes() {
    let mut comm = comm_at(CLASS_SOC);
    comm.link_mut().enqueue_reply(&[ACK]);

    let write = comm.write_register_async(1, 0x10, 0x42, 0).unwrap();
    assert_eq!(comm.link_mut().sent().len(), 2); // probe + write

    let dest = Rc::new(Cell::new(0));
    comm.read_register_async(1, 0x10, Rc::clone(&dest), None, write)
        .unwrap();
    // Held: the register's previous access has not completed yet.
    assert_eq!(comm.link_mut().sent().len(), 2);

    comm.link_mut()
        .enqueue_reply(&[OP_REGISTER_READ, 0x42, 0x42]);
    comm.fetch_async_replies().unwrap();
    comm.write_replies();

    assert_eq!(comm.link_mut().sent().len(), 3);
    assert_eq!(dest.get(), 0x42);
}

#[test]
fn callback_read_delivers_payload_during_collection() {
    let mut comm = comm_at(CLASS_SOC);
    comm.link_mut()
        .enqueue_reply(&[OP_REGISTER_READ, 0x0F, 0x0F]);

    let seen = Rc::new(Cell::new(0u8));
    let seen_in_cb = Rc::clone(&seen);
    comm.read_register_async(
        3,
        0x20,
        Rc::new(Cell::new(0)),
        Some(Box::new(move |payload| {
            if let Some(&value) = payload.first() {
                seen_in_cb.set(value);
            }
        })),
        0,
    )
    .unwrap();

    comm.fetch_async_replies().unwrap();
    assert_eq!(seen.get(), 0x0F);
    // Callback tasks never reach the finished queue.
    assert_eq!(comm.executor().finished_len(), 0);
}

#[test]
fn interrupt_before_a_reply_fires_the_registered_handler() {
    let mut comm = comm_at(CLASS_SOC);

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = Rc::clone(&fired);
    comm.on_interrupt(2, Box::new(move || fired_in_cb.set(true)));

    // The board interjects an interrupt from core 2 before the write's ACK.
    let parity = xor_parity(&[2]);
    comm.link_mut()
        .enqueue_reply(&[INTERRUPT, 2, parity, ACK]);
    comm.write_register_async(2, 0x00, 1, 0).unwrap();
    comm.fetch_async_replies().unwrap();

    assert!(fired.get());
}

#[test]
fn sync_read_retries_through_a_nack() {
    let mut comm = comm_at(CLASS_SOC);
    comm.link_mut().enqueue_reply(&[NACK]);
    comm.link_mut()
        .enqueue_reply(&[OP_REGISTER_READ, 0x77, 0x77]);

    assert_eq!(comm.read_register(0, 0x01).unwrap(), 0x77);
    // Probe, first attempt, resend.
    assert_eq!(comm.link_mut().sent().len(), 3);
}

#[test]
fn serial_round_trip_through_the_mcu_context() {
    let mut comm = comm_at(CLASS_MCU);
    let mut reply = vec![boardlink::protocol::OP_SERIAL_READ];
    reply.extend_from_slice(&0x0BAD_CAFEu32.to_le_bytes());
    reply.push(xor_parity(&reply[1..]));
    comm.link_mut().enqueue_reply(&reply);

    assert_eq!(comm.read_serial().unwrap(), 0x0BAD_CAFE);
}
