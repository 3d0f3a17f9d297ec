//! Wire-level checks of the CAN transmit path

use std::sync::Arc;

use hostcyphal::core::{DataSpecifier, NodeId, Priority, SubjectId, TransferId};
use hostcyphal::time::{Duration, Instant};
use hostcyphal::transfer::Transfer;
use hostcyphal::transport::can::{media::MemoryBus, CanTransport, CanTransportOptions};
use hostcyphal::transport::{
    Capture, Direction, InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata,
    Transport,
};
use hostcyphal_driver::can::{encode_id, Mtu};
use parking_lot::Mutex;

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn test_single_frame_wire_format() {
    let bus = MemoryBus::new(Mtu::Classic);
    let publisher_node = CanTransport::new(
        Box::new(bus.attach()),
        CanTransportOptions {
            local_node_id: NodeId::new(42),
            ..Default::default()
        },
    )
    .unwrap();
    let subscriber_node = CanTransport::new(
        Box::new(bus.attach()),
        CanTransportOptions {
            local_node_id: NodeId::new(43),
            ..Default::default()
        },
    )
    .unwrap();

    let captured: Arc<Mutex<Vec<Capture>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    publisher_node.begin_capture(Arc::new(move |capture| sink.lock().push(capture.clone())));

    let subject = SubjectId::new(1234).unwrap();
    let rx = subscriber_node
        .input_session(
            InputSessionSpecifier {
                data_specifier: DataSpecifier::Message(subject),
                remote_node_id: None,
            },
            PayloadMetadata { extent: 64 },
        )
        .unwrap();
    let tx = publisher_node
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(subject),
            remote_node_id: None,
        })
        .unwrap();

    let sent = futures_executor::block_on(tx.send(
        Transfer {
            priority: Priority::Nominal,
            transfer_id: tx.next_transfer_id(),
            payload: vec![0x01, 0x02, 0x03, 0x04],
        },
        deadline(),
    ))
    .unwrap();
    assert!(sent);
    bus.process();

    // Exactly one frame was emitted.
    let captures = captured.lock();
    assert_eq!(captures.len(), 1);
    let Capture::Can(capture) = &captures[0] else {
        panic!("expected a CAN capture");
    };
    assert!(matches!(capture.direction, Direction::Egress));

    // The arbitration ID encodes priority 4, subject 1234, source 42, not anonymous.
    let header = capture.frame.header;
    assert_eq!(header.priority, Priority::Nominal);
    assert_eq!(header.data_spec, DataSpecifier::Message(subject));
    assert_eq!(header.source, NodeId::new(42));
    let arbitration_id = encode_id(&header);
    assert_eq!((arbitration_id >> 26) & 0x7, 4);
    assert_eq!((arbitration_id >> 8) & 0x1fff, 1234);
    assert_eq!(arbitration_id & 0x7f, 42);
    assert_eq!(arbitration_id & (1 << 25), 0, "service flag clear");
    assert_eq!(arbitration_id & (1 << 24), 0, "anonymous flag clear");

    // The tail byte has start=1, end=1, toggle=1, transfer-ID 0.
    assert_eq!(
        capture.frame.data.as_ref(),
        [0x01, 0x02, 0x03, 0x04, 0b1110_0000]
    );

    // The subscriber on the same bus observes the payload exactly.
    let received = rx.try_receive().unwrap();
    assert_eq!(received.payload, [0x01, 0x02, 0x03, 0x04]);
    assert_eq!(received.source_node_id, NodeId::new(42));
    assert_eq!(received.transfer_id, TransferId::new(0));
}

#[test]
fn test_multi_frame_wire_format() {
    let bus = MemoryBus::new(Mtu::Classic);
    let transport = CanTransport::new(
        Box::new(bus.attach()),
        CanTransportOptions {
            local_node_id: NodeId::new(7),
            ..Default::default()
        },
    )
    .unwrap();

    let captured: Arc<Mutex<Vec<Capture>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    transport.begin_capture(Arc::new(move |capture| sink.lock().push(capture.clone())));

    let tx = transport
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(SubjectId::new(20).unwrap()),
            remote_node_id: None,
        })
        .unwrap();
    futures_executor::block_on(tx.send(
        Transfer {
            priority: Priority::Nominal,
            transfer_id: tx.next_transfer_id(),
            payload: (0u8..20).collect(),
        },
        deadline(),
    ))
    .unwrap();

    // 20 B of payload plus the transfer CRC across the trailing frames.
    let captures = captured.lock();
    let tails: Vec<u8> = captures
        .iter()
        .map(|c| {
            let Capture::Can(c) = c else { panic!() };
            *c.frame.data.last().unwrap()
        })
        .collect();
    assert_eq!(
        tails,
        [0b1010_0000, 0b0000_0000, 0b0010_0000, 0b0100_0000]
    );
}

#[test]
fn test_anonymous_multi_frame_is_refused_without_emission() {
    let bus = MemoryBus::new(Mtu::Classic);
    let anonymous = CanTransport::new(
        Box::new(bus.attach()),
        CanTransportOptions::default(),
    )
    .unwrap();
    let witness = CanTransport::new(
        Box::new(bus.attach()),
        CanTransportOptions {
            local_node_id: NodeId::new(1),
            ..Default::default()
        },
    )
    .unwrap();

    let tx = anonymous
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(SubjectId::new(5).unwrap()),
            remote_node_id: None,
        })
        .unwrap();
    let error = futures_executor::block_on(tx.send(
        Transfer {
            priority: Priority::Nominal,
            transfer_id: TransferId::new(0),
            payload: (0u8..20).collect(),
        },
        deadline(),
    ))
    .unwrap_err();
    assert!(matches!(
        error,
        hostcyphal::transport::TransportError::PayloadTooLarge { .. }
    ));

    bus.process();
    assert_eq!(witness.sample_statistics().frames_in, 0);
}
