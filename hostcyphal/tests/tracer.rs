//! Offline and live transfer reconstruction

use std::sync::Arc;

use hostcyphal::core::{DataSpecifier, NodeId, Priority, SubjectId, TransferId};
use hostcyphal::time::{Duration, Instant};
use hostcyphal::transfer::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Transfer,
};
use hostcyphal::transport::can::{
    media::{candump, MemoryBus},
    CanTracer, CanTransport, CanTransportOptions,
};
use hostcyphal::transport::serial::{media::MemoryPipe, SerialTransport, SerialTransportOptions};
use hostcyphal::transport::{Capture, OutputSessionSpecifier, Trace, Tracer, Transport};
use hostcyphal_driver::can::Mtu;
use parking_lot::Mutex;

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[test]
fn test_offline_candump_reconstruction() {
    // A two-frame transfer (transfer-ID 27) followed by an orphaned continuation frame.
    let log = "(1.000000) vcan0 10606407#00010203040506BB\n\
               (1.000100) vcan0 10606407#07178D5B\n\
               (1.000200) vcan0 10606407#0909091C\n";
    let captures = candump::read_captures(log.as_bytes()).unwrap();
    assert_eq!(captures.len(), 3);

    let mut tracer = CanTracer::new(Duration::from_secs(2), 16);
    let mut transfers = Vec::new();
    let mut errors = Vec::new();
    for capture in &captures {
        match tracer.update(&Capture::Can(capture.clone())) {
            Some(Trace::Transfer(trace)) => transfers.push(trace),
            Some(Trace::Error(trace)) => errors.push(trace),
            None => {}
        }
    }

    assert_eq!(transfers.len(), 1);
    assert_eq!(errors.len(), 1);
    let transfer = &transfers[0].transfer;
    assert_eq!(transfer.payload, [0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(transfer.metadata.transfer_id, TransferId::new(27));
    assert_eq!(
        transfer.metadata.session_specifier.source_node_id,
        NodeId::new(7)
    );
    assert_eq!(
        transfer.metadata.session_specifier.data_specifier,
        DataSpecifier::Message(SubjectId::new(100).unwrap())
    );
}

#[test]
fn test_tracer_reconstructs_own_emissions() {
    let bus = MemoryBus::new(Mtu::Classic);
    let transport = CanTransport::new(
        Box::new(bus.attach()),
        CanTransportOptions {
            local_node_id: NodeId::new(19),
            ..Default::default()
        },
    )
    .unwrap();

    let captured: Arc<Mutex<Vec<Capture>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    transport.begin_capture(Arc::new(move |capture| sink.lock().push(capture.clone())));

    let tx = transport
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(SubjectId::new(500).unwrap()),
            remote_node_id: None,
        })
        .unwrap();
    let payloads: [&[u8]; 2] = [b"short", b"a payload long enough to need several frames"];
    futures_executor::block_on(async {
        for payload in payloads {
            tx.send(
                Transfer {
                    priority: Priority::Fast,
                    transfer_id: tx.next_transfer_id(),
                    payload: payload.to_vec(),
                },
                deadline(),
            )
            .await
            .unwrap();
        }
    });

    // The capture stream of a transport that observed its own emissions reconstructs the
    // same sequence of transfers that were emitted.
    let mut tracer = transport.make_tracer();
    let reconstructed: Vec<Vec<u8>> = captured
        .lock()
        .iter()
        .filter_map(|capture| match tracer.update(capture) {
            Some(Trace::Transfer(trace)) => Some(trace.transfer.payload),
            _ => None,
        })
        .collect();
    assert_eq!(reconstructed, payloads.map(<[u8]>::to_vec).to_vec());
}

#[test]
fn test_spoofed_serial_transfer_traces() {
    let pipe = MemoryPipe::new(64);
    let (end_a, _end_b) = pipe.ends();
    let transport = SerialTransport::new(
        Box::new(end_a),
        SerialTransportOptions {
            local_node_id: NodeId::new(77),
            ..Default::default()
        },
    )
    .unwrap();

    let captured: Arc<Mutex<Vec<Capture>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    transport.begin_capture(Arc::new(move |capture| sink.lock().push(capture.clone())));

    // Impersonate node 1234 talking to node 4321.
    let spoofed = AlienTransfer {
        metadata: AlienTransferMetadata {
            priority: Priority::Exceptional,
            transfer_id: TransferId::new(998),
            session_specifier: AlienSessionSpecifier {
                source_node_id: NodeId::new(1234),
                destination_node_id: NodeId::new(4321),
                data_specifier: DataSpecifier::Message(SubjectId::new(60).unwrap()),
            },
        },
        payload: b"not actually from 1234".to_vec(),
    };
    futures_executor::block_on(transport.spoof(&spoofed, deadline())).unwrap();

    let mut tracer = transport.make_tracer();
    let traces: Vec<Trace> = captured
        .lock()
        .iter()
        .filter_map(|capture| tracer.update(capture))
        .collect();
    assert_eq!(traces.len(), 1);
    let Trace::Transfer(trace) = &traces[0] else {
        panic!("expected a transfer trace");
    };
    assert_eq!(trace.transfer, spoofed);
}
