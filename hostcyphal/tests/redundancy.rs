//! Redundant pseudo-transport over two dissimilar UDP fabrics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_executor::LocalPool;
use futures_task::LocalSpawn;
use hostcyphal::core::{DataSpecifier, NodeId, Priority, SubjectId, TransferId};
use hostcyphal::time::{Duration, Instant};
use hostcyphal::transfer::Transfer;
use hostcyphal::transport::redundant::{RedundantTransport, RedundantTransportOptions};
use hostcyphal::transport::udp::{
    media::MemoryFabric, wire, UdpTransport, UdpTransportOptions,
};
use hostcyphal::transport::{
    InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Transport,
};

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn udp_on(fabric: &MemoryFabric, node_id: u16) -> Arc<dyn Transport> {
    Arc::new(
        UdpTransport::new(
            Box::new(fabric.attach()),
            UdpTransportOptions {
                local_node_id: NodeId::new(node_id),
                ..Default::default()
            },
        )
        .unwrap(),
    )
}

fn pump_until(
    executor: &mut LocalPool,
    fabrics: &[&MemoryFabric],
    complete: &AtomicBool,
) {
    for _ in 0..200 {
        executor.run_until_stalled();
        for fabric in fabrics {
            fabric.process();
        }
        if complete.load(Ordering::SeqCst) {
            executor.run_until_stalled();
            for fabric in fabrics {
                fabric.process();
            }
            executor.run_until_stalled();
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    panic!("the scenario did not complete");
}

#[test]
fn test_each_transfer_delivered_exactly_once() {
    let mut executor = LocalPool::new();
    let spawner = executor.spawner();

    let fabric_a = MemoryFabric::new(1200);
    let fabric_b = MemoryFabric::new(1200);
    let subject = SubjectId::new(900).unwrap();

    let (sender, sender_runner) = RedundantTransport::new(RedundantTransportOptions::default());
    sender.attach_inferior(udp_on(&fabric_a, 5)).unwrap();
    sender.attach_inferior(udp_on(&fabric_b, 5)).unwrap();

    let (receiver, receiver_runner) =
        RedundantTransport::new(RedundantTransportOptions::default());
    receiver.attach_inferior(udp_on(&fabric_a, 6)).unwrap();
    receiver.attach_inferior(udp_on(&fabric_b, 6)).unwrap();

    spawner
        .spawn_local_obj(Box::new(sender_runner.run()).into())
        .unwrap();
    spawner
        .spawn_local_obj(Box::new(receiver_runner.run()).into())
        .unwrap();

    let rx = receiver
        .input_session(
            InputSessionSpecifier {
                data_specifier: DataSpecifier::Message(subject),
                remote_node_id: None,
            },
            PayloadMetadata { extent: 64 },
        )
        .unwrap();
    let tx = sender
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(subject),
            remote_node_id: None,
        })
        .unwrap();

    let complete = Arc::new(AtomicBool::new(false));
    let complete_in_task = complete.clone();
    spawner
        .spawn_local_obj(
            Box::new(async move {
                for value in 0u8..6 {
                    let accepted = tx
                        .send(
                            Transfer {
                                priority: Priority::Nominal,
                                transfer_id: tx.next_transfer_id(),
                                payload: vec![value],
                            },
                            deadline(),
                        )
                        .await
                        .unwrap();
                    assert!(accepted, "the fastest inferior must acknowledge");
                }
                complete_in_task.store(true, Ordering::SeqCst);
            })
            .into(),
        )
        .unwrap();

    pump_until(&mut executor, &[&fabric_a, &fabric_b], &complete);

    // Both fabrics delivered every transfer, yet the subscriber sees each exactly once,
    // with transfer-ID 5 among them.
    let mut seen = Vec::new();
    while let Some(transfer) = rx.try_receive() {
        seen.push(transfer.transfer_id.into_u64());
    }
    assert_eq!(seen, [0, 1, 2, 3, 4, 5]);
    // The inferiors together observed twelve datagrams (six per fabric).
    assert_eq!(receiver.sample_statistics().frames_in, 12);
}

#[test]
fn test_attach_does_not_reset_transfer_ids() {
    let mut executor = LocalPool::new();
    let spawner = executor.spawner();

    let fabric_a = MemoryFabric::new(1200);
    let fabric_b = MemoryFabric::new(1200);
    let subject = SubjectId::new(33).unwrap();

    let (sender, runner) = RedundantTransport::new(RedundantTransportOptions::default());
    sender.attach_inferior(udp_on(&fabric_a, 1)).unwrap();
    spawner.spawn_local_obj(Box::new(runner.run()).into()).unwrap();

    let receiver = udp_on(&fabric_b, 2);
    let rx = receiver
        .input_session(
            InputSessionSpecifier {
                data_specifier: DataSpecifier::Message(subject),
                remote_node_id: None,
            },
            PayloadMetadata { extent: 16 },
        )
        .unwrap();

    let tx = sender
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(subject),
            remote_node_id: None,
        })
        .unwrap();

    let complete = Arc::new(AtomicBool::new(false));
    let complete_in_task = complete.clone();
    let sender_in_task = sender.clone();
    let fabric_b_in_task = fabric_b.clone();
    spawner
        .spawn_local_obj(
            Box::new(async move {
                for value in 0u8..3 {
                    tx.send(
                        Transfer {
                            priority: Priority::Nominal,
                            transfer_id: tx.next_transfer_id(),
                            payload: vec![value],
                        },
                        deadline(),
                    )
                    .await
                    .unwrap();
                }
                // A second dissimilar channel joins mid-flight; the counter continues.
                sender_in_task
                    .attach_inferior(udp_on(&fabric_b_in_task, 1))
                    .unwrap();
                for value in 3u8..5 {
                    tx.send(
                        Transfer {
                            priority: Priority::Nominal,
                            transfer_id: tx.next_transfer_id(),
                            payload: vec![value],
                        },
                        deadline(),
                    )
                    .await
                    .unwrap();
                }
                complete_in_task.store(true, Ordering::SeqCst);
            })
            .into(),
        )
        .unwrap();

    pump_until(&mut executor, &[&fabric_a, &fabric_b], &complete);

    // The receiver sits on fabric B only, so it observes the transfers emitted after the
    // attachment, with sequence numbers continuing from before it.
    let mut seen = Vec::new();
    while let Some(transfer) = rx.try_receive() {
        seen.push(transfer.transfer_id.into_u64());
    }
    assert_eq!(seen, [3, 4]);
}

#[test]
fn test_send_without_inferiors_fails() {
    let (sender, _runner) = RedundantTransport::new(RedundantTransportOptions::default());
    let tx = sender
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(SubjectId::new(1).unwrap()),
            remote_node_id: None,
        })
        .unwrap();
    let error = futures_executor::block_on(tx.send(
        Transfer {
            priority: Priority::Nominal,
            transfer_id: TransferId::new(0),
            payload: vec![1],
        },
        deadline(),
    ))
    .unwrap_err();
    assert!(matches!(
        error,
        hostcyphal::transport::TransportError::SendFailed(_)
    ));
}

#[test]
fn test_close_releases_waiters() {
    let mut executor = LocalPool::new();
    let spawner = executor.spawner();

    let fabric = MemoryFabric::new(wire::HEADER_SIZE + 64);
    let (transport, runner) = RedundantTransport::new(RedundantTransportOptions::default());
    transport.attach_inferior(udp_on(&fabric, 9)).unwrap();
    spawner.spawn_local_obj(Box::new(runner.run()).into()).unwrap();

    let rx = transport
        .input_session(
            InputSessionSpecifier {
                data_specifier: DataSpecifier::Message(SubjectId::new(2).unwrap()),
                remote_node_id: None,
            },
            PayloadMetadata { extent: 16 },
        )
        .unwrap();

    let complete = Arc::new(AtomicBool::new(false));
    let complete_in_task = complete.clone();
    spawner
        .spawn_local_obj(
            Box::new(async move {
                // Blocks until closure, then resolves to None within one quantum.
                assert!(rx.receive_forever().await.is_none());
                complete_in_task.store(true, Ordering::SeqCst);
            })
            .into(),
        )
        .unwrap();

    executor.run_until_stalled();
    transport.close();
    executor.run_until_stalled();
    assert!(complete.load(Ordering::SeqCst));
}
