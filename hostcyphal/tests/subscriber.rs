//! Presentation-layer publish/subscribe over the loopback transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_executor::LocalPool;
use futures_task::LocalSpawn;
use hostcyphal::core::{DataSpecifier, NodeId, Priority, SubjectId, TransferId};
use hostcyphal::data_types::ByteArray;
use hostcyphal::presentation::Presentation;
use hostcyphal::time::{Duration, Instant};
use hostcyphal::transfer::Transfer;
use hostcyphal::transport::loopback::{LoopbackTransport, LoopbackTransportOptions};
use hostcyphal::transport::{OutputSessionSpecifier, Transport};

const SUBJECT: u16 = 8191;

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn make_presentation() -> Presentation {
    let transport = LoopbackTransport::new(LoopbackTransportOptions {
        local_node_id: NodeId::new(10),
        ..Default::default()
    });
    Presentation::new(Arc::new(transport))
}

#[test]
fn test_typed_round_trip() {
    let presentation = make_presentation();
    let subject = SubjectId::new(SUBJECT).unwrap();
    let subscriber = presentation.make_subscriber::<ByteArray>(subject).unwrap();
    let publisher = presentation
        .make_publisher::<ByteArray>(subject, Priority::Slow)
        .unwrap();

    let message = ByteArray::from_slice(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
    assert!(futures_executor::block_on(publisher.publish(&message, deadline())).unwrap());

    let (received, metadata) = subscriber.try_receive().unwrap();
    assert_eq!(received, message);
    assert_eq!(metadata.source_node_id, NodeId::new(10));
    assert_eq!(metadata.priority, Priority::Slow);
    assert_eq!(metadata.transfer_id, TransferId::new(0));
}

#[test]
fn test_fan_out_and_shared_transfer_id_counter() {
    let presentation = make_presentation();
    let subject = SubjectId::new(100).unwrap();

    let first = presentation.make_subscriber::<ByteArray>(subject).unwrap();
    let second = presentation.make_subscriber::<ByteArray>(subject).unwrap();

    // Two publishers of one subject share the session and the counter.
    let publisher_a = presentation
        .make_publisher::<ByteArray>(subject, Priority::Nominal)
        .unwrap();
    let publisher_b = presentation
        .make_publisher::<ByteArray>(subject, Priority::Nominal)
        .unwrap();

    futures_executor::block_on(async {
        for (index, publisher) in [&publisher_a, &publisher_b, &publisher_a]
            .into_iter()
            .enumerate()
        {
            let message = ByteArray::from_slice(&[index as u8]).unwrap();
            assert!(publisher.publish(&message, deadline()).await.unwrap());
        }
    });

    // Every subscriber observes the full stream with strictly increasing transfer-IDs.
    for subscriber in [&first, &second] {
        let mut previous: Option<u64> = None;
        for expected in 0u8..3 {
            let (message, metadata) = subscriber.try_receive().unwrap();
            assert_eq!(message.bytes.as_slice(), [expected]);
            if let Some(previous) = previous {
                assert!(metadata.transfer_id.into_u64() > previous);
            }
            previous = Some(metadata.transfer_id.into_u64());
        }
        assert!(subscriber.try_receive().is_none());
    }
}

#[test]
fn test_deserialization_failures_counted_not_raised() {
    let presentation = make_presentation();
    let subject = SubjectId::new(55).unwrap();
    let subscriber = presentation.make_subscriber::<ByteArray>(subject).unwrap();

    // A malformed payload: the length prefix claims 0xffff bytes.
    let raw = presentation
        .transport()
        .output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(subject),
            remote_node_id: None,
        })
        .unwrap();
    futures_executor::block_on(raw.send(
        Transfer {
            priority: Priority::Nominal,
            transfer_id: raw.next_transfer_id(),
            payload: vec![0xff, 0xff],
        },
        deadline(),
    ))
    .unwrap();
    // Followed by a healthy message.
    let publisher = presentation
        .make_publisher::<ByteArray>(subject, Priority::Nominal)
        .unwrap();
    let message = ByteArray::from_slice(&[7]).unwrap();
    futures_executor::block_on(publisher.publish(&message, deadline())).unwrap();

    // The malformed transfer is skipped silently; the stream stays live.
    let (received, _) = subscriber.try_receive().unwrap();
    assert_eq!(received, message);
    assert_eq!(subscriber.sample_deserialization_failures(), 1);
}

#[test]
fn test_background_receive_until_close() {
    let mut executor = LocalPool::new();
    let spawner = executor.spawner();

    let presentation = make_presentation();
    let subject = SubjectId::new(77).unwrap();
    let subscriber = presentation.make_subscriber::<ByteArray>(subject).unwrap();
    let publisher = presentation
        .make_publisher::<ByteArray>(subject, Priority::Nominal)
        .unwrap();

    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicBool::new(false));

    let observed_in_task = observed.clone();
    let finished_in_task = finished.clone();
    spawner
        .spawn_local_obj(
            Box::new(async move {
                subscriber
                    .receive_in_background(move |message: ByteArray, _metadata| {
                        observed_in_task.lock().push(message);
                    })
                    .await;
                finished_in_task.store(true, Ordering::SeqCst);
            })
            .into(),
        )
        .unwrap();

    let presentation_in_task = presentation.clone();
    spawner
        .spawn_local_obj(
            Box::new(async move {
                for value in [1u8, 2, 3] {
                    let message = ByteArray::from_slice(&[value]).unwrap();
                    publisher.publish(&message, deadline()).await.unwrap();
                }
                presentation_in_task.close();
            })
            .into(),
        )
        .unwrap();

    executor.run_until_stalled();

    assert!(finished.load(Ordering::SeqCst));
    let observed = observed.lock();
    assert_eq!(observed.len(), 3);
    assert_eq!(observed[2].bytes.as_slice(), [3]);
}

#[test]
fn test_receive_deadline_expires() {
    let presentation = make_presentation();
    let subscriber = presentation
        .make_subscriber::<ByteArray>(SubjectId::new(1).unwrap())
        .unwrap();
    let result = futures_executor::block_on(
        subscriber.receive(Instant::now() + Duration::from_millis(10)),
    );
    assert!(result.is_none());
}
