mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use threadmpi::error::ErrorContext;
use threadmpi::point_to_point::{send_receive_into, send_receive_into_with_tags};
use threadmpi::rendezvous::PendingCounts;
use threadmpi::request;
use threadmpi::traits::*;
use threadmpi::{Error, ErrorKind};

use common::universe;

#[test]
fn receive_equals_send() {
    let universe = universe(2);
    universe
        .run(|world| {
            if world.rank()? == 0 {
                world.process_at_rank(1).send(&[1.0f64, 2.0, 3.0][..])?;
            } else {
                let mut buf = [0.0f64; 3];
                let status = world.process_at_rank(0).receive_into(&mut buf[..])?;
                assert_eq!(buf, [1.0, 2.0, 3.0]);
                assert_eq!(status.source_rank(), 0);
                assert_eq!(status.tag(), 0);
                assert_eq!(status.count(), 3);
                assert!(status.is_success());
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn wildcard_receive_reports_the_sender() {
    let universe = universe(4);
    let received = universe
        .run(|world| {
            let rank = world.rank()?;
            if rank == 0 {
                let mut senders = Vec::new();
                for _ in 1..world.size()? {
                    let (value, status) = world.any_process().receive::<i32>()?;
                    assert_eq!(value, status.source_rank() * 100);
                    assert_eq!(status.tag(), status.source_rank());
                    senders.push(status.source_rank());
                }
                senders.sort_unstable();
                Ok(senders)
            } else {
                world.process_at_rank(0).send_with_tag(&(rank * 100), rank)?;
                Ok(Vec::new())
            }
        })
        .unwrap();
    assert_eq!(received[0], vec![1, 2, 3]);
}

#[test]
fn messages_with_the_same_tag_do_not_overtake() {
    let universe = universe(2);
    universe
        .run(|world| {
            if world.rank()? == 0 {
                let target = world.process_at_rank(1);
                let requests = vec![
                    target.immediate_send_with_tag(&b'A', 7)?,
                    target.immediate_send_with_tag(&b'B', 7)?,
                    target.immediate_send_with_tag(&b'C', 7)?,
                ];
                request::wait_all(requests)?;
            } else {
                let source = world.process_at_rank(0);
                let mut order = Vec::new();
                for _ in 0..3 {
                    let (byte, _) = source.receive_with_tag::<u8>(7)?;
                    order.push(byte);
                }
                assert_eq!(order, b"ABC");
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn receives_select_by_tag() {
    let universe = universe(2);
    universe
        .run(|world| {
            if world.rank()? == 0 {
                let target = world.process_at_rank(1);
                let first = target.immediate_send_with_tag(&1u32, 1)?;
                let second = target.immediate_send_with_tag(&2u32, 2)?;
                request::wait_all(vec![first, second])?;
            } else {
                let source = world.process_at_rank(0);
                let (two, _) = source.receive_with_tag::<u32>(2)?;
                let (one, _) = source.receive_with_tag::<u32>(1)?;
                assert_eq!((one, two), (1, 2));
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn oversized_message_is_truncated() {
    let universe = universe(2);
    let results = universe
        .run(|world| {
            if world.rank()? == 0 {
                world.process_at_rank(1).send(&[1i64, 2, 3, 4, 5][..])?;
                Ok(None)
            } else {
                let mut buf = [0i64; 3];
                let err = world.any_process().receive_into(&mut buf[..]).unwrap_err();
                assert_eq!(buf, [1, 2, 3]);
                Ok(Some(err))
            }
        })
        .unwrap();
    assert_eq!(
        results[1],
        Some(Error::Truncation {
            peer: 0,
            tag: 0,
            sent: 5,
            received: 3
        })
    );
}

#[test]
fn receive_vec_takes_the_whole_message() {
    let universe = universe(2);
    universe
        .run(|world| {
            if world.rank()? == 0 {
                let msg: Vec<u16> = (0..1000).collect();
                world.process_at_rank(1).send(&msg[..])?;
            } else {
                let (msg, status) = world.any_process().receive_vec::<u16>()?;
                assert_eq!(msg.len(), 1000);
                assert_eq!(status.count(), 1000);
                assert_eq!(msg[999], 999);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn mismatched_element_types_are_rejected() {
    let universe = universe(2);
    universe
        .run(|world| {
            if world.rank()? == 0 {
                world.process_at_rank(1).send(&7u8)?;
            } else {
                let err = world.any_process().receive::<u64>().unwrap_err();
                assert_eq!(err.kind(), ErrorKind::TypeMismatch);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn send_receive_exchanges_in_a_ring() {
    let universe = universe(3);
    let received = universe
        .run(|world| {
            let size = world.size()?;
            let rank = world.rank()?;
            let next = world.process_at_rank((rank + 1) % size);
            let previous = world.process_at_rank((rank + size - 1) % size);

            let mut msg = -1;
            send_receive_into(&rank, &next, &mut msg, &previous)?;

            let mut tagged = -1;
            let status =
                send_receive_into_with_tags(&(rank * 10), &next, 4, &mut tagged, &previous, 4)?;
            assert_eq!(status.tag(), 4);
            assert_eq!(tagged, msg * 10);
            Ok(msg)
        })
        .unwrap();
    assert_eq!(received, vec![2, 0, 1]);
}

#[test]
fn immediate_operations_complete_through_test() {
    let universe = universe(1);
    universe
        .run(|world| {
            let me = world.this_process()?;
            let mut y = 0i32;

            let rreq = world.any_process().immediate_receive_into(&mut y)?;
            let rreq = match rreq.test() {
                Ok(_) => panic!("receive completed without a send"),
                Err(rreq) => rreq,
            };
            let sreq = me.immediate_send(&42i32)?;

            let status = match rreq.test() {
                Ok(status) => status?,
                Err(_) => panic!("matched receive is not complete"),
            };
            assert_eq!(status.count(), 1);
            sreq.wait()?;
            assert_eq!(y, 42);
            Ok(())
        })
        .unwrap();
}

#[test]
fn wait_timeout_returns_the_pending_request() {
    let universe = universe(1);
    universe
        .run(|world| {
            let mut y = 0u8;
            let rreq = world.any_process().immediate_receive_into(&mut y)?;
            let rreq = match rreq.wait_timeout(Duration::from_millis(20)) {
                Ok(_) => panic!("receive completed without a send"),
                Err(rreq) => rreq,
            };
            let sreq = world.this_process()?.immediate_send(&9u8)?;
            let status = match rreq.wait_timeout(Duration::from_secs(5)) {
                Ok(status) => status?,
                Err(_) => panic!("receive timed out"),
            };
            assert_eq!(status.count(), 1);
            sreq.wait()?;
            assert_eq!(y, 9);
            Ok(())
        })
        .unwrap();
}

#[test]
fn cancelled_receive_does_not_consume_messages() {
    let universe = universe(1);
    let handles = universe
        .run(|world| {
            let mut y = 0u32;
            let rreq = world.any_process().immediate_receive_into(&mut y)?;
            let handle = rreq.handle().unwrap();
            rreq.cancel()?;
            let status = rreq.wait()?;
            assert!(status.is_cancelled());
            assert_eq!(status.count(), 0);

            let sreq = world.this_process()?.immediate_send(&5u32)?;
            let (value, _) = world.any_process().receive::<u32>()?;
            assert_eq!(value, 5);
            sreq.wait()?;
            Ok(handle)
        })
        .unwrap();

    // completing a request releases its handle
    let handle = handles[0];
    assert_eq!(universe.matcher().test(handle).unwrap_err(), Error::StaleHandle(handle));
}

#[test]
fn matched_requests_cannot_be_cancelled() {
    let universe = universe(1);
    universe
        .run(|world| {
            let mut y = 0u32;
            let rreq = world.any_process().immediate_receive_into(&mut y)?;
            let sreq = world.this_process()?.immediate_send(&5u32)?;
            let handle = sreq.handle().unwrap();

            assert_eq!(sreq.cancel(), Err(Error::AlreadyMatched(handle)));
            assert!(!sreq.wait()?.is_cancelled());
            assert!(rreq.wait()?.is_success());
            assert_eq!(y, 5);
            Ok(())
        })
        .unwrap();
}

#[test]
fn cancel_guard_on_matched_request_stays_silent() {
    let universe = universe(1);
    let reported = Arc::new(AtomicUsize::new(0));
    universe
        .run(|mut world| {
            let counter = Arc::clone(&reported);
            world.set_error_handler(move |_: &ErrorContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            let mut y = 0u32;
            {
                let rreq = world.any_process().immediate_receive_into(&mut y)?;
                world.this_process()?.send(&9u32)?;
                let _guard = request::CancelGuard::from(rreq);
            }
            assert_eq!(y, 9);
            Ok(())
        })
        .unwrap();
    assert_eq!(reported.load(Ordering::SeqCst), 0);
}

#[test]
fn dropped_requests_leave_no_pending_operations() {
    let universe = universe(2);
    let group = universe.world_group().id();
    universe
        .run(|world| {
            let mut y = 0u32;
            drop(world.any_process().immediate_receive_into(&mut y)?);
            Ok(())
        })
        .unwrap();
    assert_eq!(universe.matcher().pending(group), PendingCounts::default());
}

#[test]
fn probe_reports_without_receiving() {
    let universe = universe(2);
    universe
        .run(|world| {
            if world.rank()? == 0 {
                world.process_at_rank(1).send_with_tag(&[3u8, 4][..], 11)?;
            } else {
                let status = world.any_process().probe()?;
                assert_eq!((status.source_rank(), status.tag(), status.count()), (0, 11, 2));
                assert_eq!(
                    world.process_at_rank(0).immediate_probe_with_tag(11)?,
                    Some(status)
                );
                assert_eq!(world.process_at_rank(0).immediate_probe_with_tag(12)?, None);

                let (msg, _) = world.process_at_rank(0).receive_vec_with_tag::<u8>(11)?;
                assert_eq!(msg, vec![3, 4]);
                assert_eq!(world.any_process().immediate_probe()?, None);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn invalid_arguments_are_reported() {
    let universe = universe(2);
    universe
        .run(|world| {
            let calls = Arc::new(AtomicUsize::new(0));
            let mut world = world;
            let counter = Arc::clone(&calls);
            world.set_error_handler(move |context: &ErrorContext<'_>| {
                assert!(matches!(
                    context.error.kind(),
                    ErrorKind::InvalidRank | ErrorKind::InvalidTag
                ));
                counter.fetch_add(1, Ordering::SeqCst);
            });

            assert_eq!(
                world.process_at_rank(2).send(&0u8),
                Err(Error::InvalidRank { rank: 2, size: 2 })
            );
            assert_eq!(
                world.process_at_rank(-1).receive::<u8>().unwrap_err(),
                Error::InvalidRank { rank: -1, size: 2 }
            );
            assert_eq!(
                world.process_at_rank(0).send_with_tag(&0u8, -1),
                Err(Error::InvalidTag(-1))
            );
            assert_eq!(
                world.any_process().immediate_probe_with_tag(-3),
                Err(Error::InvalidTag(-3))
            );
            assert_eq!(calls.load(Ordering::SeqCst), 4);
            Ok(())
        })
        .unwrap();
}
