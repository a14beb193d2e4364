mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use threadmpi::collective::BarrierPhase;
use threadmpi::traits::*;
use threadmpi::{Error, ErrorKind};

use common::universe;

#[test]
fn barrier_waits_for_every_member() {
    const SIZE: usize = 4;
    let universe = universe(SIZE);
    let arrived = AtomicUsize::new(0);
    universe
        .run(|world| {
            for round in 1..=5 {
                if world.rank()? == round % 4 {
                    // one member is always late
                    std::thread::sleep(Duration::from_millis(5));
                }
                arrived.fetch_add(1, Ordering::SeqCst);
                world.barrier()?;
                assert!(arrived.load(Ordering::SeqCst) >= round as usize * SIZE);
            }
            Ok(())
        })
        .unwrap();

    let world = universe.world_group().id();
    assert_eq!(universe.coordinator().epoch(world).unwrap(), 5);
    assert_eq!(universe.coordinator().phase(world).unwrap(), BarrierPhase::Idle);
}

#[test]
fn barrier_of_one_returns_immediately() {
    let universe = universe(1);
    universe
        .run(|world| {
            world.barrier()?;
            world.barrier()
        })
        .unwrap();
}

#[test]
fn immediate_barrier_completes_after_the_last_arrival() {
    let universe = universe(2);
    let group = universe.world_group().id();
    universe
        .run(|world| {
            if world.rank()? == 0 {
                let request = world.immediate_barrier()?;
                let request = match request.test() {
                    Ok(_) => panic!("barrier released with one member"),
                    Err(request) => request,
                };
                assert_eq!(
                    request.cancel(),
                    Err(Error::NotCancellable("barrier"))
                );
                // let the other member in
                world.process_at_rank(1).send(&0u8)?;
                request.wait()?;
            } else {
                world.process_at_rank(0).receive::<u8>()?;
                world.barrier()?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(universe.coordinator().epoch(group).unwrap(), 1);
}

#[test]
fn broadcast_reaches_every_member() {
    let universe = universe(4);
    let buffers = universe
        .run(|world| {
            let mut buf = if world.rank()? == 0 {
                [3u32, 1, 4, 1]
            } else {
                [0; 4]
            };
            world.process_at_rank(0).broadcast_into(&mut buf[..])?;
            Ok(buf)
        })
        .unwrap();
    assert!(buffers.iter().all(|buf| *buf == [3, 1, 4, 1]));
}

#[test]
fn broadcasts_from_changing_roots_stay_in_order() {
    let universe = universe(3);
    let seen = universe
        .run(|world| {
            let mut seen = Vec::new();
            for root in [2, 0, 1, 2] {
                let mut value = if world.rank()? == root { root * 7 } else { -1 };
                world.process_at_rank(root).broadcast_into(&mut value)?;
                seen.push(value);
            }
            Ok(seen)
        })
        .unwrap();
    for values in seen {
        assert_eq!(values, vec![14, 0, 7, 14]);
    }
}

#[test]
fn broadcast_traffic_is_invisible_to_wildcard_receives() {
    let universe = universe(2);
    universe
        .run(|world| {
            let mut value = 0u8;
            if world.rank()? == 0 {
                value = 1;
                world.process_at_rank(0).broadcast_into(&mut value)?;
                world.process_at_rank(1).send(&2u8)?;
            } else {
                let mut user = 0u8;
                let request = world.any_process().immediate_receive_into(&mut user)?;
                world.process_at_rank(0).broadcast_into(&mut value)?;
                request.wait()?;
                assert_eq!((value, user), (1, 2));
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn broadcast_rejects_roots_outside_the_group() {
    let universe = universe(2);
    let calls = Arc::new(AtomicUsize::new(0));
    let errors = universe
        .run(|world| {
            let mut buf = [0u8; 2];
            let err = world.process_at_rank(2).broadcast_into(&mut buf[..]).unwrap_err();
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(err)
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    for err in errors {
        assert_eq!(err, Error::InvalidRoot { root: 2, size: 2 });
        assert_eq!(err.kind(), ErrorKind::InvalidRoot);
    }
}
