#![allow(clippy::float_cmp)]
use std::time::Duration;

use threadmpi::request::{self, CancelGuard, WaitGuard};
use threadmpi::traits::*;
use threadmpi::{Config, Universe};

fn main() -> threadmpi::Result<()> {
    let universe = Universe::new(Config::new(1))?;
    universe.run(|world| {
        let me = world.this_process()?;
        let x = std::f32::consts::PI;
        let mut y: f32 = 0.0;

        {
            let mut sreq = me.immediate_send(&x)?;
            let rreq = world.any_process().immediate_receive_into(&mut y)?;

            rreq.wait()?;
            loop {
                match sreq.test() {
                    Ok(status) => {
                        status?;
                        break;
                    }
                    Err(req) => {
                        sreq = req;
                    }
                }
            }
        }
        assert_eq!(x, y);

        y = 0.0;
        {
            let _rreq = WaitGuard::from(world.any_process().immediate_receive_into(&mut y)?);
            let _sreq = WaitGuard::from(me.immediate_send(&x)?);
        }
        assert_eq!(x, y);

        assert!(world.any_process().immediate_probe()?.is_none());

        let values = [1u64, 2, 3];
        let mut received = [0u64; 3];
        {
            let (left, right) = received.split_at_mut(1);
            let (middle, last) = right.split_at_mut(1);
            let requests = vec![
                world.any_process().immediate_receive_into(&mut left[0])?,
                world.any_process().immediate_receive_into(&mut middle[0])?,
                world.any_process().immediate_receive_into(&mut last[0])?,
                me.immediate_send(&values[0])?,
                me.immediate_send(&values[1])?,
                me.immediate_send(&values[2])?,
            ];
            request::wait_all(requests)?;
        }
        assert_eq!(received, values);

        let barrier = world.immediate_barrier()?;
        barrier.wait()?;

        let rreq = world.any_process().immediate_receive_into(&mut y)?;
        let rreq = match rreq.wait_timeout(Duration::from_millis(10)) {
            Ok(_) => unreachable!("nothing was sent"),
            Err(rreq) => rreq,
        };
        rreq.cancel()?;
        assert!(rreq.wait()?.is_cancelled());

        let _rreq = CancelGuard::from(world.any_process().immediate_receive_into(&mut y)?);
        Ok(())
    })?;
    Ok(())
}
