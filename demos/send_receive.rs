use threadmpi::point_to_point::send_receive_into;
use threadmpi::topology::Rank;
use threadmpi::traits::*;
use threadmpi::{Config, Universe};

fn main() -> threadmpi::Result<()> {
    let universe = Universe::new(Config::new(4))?;
    universe.run(|world| {
        let size = world.size()?;
        let rank = world.rank()?;

        // neighbours in a ring swap their ranks
        let next = world.process_at_rank((rank + 1) % size);
        let previous = world.process_at_rank((rank + size - 1) % size);
        let mut msg: Rank = -1;
        let status = send_receive_into(&rank, &next, &mut msg, &previous)?;
        println!("Process {} got message {}.\nStatus is: {:?}", rank, msg, status);
        assert_eq!(msg, previous.rank());

        match rank {
            0 => {
                let msg = vec![4.0f64, 8.0, 15.0];
                world.process_at_rank(1).send(&msg[..])?;
            }
            1 => {
                let (msg, status) = world.any_process().receive_vec::<f64>()?;
                println!("Process {} got long message {:?}.\nStatus is: {:?}", rank, msg, status);
                assert_eq!(msg, vec![4.0, 8.0, 15.0]);
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok(())
}
