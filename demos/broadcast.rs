use threadmpi::traits::*;
use threadmpi::{Config, Universe};

fn main() -> threadmpi::Result<()> {
    let universe = Universe::new(Config::new(4))?;
    universe.run(|world| {
        let root_process = world.process_at_rank(0);

        let mut data = if world.rank()? == 0 {
            [1.5f64, -2.0, 8.25, 3.0]
        } else {
            [0.0; 4]
        };
        root_process.broadcast_into(&mut data[..])?;
        assert_eq!(data, [1.5, -2.0, 8.25, 3.0]);

        let mut round = 0u32;
        for root in 0..world.size()? {
            if world.rank()? == root {
                round = 10 + root as u32;
            }
            world.process_at_rank(root).broadcast_into(&mut round)?;
            assert_eq!(round, 10 + root as u32);
        }
        println!("Rank {} received {:?}", world.rank()?, data);
        Ok(())
    })?;
    Ok(())
}
