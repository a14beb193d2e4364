use threadmpi::traits::*;
use threadmpi::{Config, Universe};

fn main() -> threadmpi::Result<()> {
    let universe = Universe::new(Config::new(4))?;
    universe.run(|world| {
        let rank = world.rank()?;
        println!("Before barrier, rank {}.", rank);
        world.barrier()?;
        println!("After barrier, rank {}.", rank);

        let moon = world.duplicate()?;
        world.barrier()?;
        moon.barrier()?;

        // freeing takes effect for every member
        world.barrier()?;
        if rank == 0 {
            moon.free()?;
        }
        Ok(())
    })?;
    Ok(())
}
