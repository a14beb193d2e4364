use threadmpi::Config;
use tracing_subscriber::EnvFilter;

fn main() -> threadmpi::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let universe = threadmpi::initialize(Config::from_env()?)?;
    universe.run(|world| {
        println!(
            "Hello parallel world from process {} of {}!",
            world.rank()?,
            world.size()?
        );
        Ok(())
    })?;
    Ok(())
}
