use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use threadmpi::error::{ErrorContext, ErrorsLog};
use threadmpi::traits::*;
use threadmpi::{Config, ErrorKind, Universe};
use tracing_subscriber::EnvFilter;

fn main() -> threadmpi::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let universe = Universe::new(Config::new(2).with_error_handler(ErrorsLog))?;
    let truncations = Arc::new(AtomicUsize::new(0));
    universe.run(|mut world| {
        // logged by ErrorsLog, then returned
        let err = world.process_at_rank(2).send(&1u8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRank);

        let counter = Arc::clone(&truncations);
        world.set_error_handler(move |context: &ErrorContext<'_>| {
            if context.error.kind() == ErrorKind::Truncation {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        if world.rank()? == 0 {
            world.process_at_rank(1).send(&[1u16, 2, 3, 4][..])?;
        } else {
            let mut buf = [0u16; 2];
            let err = world.process_at_rank(0).receive_into(&mut buf[..]).unwrap_err();
            println!("Receive failed: {}", err);
            assert_eq!(buf, [1, 2]);
        }
        Ok(())
    })?;
    assert_eq!(truncations.load(Ordering::SeqCst), 1);
    Ok(())
}
