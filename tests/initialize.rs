use threadmpi::environment::is_initialized;
use threadmpi::{initialize, Config, Error};

#[test]
fn initialize_succeeds_once_per_process() {
    assert!(!is_initialized());
    let universe = initialize(Config::new(2)).unwrap();
    assert!(is_initialized());
    assert_eq!(universe.size(), 2);

    assert_eq!(initialize(Config::new(2)).unwrap_err(), Error::AlreadyInitialized);
    assert_eq!(universe.run(|world| world.size()).unwrap(), vec![2, 2]);
}
