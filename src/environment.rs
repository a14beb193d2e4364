//! Environmental management
//!
//! This module provides ways for a program to set up the runtime and interact with it.
//!
//! A `Universe` owns the shared state of one computation: the process registry, the matcher
//! for point to point traffic and the coordinator for collectives. It is set up from a `Config`
//! with a fixed number of participants, each of which runs on its own thread and communicates
//! through its own handle to the world communicator.
//!
//! Any number of universes may coexist. `initialize()` additionally guards against a second
//! initialization of the process-wide universe.
use std::env::{self, VarError};
use std::fmt;
use std::panic;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use conv::ConvUtil;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info};

use crate::collective::Coordinator;
use crate::error::{Error, ErrorHandler, ErrorsReturn, Result};
use crate::rendezvous::Matcher;
use crate::topology::{Group, ParticipantId, Rank, Registry, SimpleCommunicator};

/// Environment variable holding the number of participants for `Config::from_env()`
pub const WORLD_SIZE_VAR: &str = "THREADMPI_WORLD_SIZE";

/// Settings of a `Universe`
#[derive(Clone)]
pub struct Config {
    size: usize,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Default for Config {
    fn default() -> Self {
        Config::new(1)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config").field("size", &self.size).finish()
    }
}

impl Config {
    /// A universe of `size` participants whose communicators return errors without further
    /// handling
    pub fn new(size: usize) -> Config {
        Config {
            size,
            error_handler: Arc::new(ErrorsReturn),
        }
    }

    /// Reads the number of participants from `THREADMPI_WORLD_SIZE`.
    ///
    /// Defaults to a single participant if the variable is not set.
    pub fn from_env() -> Result<Config> {
        let size = match env::var(WORLD_SIZE_VAR) {
            Ok(value) => parse_size(&value)?,
            Err(VarError::NotPresent) => 1,
            Err(VarError::NotUnicode(value)) => {
                return Err(Error::Configuration {
                    variable: WORLD_SIZE_VAR,
                    value: value.to_string_lossy().into_owned(),
                })
            }
        };
        Ok(Config::new(size))
    }

    /// Sets the number of participants.
    pub fn with_size(mut self, size: usize) -> Config {
        self.size = size;
        self
    }

    /// Sets the error handler the world communicators start out with.
    pub fn with_error_handler<H: ErrorHandler + 'static>(mut self, handler: H) -> Config {
        self.error_handler = Arc::new(handler);
        self
    }

    /// The number of participants
    pub fn size(&self) -> usize {
        self.size
    }
}

fn parse_size(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(Error::Configuration {
            variable: WORLD_SIZE_VAR,
            value: value.to_owned(),
        }),
    }
}

/// The shared state of a universe
#[derive(Debug, Default)]
pub(crate) struct Runtime {
    pub(crate) registry: Registry,
    pub(crate) matcher: Matcher,
    pub(crate) coordinator: Coordinator,
}

impl Runtime {
    /// Frees `group` and fails everything still pending on it.
    pub(crate) fn free_group(&self, group: &Group) -> Result<()> {
        self.registry.free_group(group)?;
        self.matcher.release_group(group.id());
        self.coordinator.release_group(group.id());
        Ok(())
    }
}

/// Global context
pub struct Universe {
    runtime: Arc<Runtime>,
    world: Group,
    error_handler: Arc<dyn ErrorHandler>,
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("world", &self.world)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl Universe {
    /// Sets up a universe with the world group of `config.size()` participants.
    ///
    /// # Examples
    /// See `demos/simple.rs`
    pub fn new(config: Config) -> Result<Universe> {
        Lazy::force(&START);
        let runtime = Arc::new(Runtime::default());
        let world = runtime.registry.create_world_group(config.size)?;
        info!(size = config.size, group = %world.id(), "universe created");
        Ok(Universe {
            runtime,
            world,
            error_handler: config.error_handler,
        })
    }

    /// The number of participants
    pub fn size(&self) -> usize {
        self.world.members().len()
    }

    /// The world group
    pub fn world_group(&self) -> &Group {
        &self.world
    }

    /// The 'world communicator' of every participant, in rank order
    ///
    /// Contains all processes initially partaking in the computation. Each communicator is
    /// meant to be moved to the thread of its participant.
    pub fn world(&self) -> Vec<SimpleCommunicator> {
        self.world
            .members()
            .iter()
            .map(|&participant| self.communicator(participant))
            .collect()
    }

    /// The world communicator of a single participant
    pub fn world_at(&self, participant: ParticipantId) -> Result<SimpleCommunicator> {
        if participant < self.size() {
            Ok(self.communicator(participant))
        } else {
            Err(Error::InvalidRank {
                rank: participant.value_as::<Rank>().unwrap_or(Rank::MAX),
                size: self.size().value_as::<Rank>().unwrap_or(Rank::MAX),
            })
        }
    }

    fn communicator(&self, participant: ParticipantId) -> SimpleCommunicator {
        SimpleCommunicator::new(
            Arc::clone(&self.runtime),
            self.world.clone(),
            participant,
            Arc::clone(&self.error_handler),
        )
    }

    /// Runs `f` once per participant, each on its own thread, and collects the results in rank
    /// order.
    ///
    /// Returns the first error returned by any participant. A participant that returns early
    /// while its peers still wait for it leaves them blocked; free the world communicator
    /// before bailing out in that case. A panic in a participant is resumed on the calling
    /// thread.
    ///
    /// # Examples
    /// See `demos/simple.rs`
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(SimpleCommunicator) -> Result<R> + Sync,
        R: Send,
    {
        thread::scope(|scope| {
            let f = &f;
            let mut threads = Vec::with_capacity(self.size());
            for comm in self.world() {
                let participant = comm.participant();
                let spawned = thread::Builder::new()
                    .name(format!("rank-{}", participant))
                    .spawn_scoped(scope, move || f(comm));
                match spawned {
                    Ok(thread) => threads.push(thread),
                    Err(e) => {
                        // unblock the participants already running
                        let _ = self.runtime.free_group(&self.world);
                        return Err(Error::Spawn {
                            participant,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            debug!(participants = threads.len(), "participants started");

            let mut results = Vec::with_capacity(threads.len());
            let mut first_error = None;
            for thread in threads {
                match thread.join() {
                    Ok(Ok(result)) => results.push(result),
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            first_error.map_or(Ok(results), Err)
        })
    }

    /// The process registry of this universe
    pub fn registry(&self) -> &Registry {
        &self.runtime.registry
    }

    /// The matcher of this universe
    pub fn matcher(&self) -> &Matcher {
        &self.runtime.matcher
    }

    /// The collective coordinator of this universe
    pub fn coordinator(&self) -> &Coordinator {
        &self.runtime.coordinator
    }
}

static INITIALIZED: OnceCell<()> = OnceCell::new();

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Whether `initialize()` has been called in this process
pub fn is_initialized() -> bool {
    INITIALIZED.get().is_some()
}

/// Initialize the process-wide universe.
///
/// Succeeds once per process. Later calls fail with `AlreadyInitialized`, even if the first
/// call failed for another reason.
///
/// # Examples
/// See `demos/simple.rs`
pub fn initialize(config: Config) -> Result<Universe> {
    INITIALIZED
        .set(())
        .map_err(|()| Error::AlreadyInitialized)?;
    Universe::new(config)
}

/// Time in seconds since an arbitrary time in the past.
///
/// The cheapest high-resolution timer available will be used.
pub fn time() -> f64 {
    START.elapsed().as_secs_f64()
}

/// Resolution of timer used in `time()` in seconds
pub fn time_resolution() -> f64 {
    1e-9
}

/// Identifies the version of the message passing interface modelled by the library.
///
/// Returns a tuple of `(version, subversion)`.
pub fn version() -> (i32, i32) {
    (3, 1)
}

/// Describes the version of the library itself.
pub fn library_version() -> String {
    format!("threadmpi {}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn sizes_must_be_positive_integers() {
        assert_eq!(parse_size("4").unwrap(), 4);
        assert_eq!(parse_size(" 2\n").unwrap(), 2);
        assert_eq!(parse_size("0").unwrap_err().kind(), ErrorKind::Configuration);
        assert_eq!(
            parse_size("four").unwrap_err(),
            Error::Configuration {
                variable: WORLD_SIZE_VAR,
                value: "four".to_owned(),
            }
        );
    }

    #[test]
    fn world_communicators_are_in_rank_order() {
        let universe = Universe::new(Config::new(3)).unwrap();
        let ranks: Vec<_> = universe
            .world()
            .iter()
            .map(|comm| comm.rank().unwrap())
            .collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert_eq!(
            universe.world_at(3).unwrap_err().kind(),
            ErrorKind::InvalidRank
        );
    }

    #[test]
    fn run_collects_results_in_rank_order() {
        let universe = Universe::new(Config::new(4)).unwrap();
        let ranks = universe.run(|world| world.rank()).unwrap();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn run_reports_participant_errors() {
        let universe = Universe::new(Config::new(2)).unwrap();
        let err = universe
            .run(|world| {
                if world.rank()? == 1 {
                    Err(Error::InvalidTag(-5))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err, Error::InvalidTag(-5));
    }

    #[test]
    fn time_is_monotonic() {
        let t = time();
        assert!(time() >= t);
        assert!(time_resolution() > 0.0);
        assert!(library_version().starts_with("threadmpi "));
    }
}
