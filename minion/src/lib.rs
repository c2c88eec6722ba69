//! # Minion
//!
//! Process-per-device actors for laboratory instrument control. Every
//! [`Minion`] runs in its own OS process, publishes its state through a
//! shared-memory [`SharedStateStore`](minion_shm::SharedStateStore), and
//! exchanges discrete events with connected peers over shared-memory
//! channels. Processes are single threaded and cooperative: one loop drains
//! channels, dispatches due [`Scheduler`] timers and sleeps until the next
//! one is due.
//!
//! ## Modules
//!
//! - [`minion`] - identity, state store, peer links, messaging, arrays
//! - [`scheduler`] - named cooperative timers
//! - [`actor`] - consumer callbacks and the run loop
//! - [`channel`] - directed queue pairs between two minions
//! - [`logger`] - log aggregation across processes
//! - [`manager`] - topology wiring and process launch
//!
//! ## Usage
//!
//! ```rust,no_run
//! use minion::{Actor, Manager, Minion, MinionResult, Selection};
//! use std::time::Duration;
//!
//! struct Stage {
//!     minion: Minion,
//!     position: f64,
//! }
//!
//! impl Actor for Stage {
//!     fn minion(&mut self) -> &mut Minion {
//!         &mut self.minion
//!     }
//!
//!     fn on_time(&mut self, _elapsed: Duration) {
//!         self.position += 0.1;
//!         self.minion.set_state("position", &self.position);
//!     }
//! }
//!
//! fn main() -> MinionResult<()> {
//!     let mut manager = Manager::new();
//!     manager.add_minion("stage", |minion| {
//!         minion::run(&mut Stage { minion, position: 0.0 })
//!     })?;
//!     manager.run(Selection::All)?;
//!     std::thread::sleep(Duration::from_secs(1));
//!     manager.stop_all();
//!     manager.wait()?;
//!     manager.cleanup();
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod channel;
pub mod error;
pub mod logger;
pub mod manager;
pub mod minion;
pub mod scheduler;

pub use actor::{Actor, MAIN_TIMER, run};
pub use error::{MinionError, MinionResult};
pub use logger::{LoggerMinion, ReporterLayer};
pub use manager::{EntryPoint, Manager, Selection};
pub use minion::{Liveness, Minion};
pub use scheduler::{Scheduler, TimerCommand};
