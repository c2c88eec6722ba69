//! Consumer callbacks and the minion run loop.
//!
//! Device and GUI code implements [`Actor`] around an owned [`Minion`] and
//! hands it to [`run`]. One loop iteration reads the status key, drains the
//! inbound channels, applies timer requests, dispatches due timers and
//! sleeps until the next timer is due (bounded by `max_idle_ms`).

use crate::error::MinionResult;
use crate::minion::Minion;
use crate::scheduler::Scheduler;
use minion_common::status::MinionStatus;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the timer driving [`Actor::on_time`].
pub const MAIN_TIMER: &str = "main";

/// Callbacks of a minion process.
pub trait Actor: Sized {
    /// The minion this actor drives.
    fn minion(&mut self) -> &mut Minion;

    /// Runs once after the state store exists and peers are linked. Extra
    /// timers registered here are driven by the same loop.
    fn initialize(&mut self, _scheduler: &mut Scheduler<Self>) -> MinionResult<()> {
        Ok(())
    }

    /// Periodic body, dispatched by the main timer at the base interval.
    fn on_time(&mut self, _elapsed: Duration) {}

    /// Runs once when a terminal status is observed, before shutdown.
    fn on_close(&mut self) {}
}

/// Start the actor's minion and loop until its status turns terminal.
///
/// The minion is always shut down on return, including when `initialize`
/// fails.
pub fn run<A: Actor + 'static>(actor: &mut A) -> MinionResult<()> {
    let config = actor.minion().config().clone();
    actor.minion().start()?;

    let mut scheduler: Scheduler<A> = Scheduler::new(config.refresh_interval());
    scheduler.add_timer(MAIN_TIMER, |actor: &mut A, elapsed| actor.on_time(elapsed));
    scheduler.start_timing(MAIN_TIMER);

    if let Err(e) = actor.initialize(&mut scheduler) {
        warn!("{} failed to initialize: {}", actor.minion().name(), e);
        actor.minion().shutdown()?;
        return Err(e);
    }
    if actor.minion().status() == MinionStatus::Initializing {
        actor.minion().set_status(MinionStatus::Running);
    }
    info!(
        "{} running with timers {:?}",
        actor.minion().name(),
        scheduler.timer_names().collect::<Vec<_>>()
    );

    loop {
        match actor.minion().poll_status() {
            MinionStatus::Initializing | MinionStatus::Running => {
                let minion = actor.minion();
                minion.pump();
                for command in minion.take_timer_commands() {
                    scheduler.apply(command);
                }
                scheduler.exec(actor);

                let idle = scheduler
                    .time_to_next()
                    .map_or(config.max_idle(), |next| next.min(config.max_idle()));
                if !idle.is_zero() {
                    std::thread::sleep(idle);
                }
            }
            MinionStatus::Suspended => {
                std::thread::sleep(config.suspend_poll());
            }
            status @ (MinionStatus::ShuttingDown | MinionStatus::Terminated) => {
                debug!("{} leaving run loop on {:?}", actor.minion().name(), status);
                break;
            }
        }
    }

    actor.on_close();
    actor.minion().shutdown()
}
