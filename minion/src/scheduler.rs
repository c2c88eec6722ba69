//! Cooperative multi-timer scheduler.
//!
//! Each minion owns one [`Scheduler`] and calls [`Scheduler::exec`] once per
//! loop iteration. A started timer fires when the time since its last
//! dispatch, measured on its own elapsed clock, exceeds its interval. Nothing
//! here is preemptive: a callback that blocks delays every other timer and
//! all message processing of the process.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timer callback, given the owning context and the timer's elapsed time.
pub type TimerCallback<Ctx> = Box<dyn FnMut(&mut Ctx, Duration)>;

/// Deferred start/stop request recorded outside the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    /// Start (or restart) the named timer
    Start(String),
    /// Stop the named timer, keeping its elapsed time
    Stop(String),
}

struct Timer<Ctx> {
    name: String,
    interval: Duration,
    started_at: Option<Instant>,
    elapsed: Duration,
    last_dispatched: Duration,
    callback: TimerCallback<Ctx>,
}

impl<Ctx> Timer<Ctx> {
    fn elapsed_at(&self, now: Instant) -> Duration {
        match self.started_at {
            Some(start) => now.saturating_duration_since(start),
            None => self.elapsed,
        }
    }
}

/// Named timers with independent intervals.
pub struct Scheduler<Ctx> {
    base_interval: Duration,
    timers: Vec<Timer<Ctx>>,
}

impl<Ctx> Scheduler<Ctx> {
    /// Empty scheduler; new timers default to `base_interval`.
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval,
            timers: Vec::new(),
        }
    }

    /// Interval inherited by timers registered with [`add_timer`](Self::add_timer).
    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Register a stopped timer running at the base interval.
    ///
    /// Registering an existing name replaces that timer.
    pub fn add_timer<F>(&mut self, name: &str, callback: F)
    where
        F: FnMut(&mut Ctx, Duration) + 'static,
    {
        self.add_timer_with_interval(name, self.base_interval, callback);
    }

    /// Register a stopped timer with its own interval.
    pub fn add_timer_with_interval<F>(&mut self, name: &str, interval: Duration, callback: F)
    where
        F: FnMut(&mut Ctx, Duration) + 'static,
    {
        let timer = Timer {
            name: name.to_string(),
            interval,
            started_at: None,
            elapsed: Duration::ZERO,
            last_dispatched: Duration::ZERO,
            callback: Box::new(callback),
        };
        match self.timers.iter_mut().find(|t| t.name == name) {
            Some(existing) => *existing = timer,
            None => self.timers.push(timer),
        }
    }

    /// Remove a timer. Returns whether it existed.
    pub fn remove_timer(&mut self, name: &str) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.name != name);
        self.timers.len() != before
    }

    /// Change a timer's interval.
    pub fn set_interval(&mut self, name: &str, interval: Duration) -> bool {
        match self.timer_mut(name) {
            Some(timer) => {
                timer.interval = interval;
                true
            }
            None => false,
        }
    }

    /// Names in registration order.
    pub fn timer_names(&self) -> impl Iterator<Item = &str> {
        self.timers.iter().map(|t| t.name.as_str())
    }

    fn timer_mut(&mut self, name: &str) -> Option<&mut Timer<Ctx>> {
        self.timers.iter_mut().find(|t| t.name == name)
    }

    fn timer(&self, name: &str) -> Option<&Timer<Ctx>> {
        self.timers.iter().find(|t| t.name == name)
    }

    /// Start a timer from zero. A running timer is left alone.
    pub fn start_timing(&mut self, name: &str) -> bool {
        self.start_timing_at(name, Instant::now())
    }

    /// [`start_timing`](Self::start_timing) with an explicit clock.
    pub fn start_timing_at(&mut self, name: &str, now: Instant) -> bool {
        let Some(timer) = self.timer_mut(name) else {
            warn!("Cannot start unknown timer {}", name);
            return false;
        };
        if timer.started_at.is_none() {
            timer.started_at = Some(now);
            timer.elapsed = Duration::ZERO;
            timer.last_dispatched = Duration::ZERO;
            debug!("Timer {} started ({:?})", name, timer.interval);
        }
        true
    }

    /// Stop a timer, freezing its elapsed time until restarted.
    pub fn stop_timing(&mut self, name: &str) -> bool {
        self.stop_timing_at(name, Instant::now())
    }

    /// [`stop_timing`](Self::stop_timing) with an explicit clock.
    pub fn stop_timing_at(&mut self, name: &str, now: Instant) -> bool {
        let Some(timer) = self.timer_mut(name) else {
            warn!("Cannot stop unknown timer {}", name);
            return false;
        };
        if timer.started_at.is_some() {
            timer.elapsed = timer.elapsed_at(now);
            timer.started_at = None;
            debug!("Timer {} stopped at {:?}", name, timer.elapsed);
        }
        true
    }

    /// Apply a deferred command.
    pub fn apply(&mut self, command: TimerCommand) -> bool {
        match command {
            TimerCommand::Start(name) => self.start_timing(&name),
            TimerCommand::Stop(name) => self.stop_timing(&name),
        }
    }

    /// Whether the timer exists and is started.
    pub fn is_running(&self, name: &str) -> bool {
        self.timer(name).is_some_and(|t| t.started_at.is_some())
    }

    /// Elapsed time of a running timer, or the retained value of a stopped one.
    pub fn elapsed(&self, name: &str) -> Option<Duration> {
        self.timer(name).map(|t| t.elapsed_at(Instant::now()))
    }

    /// Dispatch every due timer. Returns the number of callbacks invoked.
    pub fn exec(&mut self, ctx: &mut Ctx) -> usize {
        self.exec_at(ctx, Instant::now())
    }

    /// [`exec`](Self::exec) with an explicit clock.
    pub fn exec_at(&mut self, ctx: &mut Ctx, now: Instant) -> usize {
        let mut dispatched = 0;
        for timer in &mut self.timers {
            if timer.started_at.is_none() {
                continue;
            }
            let elapsed = timer.elapsed_at(now);
            if elapsed.saturating_sub(timer.last_dispatched) > timer.interval {
                timer.last_dispatched = elapsed;
                (timer.callback)(ctx, elapsed);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Time until the earliest running timer becomes due. `None` if none run.
    pub fn time_to_next(&self) -> Option<Duration> {
        self.time_to_next_at(Instant::now())
    }

    /// [`time_to_next`](Self::time_to_next) with an explicit clock.
    pub fn time_to_next_at(&self, now: Instant) -> Option<Duration> {
        self.timers
            .iter()
            .filter(|t| t.started_at.is_some())
            .map(|t| {
                let since = t.elapsed_at(now).saturating_sub(t.last_dispatched);
                t.interval.saturating_sub(since)
            })
            .min()
    }
}
