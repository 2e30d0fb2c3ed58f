//! Tunables for a [`SchedulerContext`](crate::SchedulerContext).

use crate::table::MAX_HANDLE;
use std::fmt;

/// Global configuration options used to create a
/// [`SchedulerContext`](crate::SchedulerContext).
///
/// Every component instance scheduler created by the context receives its own
/// copy of this configuration.
#[derive(Clone)]
pub struct Config {
    pub(crate) resolved_fast_path: bool,
    pub(crate) max_table_handle: u32,
}

impl Config {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub fn new() -> Config {
        Config {
            resolved_fast_path: false,
            max_table_handle: MAX_HANDLE,
        }
    }

    /// Configures whether blocking on an awaitable which has already resolved
    /// skips the park/wake round trip.
    ///
    /// When enabled, `Task::block_on` returns immediately for an awaitable in
    /// the ready state, without giving other tasks parked on the same
    /// awaitable a chance to run first. When disabled every block goes through
    /// the scheduler, which keeps wake order strictly first-in first-out.
    ///
    /// This is `false` by default.
    pub fn resolved_fast_path(&mut self, enable: bool) -> &mut Self {
        self.resolved_fast_path = enable;
        self
    }

    /// Configures the exclusive upper bound on handles allocated by the handle
    /// tables of each component instance.
    ///
    /// Values larger than `1 << 30` are clamped since the canonical ABI keeps
    /// the upper bits of a handle free for use by the component.
    pub fn max_table_handle(&mut self, max: u32) -> &mut Self {
        self.max_table_handle = max.min(MAX_HANDLE);
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("resolved_fast_path", &self.resolved_fast_path)
            .field("max_table_handle", &self.max_table_handle)
            .finish()
    }
}
