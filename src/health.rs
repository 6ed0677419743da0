//! Load sampling and the periodic health report.
//!
//! The tick hook feeds the ready-task count into a [`LoadSampler`]; every
//! window the sum is turned into a load average with two implied decimals.
//! The statistics hook renders a [`HealthSnapshot`] on a decimated subset of
//! its calls. Neither path blocks or allocates.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU32, Ordering};

use heapless::String;

use crate::config::{REPORT_CAPACITY, REPORT_DECIMATION, STAT_TASK_RATE_HZ};
use crate::port::{CpuUsage, Kernel, TaskState};
use crate::time::ticks_to_millis;

const NO_LOAD: u32 = u32::MAX;

/// Fixed-point value in hundredths, printed as `D.DD`.
struct Hundredths(u32);

impl fmt::Display for Hundredths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Average ready-task count over one window, in hundredths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoadAverage(pub u32);

impl fmt::Display for LoadAverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Hundredths(self.0), f)
    }
}

/// Windowed accumulator of ready-task counts.
pub struct LoadSampler {
    window: u32,
    sum: AtomicU32,
    count: AtomicU32,
    load: AtomicU32,
}

impl LoadSampler {
    /// Sampler closing a window every `window` samples.
    pub const fn new(window: u32) -> Self {
        LoadSampler {
            window: if window == 0 { 1 } else { window },
            sum: AtomicU32::new(0),
            count: AtomicU32::new(0),
            load: AtomicU32::new(NO_LOAD),
        }
    }

    /// Add one sample. Returns the new average when this sample closed the
    /// window.
    pub fn sample(&self, ready: u32) -> Option<LoadAverage> {
        self.sum.fetch_add(ready, Ordering::Relaxed);
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.window {
            self.window_close()
        } else {
            None
        }
    }

    /// Turn the accumulated samples into a load average and start over.
    /// An empty window leaves the previous average in place.
    pub fn window_close(&self) -> Option<LoadAverage> {
        let count = self.count.swap(0, Ordering::Relaxed);
        let sum = self.sum.swap(0, Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        let load = (u64::from(sum) * 100 / u64::from(count)).min(u64::from(NO_LOAD - 1)) as u32;
        self.load.store(load, Ordering::Relaxed);
        Some(LoadAverage(load))
    }

    /// Latest load average; `None` until the first window has closed.
    pub fn read(&self) -> Option<LoadAverage> {
        match self.load.load(Ordering::Relaxed) {
            NO_LOAD => None,
            load => Some(LoadAverage(load)),
        }
    }

    pub fn window(&self) -> u32 {
        self.window
    }
}

/// Task counts by scheduling state.
///
/// Pending tasks count toward `total` only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskCensus {
    pub total: u32,
    pub ready: u32,
    pub sleeping: u32,
    pub suspended: u32,
}

impl TaskCensus {
    pub fn collect<K: Kernel>(kernel: &K) -> Self {
        let mut census = TaskCensus::default();
        kernel.for_each_task(&mut |_, state| census.count(state));
        census
    }

    pub fn count(&mut self, state: TaskState) {
        self.total += 1;
        match state {
            TaskState::Ready => self.ready += 1,
            TaskState::Delayed => self.sleeping += 1,
            s if s.is_suspended() => self.suspended += 1,
            _ => {}
        }
    }
}

/// Everything one health report shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub census: TaskCensus,
    pub load: Option<LoadAverage>,
    /// Load window length in milliseconds
    pub window_ms: u32,
    pub cpu: CpuUsage,
}

impl fmt::Display for HealthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.census;
        write!(
            f,
            "Tasks: {} total, {} Ready {} sleeping {} Suspended\r\n",
            c.total, c.ready, c.sleeping, c.suspended
        )?;
        f.write_str("Load Average:")?;
        match self.load {
            Some(load) => write!(f, "{}", load)?,
            None => f.write_str("-.--")?,
        }
        write!(f, "({}ms)\r\n", self.window_ms)?;
        write!(
            f,
            "CPU: {}%({}ms), {}%(Max)\r\n\r\n\r\n",
            Hundredths(u32::from(self.cpu.current)),
            1000 / STAT_TASK_RATE_HZ,
            Hundredths(u32::from(self.cpu.peak)),
        )
    }
}

pub struct HealthMonitor {
    sampler: LoadSampler,
    stat_calls: AtomicU32,
}

impl HealthMonitor {
    /// Monitor averaging the ready count over `window` ticks.
    pub const fn new(window: u32) -> Self {
        HealthMonitor {
            sampler: LoadSampler::new(window),
            stat_calls: AtomicU32::new(0),
        }
    }

    pub fn sampler(&self) -> &LoadSampler {
        &self.sampler
    }

    /// Kernel tick hook.
    pub fn on_tick<K: Kernel>(&self, kernel: &K) {
        if let Some(load) = self.sampler.sample(kernel.ready_count()) {
            os_log!(trace, "load average {}", load);
        }
    }

    pub fn snapshot<K: Kernel>(&self, kernel: &K) -> HealthSnapshot {
        HealthSnapshot {
            census: TaskCensus::collect(kernel),
            load: self.sampler.read(),
            window_ms: ticks_to_millis(self.sampler.window()),
            cpu: kernel.cpu_usage(),
        }
    }

    /// Statistics task hook. Every `REPORT_DECIMATION`-th call writes a
    /// report to `sink` and returns `true`. Sink errors and truncation are
    /// ignored.
    pub fn on_stat<K: Kernel, W: Write>(&self, kernel: &K, sink: &mut W) -> bool {
        let calls = self.stat_calls.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if calls % u32::from(REPORT_DECIMATION) != 0 {
            return false;
        }
        let mut report: String<REPORT_CAPACITY> = String::new();
        if write!(report, "{}", self.snapshot(kernel)).is_err() {
            os_log!(warn, "health report truncated");
        }
        let _ = sink.write_str(&report);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::host::HostKernel;

    fn run(sampler: &LoadSampler, samples: &[u32]) -> Option<LoadAverage> {
        samples.iter().filter_map(|&s| sampler.sample(s)).last()
    }

    #[test]
    fn one_ready_task_per_tick_is_one() {
        let sampler = LoadSampler::new(10);
        assert_eq!(run(&sampler, &[1; 10]), Some(LoadAverage(100)));
        assert_eq!(sampler.read(), Some(LoadAverage(100)));
        assert_eq!(std::format!("{}", LoadAverage(100)), "1.00");
    }

    #[test]
    fn idle_window_is_zero() {
        let sampler = LoadSampler::new(10);
        assert_eq!(run(&sampler, &[0; 10]), Some(LoadAverage(0)));
    }

    #[test]
    fn average_truncates() {
        let sampler = LoadSampler::new(3);
        assert_eq!(run(&sampler, &[1, 0, 0]), Some(LoadAverage(33)));
        assert_eq!(run(&sampler, &[2, 3, 2]), Some(LoadAverage(233)));
    }

    #[test]
    fn invalid_until_first_window() {
        let sampler = LoadSampler::new(4);
        assert_eq!(run(&sampler, &[5, 5, 5]), None);
        assert_eq!(sampler.read(), None);
        assert_eq!(sampler.window_close(), Some(LoadAverage(500)));
        assert_eq!(sampler.window_close(), None);
        assert_eq!(sampler.read(), Some(LoadAverage(500)));
    }

    #[test]
    fn census_classifies_states() {
        let kernel = HostKernel::new();
        kernel.add_task(1, TaskState::Ready);
        kernel.add_task(2, TaskState::Ready);
        kernel.add_task(3, TaskState::Delayed);
        kernel.add_task(4, TaskState::Suspended);
        kernel.add_task(5, TaskState::PendingTimeoutSuspended);
        kernel.add_task(6, TaskState::Pending);

        let census = TaskCensus::collect(&kernel);
        assert_eq!(
            census,
            TaskCensus {
                total: 6,
                ready: 2,
                sleeping: 1,
                suspended: 2,
            }
        );
    }

    #[test]
    fn report_format() {
        let snapshot = HealthSnapshot {
            census: TaskCensus {
                total: 7,
                ready: 2,
                sleeping: 3,
                suspended: 1,
            },
            load: Some(LoadAverage(125)),
            window_ms: 10,
            cpu: CpuUsage {
                current: 1234,
                peak: 5007,
            },
        };
        assert_eq!(
            std::format!("{}", snapshot),
            "Tasks: 7 total, 2 Ready 3 sleeping 1 Suspended\r\n\
             Load Average:1.25(10ms)\r\n\
             CPU: 12.34%(100ms), 50.07%(Max)\r\n\r\n\r\n"
        );

        let fresh = HealthSnapshot { load: None, ..snapshot };
        assert!(std::format!("{}", fresh).contains("Load Average:-.--(10ms)"));
    }

    #[test]
    fn tick_hook_samples_ready_tasks() {
        let kernel = HostKernel::new();
        kernel.add_task(1, TaskState::Ready);
        kernel.add_task(2, TaskState::Ready);
        kernel.add_task(3, TaskState::Delayed);
        let monitor = HealthMonitor::new(10);

        for _ in 0..10 {
            monitor.on_tick(&kernel);
        }
        assert_eq!(monitor.sampler().read(), Some(LoadAverage(200)));
        assert_eq!(monitor.snapshot(&kernel).census.total, 3);
    }

    #[test]
    fn stat_hook_is_decimated() {
        let kernel = HostKernel::new();
        kernel.set_cpu_usage(250, 900);
        let monitor = HealthMonitor::new(10);
        let mut out = std::string::String::new();

        let emitted = (0..2 * u32::from(REPORT_DECIMATION))
            .filter(|_| monitor.on_stat(&kernel, &mut out))
            .count();
        assert_eq!(emitted, 2);
        assert_eq!(out.matches("Tasks:").count(), 2);
        assert!(out.contains("CPU: 2.50%(100ms), 9.00%(Max)"));
    }
}
