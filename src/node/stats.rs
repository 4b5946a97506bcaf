//! Process health sampling
//!
//! The tick loop feeds each tick's idle time in; a slave turns the gathered
//! snapshot into a `SlaveHealthReport` when the master asks for one.

use std::collections::VecDeque;
use std::time::Instant;

use crate::net::protocol::HealthReport;

/// Idle samples kept for the rolling average
pub const IDLE_WINDOW: usize = 100;

/// Assumed kernel clock tick rate for /proc CPU times
const CLOCK_TICKS_PER_SEC: f64 = 100.0;
const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthSnapshot {
    /// Negative when the loop is lagging on average
    pub avg_tick_idle_us: i64,
    pub num_good_ticks: u64,
    pub num_lag_ticks: u64,
    pub pct_ram_used: u16,
    pub pct_cpu: u16,
}

impl HealthSnapshot {
    pub fn lag_percent(&self) -> u16 {
        let total = self.num_good_ticks + self.num_lag_ticks;
        if total == 0 {
            return 0;
        }
        (self.num_lag_ticks * 100 / total) as u16
    }

    pub fn to_report(&self, num_players: u32) -> HealthReport {
        HealthReport {
            pct_ram_used: self.pct_ram_used,
            pct_lag_ticks: self.lag_percent(),
            avg_tick_idle_us: self.avg_tick_idle_us,
            pct_cpu: self.pct_cpu,
            num_good_ticks: self.num_good_ticks,
            num_lag_ticks: self.num_lag_ticks,
            num_players,
        }
    }
}

/// Source of process health data
pub trait HealthSource: Send {
    /// Record how long the loop slept after a tick; negative means it overran
    fn record_tick_idle(&mut self, idle_us: i64);

    fn gather(&mut self) -> HealthSnapshot;
}

/// Health source backed by the tick loop and `/proc`
#[derive(Debug)]
pub struct ProcessStats {
    idle: VecDeque<i64>,
    good_ticks: u64,
    lag_ticks: u64,
    last_cpu: Option<(Instant, u64)>,
}

impl ProcessStats {
    pub fn new() -> Self {
        Self {
            idle: VecDeque::with_capacity(IDLE_WINDOW),
            good_ticks: 0,
            lag_ticks: 0,
            last_cpu: None,
        }
    }

    pub fn average_idle_us(&self) -> i64 {
        if self.idle.is_empty() {
            return 0;
        }
        self.idle.iter().sum::<i64>() / self.idle.len() as i64
    }

    fn cpu_percent(&mut self) -> u16 {
        let Some(ticks) = read_process_cpu_ticks() else {
            return 0;
        };
        let now = Instant::now();
        let pct = match self.last_cpu {
            Some((then, prev)) => {
                let wall = now.duration_since(then).as_secs_f64();
                if wall <= 0.0 {
                    0.0
                } else {
                    (ticks.saturating_sub(prev) as f64 / CLOCK_TICKS_PER_SEC) / wall * 100.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((now, ticks));
        pct.clamp(0.0, u16::MAX as f64) as u16
    }
}

impl Default for ProcessStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSource for ProcessStats {
    fn record_tick_idle(&mut self, idle_us: i64) {
        if self.idle.len() == IDLE_WINDOW {
            self.idle.pop_front();
        }
        self.idle.push_back(idle_us);
        if idle_us > 0 {
            self.good_ticks += 1;
        } else {
            self.lag_ticks += 1;
        }
    }

    fn gather(&mut self) -> HealthSnapshot {
        HealthSnapshot {
            avg_tick_idle_us: self.average_idle_us(),
            num_good_ticks: self.good_ticks,
            num_lag_ticks: self.lag_ticks,
            pct_ram_used: read_ram_percent().unwrap_or(0),
            pct_cpu: self.cpu_percent(),
        }
    }
}

/// Resident memory of this process as a share of physical memory
fn read_ram_percent() -> Option<u16> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;

    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let total_kb: u64 = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    if total_kb == 0 {
        return None;
    }
    Some((resident_pages * PAGE_SIZE * 100 / (total_kb * 1024)) as u16)
}

/// utime + stime of this process in clock ticks
fn read_process_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The command name may contain spaces; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}
