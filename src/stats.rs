use log::info;

/// Per-worker counters. Written only by the owning worker thread, so no
/// atomics are needed (mirrors the kit's `worker_stats_t`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub processed: u64,
    pub problems: u64,
    pub checked_waiting: u64,
    pub served_waiting: u64,
    pub checked_input: u64,
    pub served_input: u64,
    pub condex_sleep: u64,
    pub failed_sleep: u64,
}

impl WorkerStats {
    pub fn print(&self, name: &str) {
        info!(
            "[{}] processed={} problems={} checked_waiting={} served_waiting={} \
             checked_input={} served_input={} condex_sleep={} failed_sleep={}",
            name,
            self.processed,
            self.problems,
            self.checked_waiting,
            self.served_waiting,
            self.checked_input,
            self.served_input,
            self.condex_sleep,
            self.failed_sleep
        );
    }

    pub fn print_and_reset(&mut self, name: &str) {
        self.print(name);
        *self = WorkerStats::default();
    }
}

/// Flusher counters (see SPEC_FULL §4.8 / §4.9).
#[derive(Debug, Default, Clone, Copy)]
pub struct FlusherStats {
    pub finalized: u64,
    pub flushes: u64,
}

impl FlusherStats {
    pub fn xcts_per_flush(&self) -> f64 {
        if self.flushes == 0 {
            0.0
        } else {
            self.finalized as f64 / self.flushes as f64
        }
    }

    pub fn print(&self) {
        info!(
            "xcts={} flushes={} xcts/flush={:.2}",
            self.finalized,
            self.flushes,
            self.xcts_per_flush()
        );
    }
}

/// Best-effort processor affinity. Binding is only attempted on Linux,
/// where `sched_setaffinity` is available through `libc`; elsewhere (and on
/// any failure) the worker simply logs and keeps running unbound.
#[cfg(target_os = "linux")]
pub fn bind_to_processor(cpu_id: u32) -> bool {
    use log::warn;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_id as usize, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!("cannot bind to processor {}", cpu_id);
            return false;
        }
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_processor(cpu_id: u32) -> bool {
    log::warn!("processor binding unsupported on this platform, staying unbound (cpu {})", cpu_id);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xcts_per_flush_handles_zero_flushes() {
        let stats = FlusherStats::default();
        assert_eq!(stats.xcts_per_flush(), 0.0);
    }

    #[test]
    fn xcts_per_flush_divides() {
        let stats = FlusherStats { finalized: 50, flushes: 2 };
        assert_eq!(stats.xcts_per_flush(), 25.0);
    }
}
