use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use log::info;




/**
 * A timed event recorded by the driver or the coupling phases.
 */
pub enum MetricEvent {
    /// Wall time spent in a named phase.
    Work(&'static str, Instant, Instant),
    /// Wall time spent waiting in a collective.
    Network(Instant, Instant),
}




/**
 * Accumulates wall time per named phase. Owned by the driver and passed to
 * every phase through [`crate::context::Context`].
 */
#[derive(Default)]
pub struct Profiler {
    totals: BTreeMap<&'static str, (u64, Duration)>,
    network: Duration,
}




// ============================================================================
impl Profiler {


    pub fn record(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::Work(name, start, end) => {
                let entry = self.totals.entry(name).or_default();
                entry.0 += 1;
                entry.1 += end.saturating_duration_since(start);
            }
            MetricEvent::Network(start, end) => {
                self.network += end.saturating_duration_since(start);
            }
        }
    }


    /**
     * Run the closure, charging its wall time to the named phase.
     */
    pub fn time<R, F: FnOnce() -> R>(&mut self, name: &'static str, f: F) -> R {
        let start = Instant::now();
        let result = f();
        self.record(MetricEvent::Work(name, start, Instant::now()));
        result
    }


    /**
     * Number of calls and total time charged to the named phase.
     */
    pub fn total(&self, name: &str) -> Option<(u64, Duration)> {
        self.totals.get(name).copied()
    }


    pub fn network(&self) -> Duration {
        self.network
    }


    pub fn log_summary(&self) {
        for (name, (calls, total)) in &self.totals {
            info!(
                "{:<24} {:>8} calls {:>12.6} s total {:>12.3e} s/call",
                name,
                calls,
                total.as_secs_f64(),
                total.as_secs_f64() / *calls as f64);
        }
        if self.network > Duration::ZERO {
            info!("{:<24} {:>12.6} s", "collectives", self.network.as_secs_f64());
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::time::{Duration, Instant};
    use super::{MetricEvent, Profiler};

    #[test]
    fn profiler_accumulates_per_phase() {
        let mut profiler = Profiler::default();
        assert_eq!(profiler.time("create", || 3), 3);
        profiler.time("create", || ());

        let start = Instant::now();
        profiler.record(MetricEvent::Work("update", start, start + Duration::from_millis(5)));
        profiler.record(MetricEvent::Network(start, start + Duration::from_millis(2)));

        assert_eq!(profiler.total("create").unwrap().0, 2);
        assert_eq!(profiler.total("update").unwrap().1, Duration::from_millis(5));
        assert_eq!(profiler.network(), Duration::from_millis(2));
        assert!(profiler.total("forces").is_none());
    }
}
