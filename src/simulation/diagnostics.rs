use std::{
    collections::HashMap,
    fmt::Write,
    time::{Duration, Instant},
};

use crate::floating_type_mod::FT;

#[derive(Clone)]
pub struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}

impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }

    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

}

impl Counter<FT> {
    pub fn avg(&self) -> FT {
        if self.values.is_empty() {
            return 0.;
        }
        self.values.iter().cloned().sum::<FT>() / self.values.len() as FT
    }

    pub fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::MAX, FT::min)
    }

    pub fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::MIN, FT::max)
    }
}

impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(Instant::now() - self.last_start);
    }

    pub fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::ZERO;
        }
        self.sum() / self.values.len() as u32
    }

    pub fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

pub struct ValueCounters {
    counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}

impl ValueCounters {
    pub fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .add_value(v);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<FT>> {
        self.counters.get(id)
    }
}

/// Wall clock timings by label, recorded only with statistics enabled.
pub struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}

impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    pub fn end(&mut self, id: &str) {
        if !self.enabled {
            return;
        }
        match self.counters.get_mut(id) {
            Some(counter) => counter.end(),
            None => log::warn!("performance counter `{}` ended without begin", id),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Counter<Duration>> {
        self.counters.get(id)
    }
}

/// Instantaneous rate derived from the wall time of one frame.
pub fn frames_per_second(frame_time: Duration) -> f64 {
    if frame_time.is_zero() {
        return 0.;
    }
    1. / frame_time.as_secs_f64()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameDiagnostics {
    pub frame_number: u64,
    pub simulated_time: f64,
    pub particle_count: usize,
    pub fps: f64,
    /// Wall time of the last frame including presentation.
    pub frame_time: Duration,
    /// Time spent on the host side (event polling, drawing).
    pub cpu_time: Duration,
    /// Time spent in the three stage dispatches.
    pub gpu_time: Duration,
}

impl FrameDiagnostics {
    pub fn title_line(&self) -> String {
        format!(
            "frame #{}|simulationTime(sec):{:.4}|particleCount:{}|fps:{:.1}|frame_time(ms):{:.3}|cpu_time(ms){:.3}|gpu_time(ms){:.3}",
            self.frame_number,
            self.simulated_time,
            self.particle_count,
            self.fps,
            self.frame_time.as_secs_f64() * 1000.,
            self.cpu_time.as_secs_f64() * 1000.,
            self.gpu_time.as_secs_f64() * 1000.,
        )
    }
}

pub fn write_statistics(pcounters: &PerformanceCounters, vcounters: &ValueCounters) -> String {
    let mut s = String::new();

    if let Some(frame) = pcounters.get("frame") {
        let _ = writeln!(
            s,
            "simulation-time: {:.3}ms over {} frames",
            frame.sum().as_secs_f64() * 1000.,
            frame.len()
        );
        let _ = writeln!(s);
    }

    let mut v: Vec<_> = pcounters.counters.iter().collect();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        let _ = writeln!(s, "{}: avg:{:.4}ms", label, pcounter.avg().as_secs_f64() * 1000.);
    }

    if !vcounters.counters.is_empty() {
        let _ = writeln!(s);
    }
    let mut v: Vec<_> = vcounters.counters.iter().collect();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        let _ = writeln!(
            s,
            "{}: avg:{} min:{} max:{}",
            label,
            vcounter.avg(),
            vcounter.min(),
            vcounter.max()
        );
    }

    s
}

#[test]
fn title_line_follows_window_title_layout() {
    let diagnostics = FrameDiagnostics {
        frame_number: 12,
        simulated_time: 0.0012,
        particle_count: 20000,
        fps: 59.94,
        frame_time: Duration::from_micros(16500),
        cpu_time: Duration::from_micros(500),
        gpu_time: Duration::from_millis(16),
    };
    assert_eq!(
        diagnostics.title_line(),
        "frame #12|simulationTime(sec):0.0012|particleCount:20000|fps:59.9|frame_time(ms):16.500|cpu_time(ms)0.500|gpu_time(ms)16.000"
    );
}

#[test]
fn disabled_counters_record_nothing() {
    let mut pcounters = PerformanceCounters::new(false);
    let mut vcounters = ValueCounters::new(false);
    pcounters.begin("density-pressure");
    pcounters.end("density-pressure");
    vcounters.add_value("max-speed", 1.);

    assert!(pcounters.get("density-pressure").is_none());
    assert!(vcounters.get("max-speed").is_none());
    assert_eq!(write_statistics(&pcounters, &vcounters), "");
}

#[test]
fn statistics_list_counters_sorted() {
    let mut pcounters = PerformanceCounters::new(true);
    let mut vcounters = ValueCounters::new(true);
    for id in ["integration", "frame", "density-pressure"] {
        pcounters.begin(id);
        pcounters.end(id);
    }
    vcounters.add_value("max-speed", 1.);
    vcounters.add_value("max-speed", 3.);

    let counter = vcounters.get("max-speed").unwrap();
    assert_eq!(counter.avg(), 2.);
    assert_eq!(counter.min(), 1.);
    assert_eq!(counter.max(), 3.);

    let s = write_statistics(&pcounters, &vcounters);
    let density = s.find("density-pressure: avg").unwrap();
    let integration = s.find("integration: avg").unwrap();
    assert!(s.starts_with("simulation-time:"));
    assert!(density < integration);
    assert!(s.contains("max-speed: avg:2 min:1 max:3"));
}

#[test]
fn fps_follows_the_last_frame_time() {
    assert_eq!(frames_per_second(Duration::from_millis(20)), 50.);
    assert_eq!(frames_per_second(Duration::from_micros(500)), 2000.);
    assert_eq!(frames_per_second(Duration::ZERO), 0.);
}
