//! Raw memory readings.
//!
//! The production sampler parses `/proc/self/status` (Linux). Memory held by
//! worker processes is accounted through [`WorkerMemoryGauge`], which the pool
//! updates every enforcement tick.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// One raw reading, all values in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawMemory {
    pub heap_used: u64,
    pub heap_total: u64,
    pub resident_set_size: u64,
    /// Memory attributed to worker processes.
    pub external: u64,
}

impl RawMemory {
    /// Footprint counted against the ceiling.
    pub fn accounted(&self) -> u64 {
        self.resident_set_size.saturating_add(self.external)
    }
}

/// Source of raw memory readings.
pub trait MemorySampler: Send + Sync {
    fn read(&self) -> Result<RawMemory>;
}

/// Aggregate footprint of live workers, written by the pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerMemoryGauge(Arc<AtomicU64>);

impl WorkerMemoryGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reads the coordinator's own status from procfs.
#[derive(Debug, Clone, Default)]
pub struct ProcSampler {
    workers: WorkerMemoryGauge,
}

impl ProcSampler {
    pub fn new(workers: WorkerMemoryGauge) -> Self {
        Self { workers }
    }
}

impl MemorySampler for ProcSampler {
    fn read(&self) -> Result<RawMemory> {
        let status = read_status(Path::new("/proc/self/status"))?;
        Ok(RawMemory {
            heap_used: status.rss_anon,
            heap_total: status.vm_data,
            resident_set_size: status.vm_rss,
            external: self.workers.get(),
        })
    }
}

/// Fields of interest from a `/proc/<pid>/status` file, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub vm_rss: u64,
    pub vm_data: u64,
    pub rss_anon: u64,
}

/// Read and parse a procfs status file.
pub fn read_status(path: &Path) -> Result<ProcStatus> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Sample(format!("read {}: {e}", path.display())))?;
    let status = parse_status(&raw);
    if status.vm_rss == 0 {
        return Err(Error::Sample(format!("no VmRSS in {}", path.display())));
    }
    Ok(status)
}

/// Resident set size of another process, if it can be read.
pub fn resident_bytes(pid: u32) -> Option<u64> {
    read_status(Path::new(&format!("/proc/{pid}/status")))
        .ok()
        .map(|s| s.vm_rss)
}

fn parse_status(raw: &str) -> ProcStatus {
    let mut status = ProcStatus::default();
    for line in raw.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key {
            "VmRSS" => &mut status.vm_rss,
            "VmData" => &mut status.vm_data,
            "RssAnon" => &mut status.rss_anon,
            _ => continue,
        };
        *slot = parse_kib(rest).unwrap_or(0);
    }
    status
}

fn parse_kib(field: &str) -> Option<u64> {
    let mut parts = field.split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Name:\twarden\nVmPeak:\t  200000 kB\nVmData:\t   51200 kB\nVmRSS:\t   10240 kB\nRssAnon:\t    8192 kB\nRssFile:\t    2048 kB\nThreads:\t4\n";

    #[test]
    fn parses_status_fields() {
        let status = parse_status(SAMPLE);
        assert_eq!(status.vm_rss, 10240 * 1024);
        assert_eq!(status.vm_data, 51200 * 1024);
        assert_eq!(status.rss_anon, 8192 * 1024);
    }

    #[test]
    fn ignores_unexpected_units() {
        assert_eq!(parse_kib(" 12 MB"), None);
        assert_eq!(parse_kib(" 12 kB"), Some(12 * 1024));
    }

    #[test]
    fn accounted_includes_workers() {
        let raw = RawMemory {
            resident_set_size: 100,
            external: 50,
            ..Default::default()
        };
        assert_eq!(raw.accounted(), 150);
    }

    #[test]
    fn missing_file_is_a_sample_error() {
        let err = read_status(Path::new("/definitely/not/here/status")).unwrap_err();
        assert!(matches!(err, Error::Sample(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_sampler_reads_self() {
        let gauge = WorkerMemoryGauge::new();
        gauge.set(4096);
        let raw = ProcSampler::new(gauge).read().unwrap();
        assert!(raw.resident_set_size > 0);
        assert_eq!(raw.external, 4096);
    }
}
