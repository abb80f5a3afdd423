use std::fmt;

/// Where the worker thread count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSource {
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

impl fmt::Display for CpuSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuSource::Env => "MY_CPU_LIMIT",
            CpuSource::CgroupV2 => "cgroup v2",
            CpuSource::CgroupV1 => "cgroup v1",
            CpuSource::Host => "host",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerThreads {
    pub threads: usize,
    pub source: CpuSource,
}

/// Size the tokio worker pool from the container CPU limit.
///
/// Detection order: `MY_CPU_LIMIT` ("4" or "4000m"), cgroup v2 `cpu.max`,
/// cgroup v1 CFS quota/period, then the host CPU count. Fractional limits
/// round up; the result is never below 1.
///
/// Runs before tracing is initialised; the caller logs the outcome.
pub fn detect_worker_threads() -> WorkerThreads {
    detect_with(
        |key| std::env::var(key).ok(),
        |path| std::fs::read_to_string(path).ok(),
        || {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        },
    )
}

fn detect_with(
    env: impl Fn(&str) -> Option<String>,
    read: impl Fn(&str) -> Option<String>,
    host: impl Fn() -> usize,
) -> WorkerThreads {
    let found = |threads: usize, source| WorkerThreads {
        threads: threads.max(1),
        source,
    };

    if let Some(threads) = env("MY_CPU_LIMIT").and_then(|v| parse_cpu_value(&v)) {
        return found(threads, CpuSource::Env);
    }

    if let Some(threads) = read("/sys/fs/cgroup/cpu.max").and_then(|v| parse_cgroup_v2_cpu(&v)) {
        return found(threads, CpuSource::CgroupV2);
    }

    let v1 = read("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .zip(read("/sys/fs/cgroup/cpu/cpu.cfs_period_us"))
        .and_then(|(quota, period)| quota_to_threads(&quota, &period));
    if let Some(threads) = v1 {
        return found(threads, CpuSource::CgroupV1);
    }

    found(host(), CpuSource::Host)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m.div_ceil(1000)),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period", or "max period" when unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    quota_to_threads(quota, period)
}

fn quota_to_threads(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota as u64).div_ceil(period as u64) as usize)
    } else {
        None
    }
}
