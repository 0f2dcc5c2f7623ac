//! Local resource probes feeding the health sampler.

/// Normalized resource usage for this host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// 1-minute load average divided by core count, clamped to [0, 1].
    pub cpu_load_fraction: f64,
    /// Fraction of physical memory in use, clamped to [0, 1].
    pub memory_used_fraction: f64,
}

/// Source of local resource usage.
pub trait ResourceProbe: Send + Sync {
    fn usage(&self) -> ResourceUsage;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn usage(&self) -> ResourceUsage {
        SystemResources::measure().usage()
    }
}

/// Probe returning a fixed reading.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub ResourceUsage);

impl FixedProbe {
    pub fn new(cpu_load_fraction: f64, memory_used_fraction: f64) -> Self {
        Self(ResourceUsage {
            cpu_load_fraction,
            memory_used_fraction,
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn usage(&self) -> ResourceUsage {
        self.0
    }
}

/// Raw host measurements.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: u32,
    pub load_average_1m: f64,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let load_average_1m = get_load_average();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            load_average_1m,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }

    pub fn usage(&self) -> ResourceUsage {
        let cores = f64::from(self.cpu_cores.max(1));
        let cpu_load_fraction = (self.load_average_1m / cores).clamp(0.0, 1.0);

        let memory_used_fraction = if self.total_memory_bytes == 0 {
            0.0
        } else {
            let used = self
                .total_memory_bytes
                .saturating_sub(self.available_memory_bytes);
            (used as f64 / self.total_memory_bytes as f64).clamp(0.0, 1.0)
        };

        ResourceUsage {
            cpu_load_fraction,
            memory_used_fraction,
        }
    }
}

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

fn get_load_average() -> f64 {
    #[cfg(unix)]
    {
        let mut loads = [0f64; 3];
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n >= 1 {
            return loads[0];
        }
    }

    0.0
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, available) = parse_meminfo(&meminfo);
        if total > 0 {
            return (total, available);
        }
    }

    sysconf_memory()
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    sysconf_memory()
}

fn sysconf_memory() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size as u64) * (total_pages as u64);
            // No portable "available" figure; assume half in use.
            return (total, total / 2);
        }
    }

    (0, 0)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    const KB_TO_BYTES: u64 = 1024;

    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(raw)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = raw.parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
        match name {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}
