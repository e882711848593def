//! Memory sizing for the pyramid store

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Assumed when the platform offers no way to ask.
const FALLBACK_AVAILABLE_GB: f64 = 8.0;

/// `MemAvailable` from the contents of `/proc/meminfo`, in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn meminfo_available_bytes(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let mut fields = line.split_whitespace().skip(1);
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

#[cfg(target_os = "linux")]
fn platform_available_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo_available_bytes(&meminfo)
}

/// Physical memory size; macOS has no cheap "available" figure.
#[cfg(target_os = "macos")]
fn platform_available_bytes() -> Option<u64> {
    let output = std::process::Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()?;
    String::from_utf8(output.stdout).ok()?.trim().parse().ok()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_available_bytes() -> Option<u64> {
    None
}

/// Memory the store may plan with, in GiB.
pub fn available_memory_gb() -> f64 {
    match platform_available_bytes() {
        Some(bytes) => bytes as f64 / GIB,
        None => {
            log::warn!(
                "Could not determine available memory, assuming {} GB",
                FALLBACK_AVAILABLE_GB
            );
            FALLBACK_AVAILABLE_GB
        }
    }
}

/// Levels one image contributes to the store: Gaussian and mask levels
/// `0..=depth` plus Laplacian levels `0..depth`.
pub fn levels_per_image(depth: usize) -> usize {
    3 * depth + 2
}

/// Bytes of one full pyramid (colour Gaussian, colour Laplacian, mask) of an
/// image of the given size, with `f32` samples.
pub fn estimate_pyramid_bytes(width: usize, height: usize, depth: usize) -> u64 {
    let (mut w, mut h) = (width as u64, height as u64);
    let mut total = 0u64;
    for level in 0..=depth {
        let per_pixel = if level < depth { 3 + 3 + 1 } else { 3 + 1 };
        total += w * h * per_pixel * 4;
        w = w.div_ceil(2);
        h = h.div_ceil(2);
    }
    total
}

/// How many pyramid levels the store keeps resident before spilling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentBudget {
    pub levels: usize,
}

impl ResidentBudget {
    const MAX_LEVELS: usize = 4096;

    pub fn calculate(
        available_gb: f64,
        width: usize,
        height: usize,
        depth: usize,
        max_concurrency: usize,
    ) -> Self {
        // Conservative allocation: half the available RAM, minus the
        // working copies held by concurrent workers
        let usable = available_gb * 0.5 * GIB;
        let per_image = estimate_pyramid_bytes(width, height, depth).max(1) as f64;
        let store_bytes = (usable - per_image * max_concurrency as f64).max(0.0);

        let per_level = per_image / levels_per_image(depth) as f64;
        let fit = (store_bytes / per_level) as usize;

        // Every in-flight worker keeps its own pyramid resident while it
        // builds.
        let floor = levels_per_image(depth) * max_concurrency.max(1);
        let levels = fit.clamp(floor, Self::MAX_LEVELS.max(floor));

        log::info!(
            "Resident budget: {:.2} GB available, {:.1} MB per pyramid, {} levels resident",
            available_gb,
            per_image / (1024.0 * 1024.0),
            levels
        );

        Self { levels }
    }

    pub fn for_image(width: usize, height: usize, depth: usize, max_concurrency: usize) -> Self {
        Self::calculate(available_memory_gb(), width, height, depth, max_concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_bytes_small_image() {
        // 4x2 -> 2x1 base: 8 px * 7 ch + 2 px * 4 ch, four bytes each
        assert_eq!(estimate_pyramid_bytes(4, 2, 1), (8 * 7 + 2 * 4) * 4);
    }

    #[test]
    fn test_budget_holds_a_pyramid_per_worker() {
        let budget = ResidentBudget::calculate(0.1, 6000, 4000, 6, 8);
        assert_eq!(budget.levels, levels_per_image(6) * 8);
        assert_eq!(budget.levels, 160);

        // The floor wins over the ceiling for deep pyramids and many workers.
        let budget = ResidentBudget::calculate(64.0, 16, 16, 40, 64);
        assert_eq!(budget.levels, levels_per_image(40) * 64);
    }

    #[test]
    fn test_meminfo_parsing() {
        let meminfo = "MemTotal:       32768000 kB\nMemFree:         1000000 kB\nMemAvailable:   16384000 kB\n";
        assert_eq!(meminfo_available_bytes(meminfo), Some(16_384_000 * 1024));
        assert_eq!(meminfo_available_bytes("MemTotal: 1 kB\n"), None);
        assert_eq!(meminfo_available_bytes("MemAvailable: lots kB\n"), None);
    }

    #[test]
    fn test_budget_capped_for_tiny_images() {
        let budget = ResidentBudget::calculate(64.0, 16, 16, 2, 1);
        assert_eq!(budget.levels, ResidentBudget::MAX_LEVELS);
    }
}
