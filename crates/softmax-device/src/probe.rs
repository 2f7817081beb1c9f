//! Device discovery and target selection.
//!
//! The host CPU is always registered. An emulated GPU-class device is
//! registered in front of it when `SOFTMAX_GPU_FAKE` is set to `1`, `true`
//! or `gpu`, which lets tests exercise `DeviceTarget::Gpu` and the
//! GPU-first preference of `DeviceTarget::Default`.

use softmax_common::{DeviceTarget, Result, SoftmaxError};
use tracing::debug;

/// Environment switch that registers the emulated GPU-class device.
pub const GPU_FAKE_ENV: &str = "SOFTMAX_GPU_FAKE";

/// Largest work group the host CPU device accepts.
pub const HOST_MAX_WORK_GROUP: usize = 8192;
/// Work-group local memory on the host CPU device.
pub const HOST_LOCAL_MEM_BYTES: usize = 256 * 1024;
/// Largest work group the emulated GPU accepts.
pub const GPU_MAX_WORK_GROUP: usize = 1024;
/// Work-group local memory on the emulated GPU.
pub const GPU_LOCAL_MEM_BYTES: usize = 64 * 1024;

// ── Device descriptions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Capabilities of one device a context can bind to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    /// Worker threads backing the device (always ≥ 1).
    pub compute_units: usize,
    pub max_work_group_size: usize,
    pub local_mem_bytes: usize,
}

/// Describe the host CPU device.
pub fn probe_cpu() -> DeviceInfo {
    DeviceInfo {
        name: "host-cpu".into(),
        kind: DeviceKind::Cpu,
        compute_units: num_cpus::get().max(1),
        max_work_group_size: HOST_MAX_WORK_GROUP,
        local_mem_bytes: HOST_LOCAL_MEM_BYTES,
    }
}

/// Whether `SOFTMAX_GPU_FAKE` asks for an emulated GPU.
pub fn gpu_fake_enabled() -> bool {
    std::env::var(GPU_FAKE_ENV).is_ok_and(|v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "gpu")
    })
}

fn emulated_gpu() -> DeviceInfo {
    DeviceInfo {
        name: "emulated-gpu".into(),
        kind: DeviceKind::Gpu,
        compute_units: num_cpus::get().max(1),
        max_work_group_size: GPU_MAX_WORK_GROUP,
        local_mem_bytes: GPU_LOCAL_MEM_BYTES,
    }
}

/// All devices visible to this process, GPU-class devices first.
pub fn probe_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::with_capacity(2);
    if gpu_fake_enabled() {
        devices.push(emulated_gpu());
    }
    devices.push(probe_cpu());
    debug!(count = devices.len(), "probed devices");
    devices
}

/// Pick the device a context for `target` binds to.
///
/// # Errors
///
/// [`SoftmaxError::DeviceUnavailable`] when no listed device matches.
pub fn select_device(target: DeviceTarget, devices: &[DeviceInfo]) -> Result<DeviceInfo> {
    let find = |kind: DeviceKind| devices.iter().find(|d| d.kind == kind).cloned();
    let selected = match target {
        DeviceTarget::Cpu => find(DeviceKind::Cpu),
        DeviceTarget::Gpu => find(DeviceKind::Gpu),
        DeviceTarget::Default => find(DeviceKind::Gpu).or_else(|| find(DeviceKind::Cpu)),
    };
    selected.ok_or_else(|| SoftmaxError::DeviceUnavailable {
        target,
        reason: match target {
            DeviceTarget::Gpu => format!("no GPU-class device registered (set {GPU_FAKE_ENV}=1 to emulate one)"),
            _ => format!("none of {} probed device(s) match", devices.len()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn cpu_probe_has_compute_units() {
        let cpu = probe_cpu();
        assert!(cpu.compute_units >= 1);
        assert_eq!(cpu.kind, DeviceKind::Cpu);
    }

    #[test]
    fn gpu_target_fails_without_gpu() {
        let err = select_device(DeviceTarget::Gpu, &[probe_cpu()]).unwrap_err();
        assert!(matches!(err, SoftmaxError::DeviceUnavailable { target: DeviceTarget::Gpu, .. }));
    }

    #[test]
    fn default_prefers_gpu() {
        let devices = [probe_cpu(), emulated_gpu()];
        assert_eq!(select_device(DeviceTarget::Default, &devices).unwrap().kind, DeviceKind::Gpu);
        assert_eq!(select_device(DeviceTarget::Cpu, &devices).unwrap().kind, DeviceKind::Cpu);
    }

    #[test]
    fn default_falls_back_to_cpu() {
        let selected = select_device(DeviceTarget::Default, &[probe_cpu()]).unwrap();
        assert_eq!(selected.name, "host-cpu");
    }

    #[test]
    fn empty_device_list_is_unavailable() {
        assert!(select_device(DeviceTarget::Cpu, &[]).is_err());
    }

    #[test]
    #[serial(softmax_env)]
    fn fake_env_registers_gpu() {
        temp_env::with_var(GPU_FAKE_ENV, Some("gpu"), || {
            let devices = probe_devices();
            assert_eq!(devices.len(), 2);
            assert_eq!(devices[0].kind, DeviceKind::Gpu);
        });
        temp_env::with_var(GPU_FAKE_ENV, Some("0"), || {
            assert_eq!(probe_devices().len(), 1);
        });
    }
}
