//! VM sizing from OCI resource limits.

use oci_spec::runtime::Spec;

/// Sizing for a spec that carries no usable limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDefaults {
    pub vcpus: u8,
    pub memory_mib: u32,
}

/// vCPUs and memory of one sandbox VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxResources {
    pub vcpus: u8,
    pub memory_mib: u32,
}

/// Derive VM sizing from the spec's CPU quota and memory limit.
///
/// vCPUs are `ceil(quota / period)` when both are positive. Memory is the
/// limit in whole MiB. Anything missing, non-positive or rounding to zero
/// falls back to `defaults`.
pub fn derive_resources(spec: &Spec, defaults: &ResourceDefaults) -> SandboxResources {
    let resources = spec.linux().as_ref().and_then(|l| l.resources().as_ref());

    let vcpus = resources
        .and_then(|r| r.cpu().as_ref())
        .and_then(|cpu| {
            let quota = cpu.quota().as_ref().copied()?;
            let period = cpu.period().as_ref().copied()?;
            if quota <= 0 || period == 0 {
                return None;
            }
            let count = (quota as u64).div_ceil(period);
            Some(u8::try_from(count).unwrap_or(u8::MAX))
        })
        .unwrap_or(defaults.vcpus);

    let memory_mib = resources
        .and_then(|r| r.memory().as_ref())
        .and_then(|memory| memory.limit().as_ref().copied())
        .filter(|limit| *limit > 0)
        .map(|limit| u32::try_from(limit >> 20).unwrap_or(u32::MAX))
        .filter(|mib| *mib > 0)
        .unwrap_or(defaults.memory_mib);

    SandboxResources { vcpus, memory_mib }
}
