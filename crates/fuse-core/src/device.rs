use std::fmt;
use std::sync::OnceLock;

/// Compute device a stream schedules work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host CPU (fused kernels run here, row-parallel via rayon)
    #[default]
    Cpu,
    /// CUDA GPU with device index
    Cuda(usize),
}

impl Device {
    /// Whether this is a CPU device.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Get the CUDA device index, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }

    /// What this device can execute besides primitive array ops.
    pub fn caps(&self) -> DeviceCaps {
        match self {
            Device::Cpu => DeviceCaps {
                fused_kernels: true,
                kernel_compilation: false,
                simd: SimdTier::detect(),
            },
            Device::Cuda(_) => DeviceCaps {
                fused_kernels: false,
                kernel_compilation: cfg!(feature = "cuda"),
                simd: SimdTier::None,
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

/// An ordered execution queue on one device.
///
/// Every graph node is pinned to exactly one stream when it is built and is
/// realized there; nodes are never migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stream {
    pub index: usize,
    pub device: Device,
}

impl Stream {
    pub fn new(index: usize, device: Device) -> Self {
        Self { index, device }
    }

    /// The default (index 0) stream of `device`.
    pub fn default_for(device: Device) -> Self {
        Self { index: 0, device }
    }

    pub fn caps(&self) -> DeviceCaps {
        self.device.caps()
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream({}, {})", self.index, self.device)
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Host SIMD tier detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimdTier {
    None,
    Neon,
    Avx2,
    Avx512,
}

static DETECTED: OnceLock<SimdTier> = OnceLock::new();

impl SimdTier {
    /// Detect the best SIMD tier of the current CPU (cached).
    pub fn detect() -> SimdTier {
        *DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            {
                if is_x86_feature_detected!("avx512f") {
                    SimdTier::Avx512
                } else if is_x86_feature_detected!("avx2") {
                    SimdTier::Avx2
                } else {
                    SimdTier::None
                }
            }

            #[cfg(target_arch = "aarch64")]
            {
                SimdTier::Neon
            }

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            {
                SimdTier::None
            }
        })
    }
}

impl fmt::Display for SimdTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimdTier::None => write!(f, "scalar"),
            SimdTier::Neon => write!(f, "NEON"),
            SimdTier::Avx2 => write!(f, "AVX2"),
            SimdTier::Avx512 => write!(f, "AVX-512"),
        }
    }
}

/// Capability flags the dispatch policy consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Device has hand-written fused kernels for the built-in operators.
    pub fused_kernels: bool,
    /// Device can compile and launch user kernel source at runtime.
    pub kernel_compilation: bool,
    pub simd: SimdTier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_cuda());
        assert!(Device::Cuda(0).is_cuda());
        assert_eq!(Device::Cuda(1).cuda_index(), Some(1));
        assert_eq!(Device::Cpu.cuda_index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Cpu), "cpu");
        assert_eq!(format!("{}", Device::Cuda(0)), "cuda:0");
        assert_eq!(format!("{}", Stream::new(2, Device::Cuda(1))), "stream(2, cuda:1)");
    }

    #[test]
    fn test_default_stream() {
        let s = Stream::default();
        assert_eq!(s.device, Device::Cpu);
        assert_eq!(s.index, 0);
        assert_eq!(Stream::default_for(Device::Cuda(3)).device, Device::Cuda(3));
    }

    #[test]
    fn test_cpu_caps() {
        let caps = Device::Cpu.caps();
        assert!(caps.fused_kernels);
        assert!(!caps.kernel_compilation);
        assert_eq!(caps.simd, SimdTier::detect());
    }

    #[test]
    fn test_cuda_caps_have_no_host_kernels() {
        assert!(!Device::Cuda(0).caps().fused_kernels);
    }
}
