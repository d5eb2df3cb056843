//! Runtime compilation and launch of caller-supplied kernels.
//!
//! Source is compiled with NVRTC the first time a module name is seen on a
//! device; later launches reuse the loaded module. Buffers are staged from
//! host bytes, one device pointer per input and output, in signature order.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, DeviceRepr, LaunchAsync, LaunchConfig};
use parking_lot::Mutex;

use super::context::{get_device, CudaError};

/// Registry of loaded modules. Key: (device_idx, module_name)
static LOADED: OnceLock<Mutex<HashSet<(usize, String)>>> = OnceLock::new();

fn loaded_set() -> &'static Mutex<HashSet<(usize, String)>> {
    LOADED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Compile and load `source` as `module_name` exposing `func_name`.
/// No-op if already loaded on this device.
pub fn ensure_module(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    module_name: &str,
    func_name: &str,
    source: &str,
) -> Result<(), CudaError> {
    let key = (device_idx, module_name.to_string());
    let mut set = loaded_set().lock();
    if set.contains(&key) {
        return Ok(());
    }

    let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| CudaError::Compile {
        module: module_name.to_string(),
        msg: e.to_string(),
    })?;

    // the driver keeps function names for the lifetime of the module; modules
    // are never unloaded so the name is leaked once per (device, module)
    let func: &'static str = Box::leak(func_name.to_string().into_boxed_str());
    device
        .load_ptx(ptx, module_name, &[func])
        .map_err(|e| CudaError::ModuleLoad {
            module: module_name.to_string(),
            msg: e.to_string(),
        })?;

    tracing::debug!(device_idx, module = module_name, "compiled kernel module");
    set.insert(key);
    Ok(())
}

/// Get a kernel function handle, compiling the module if needed.
pub fn get_or_load_func(
    device: &Arc<CudaDevice>,
    device_idx: usize,
    module_name: &str,
    func_name: &str,
    source: &str,
) -> Result<CudaFunction, CudaError> {
    ensure_module(device, device_idx, module_name, func_name, source)?;
    device
        .get_func(module_name, func_name)
        .ok_or_else(|| CudaError::FuncNotFound {
            module: module_name.to_string(),
            func: func_name.to_string(),
        })
}

/// Launch configuration from a total thread grid and a per-block thread
/// count. The grid counts threads, so block counts round up.
pub fn grid_config(grid: [usize; 3], threadgroup: [usize; 3]) -> LaunchConfig {
    let blocks = |g: usize, t: usize| g.div_ceil(t.max(1)).max(1) as u32;
    LaunchConfig {
        grid_dim: (
            blocks(grid[0], threadgroup[0]),
            blocks(grid[1], threadgroup[1]),
            blocks(grid[2], threadgroup[2]),
        ),
        block_dim: (
            threadgroup[0].max(1) as u32,
            threadgroup[1].max(1) as u32,
            threadgroup[2].max(1) as u32,
        ),
        shared_mem_bytes: 0,
    }
}

/// One kernel launch over raw byte buffers.
pub struct KernelLaunch<'a> {
    pub device_idx: usize,
    pub module_name: &'a str,
    pub func_name: &'a str,
    pub source: &'a str,
    /// Input buffers in signature order.
    pub inputs: Vec<&'a [u8]>,
    /// Output buffer sizes in bytes, in signature order.
    pub output_bytes: Vec<usize>,
    pub grid: [usize; 3],
    pub threadgroup: [usize; 3],
}

/// Compile (cached), stage inputs, launch and read the outputs back.
pub fn launch_source(launch: &KernelLaunch<'_>) -> Result<Vec<Vec<u8>>, CudaError> {
    let device = get_device(launch.device_idx)?;
    let func = get_or_load_func(
        &device,
        launch.device_idx,
        launch.module_name,
        launch.func_name,
        launch.source,
    )?;

    let mut buffers: Vec<CudaSlice<u8>> =
        Vec::with_capacity(launch.inputs.len() + launch.output_bytes.len());
    for bytes in &launch.inputs {
        // zero-length allocations are rejected by the driver
        let staged = if bytes.is_empty() { vec![0u8] } else { bytes.to_vec() };
        buffers.push(
            device
                .htod_copy(staged)
                .map_err(|e| CudaError::Memory(e.to_string()))?,
        );
    }
    for &n in &launch.output_bytes {
        buffers.push(
            device
                .alloc_zeros::<u8>(n.max(1))
                .map_err(|e| CudaError::Memory(e.to_string()))?,
        );
    }

    let cfg = grid_config(launch.grid, launch.threadgroup);
    tracing::trace!(
        module = launch.module_name,
        grid = ?cfg.grid_dim,
        block = ?cfg.block_dim,
        "launching kernel"
    );
    {
        let refs: Vec<&CudaSlice<u8>> = buffers.iter().collect();
        let mut params: Vec<*mut c_void> = refs.iter().map(|r| r.as_kernel_param()).collect();
        // SAFETY: every parameter points at a live device pointer owned by
        // `buffers`, and the generated signature takes exactly one pointer per
        // buffer in this order.
        unsafe { func.launch(cfg, &mut params[..]) }
            .map_err(|e| CudaError::Launch(e.to_string()))?;
    }
    device
        .synchronize()
        .map_err(|e| CudaError::Launch(e.to_string()))?;

    let first_out = launch.inputs.len();
    buffers[first_out..]
        .iter()
        .zip(&launch.output_bytes)
        .map(|(buf, &n)| {
            let mut host = device
                .dtoh_sync_copy(buf)
                .map_err(|e| CudaError::Memory(e.to_string()))?;
            host.truncate(n);
            Ok(host)
        })
        .collect()
}
