//! User-supplied device kernels.
//!
//! A [`CustomKernel`] holds the body of a CUDA kernel together with its
//! launch geometry and declared outputs. Running it generates the full
//! translation unit (template constants, buffer sizes, a typed signature
//! built from the input and output names) and builds a graph node whose
//! outputs have exactly the declared shapes and dtypes.
//!
//! There is no decomposition to fall back on: the stream's device must be
//! able to compile kernels at runtime, and the node has no vjp, jvp or vmap
//! rule.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fuse_core::{DType, FuseError, Result, Stream, Tensor};

use crate::dispatch::{self, Context, KernelSupport};
use crate::graph::{make_arrays, Array, OutputSpec};
use crate::primitive::{Op, Primitive};

const OP: &str = "custom_kernel";

/// Compile-time parameter substituted into the kernel source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TemplateArg {
    Bool(bool),
    Int(i64),
    DType(DType),
}

impl From<bool> for TemplateArg {
    fn from(v: bool) -> Self {
        TemplateArg::Bool(v)
    }
}

impl From<i64> for TemplateArg {
    fn from(v: i64) -> Self {
        TemplateArg::Int(v)
    }
}

impl From<i32> for TemplateArg {
    fn from(v: i32) -> Self {
        TemplateArg::Int(v as i64)
    }
}

impl From<DType> for TemplateArg {
    fn from(v: DType) -> Self {
        TemplateArg::DType(v)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn require_identifier(s: &str, what: &str) -> Result<()> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(FuseError::invalid(
            OP,
            format!("{what} name `{s}` is not a valid identifier."),
        ))
    }
}

/// CUDA C spelling of a dtype.
fn cuda_type(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "bool",
        DType::U8 => "unsigned char",
        DType::U32 => "unsigned int",
        DType::I32 => "int",
        DType::I64 => "long long",
        DType::F16 => "__half",
        DType::BF16 => "__nv_bfloat16",
        DType::F32 => "float",
        DType::F64 => "double",
    }
}

// ============================================================================
// Kernel definition
// ============================================================================

/// A reusable kernel: body source, declared outputs and launch geometry.
#[derive(Clone, Debug)]
pub struct CustomKernel {
    name: String,
    source: String,
    output_shapes: BTreeMap<String, Vec<usize>>,
    output_dtypes: BTreeMap<String, DType>,
    grid: [usize; 3],
    threadgroup: [usize; 3],
    ensure_row_contiguous: bool,
    template: BTreeMap<String, TemplateArg>,
}

impl CustomKernel {
    /// `output_shapes` and `output_dtypes` must name the same outputs.
    /// `grid` counts threads in total, `threadgroup` per block.
    pub fn new(
        name: &str,
        source: &str,
        output_shapes: BTreeMap<String, Vec<usize>>,
        output_dtypes: BTreeMap<String, DType>,
        grid: [usize; 3],
        threadgroup: [usize; 3],
    ) -> Result<Self> {
        require_identifier(name, "kernel")?;
        if output_shapes.is_empty() {
            return Err(FuseError::invalid(OP, "at least one output must be declared."));
        }
        if !output_shapes.keys().eq(output_dtypes.keys()) {
            return Err(FuseError::invalid(
                OP,
                format!(
                    "output shapes {:?} and output dtypes {:?} must name the same outputs.",
                    output_shapes.keys().collect::<Vec<_>>(),
                    output_dtypes.keys().collect::<Vec<_>>()
                ),
            ));
        }
        for key in output_shapes.keys() {
            require_identifier(key, "output")?;
        }
        if grid.contains(&0) || threadgroup.contains(&0) {
            return Err(FuseError::invalid(
                OP,
                format!("grid {grid:?} and threadgroup {threadgroup:?} must be positive."),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            output_shapes,
            output_dtypes,
            grid,
            threadgroup,
            ensure_row_contiguous: true,
            template: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether inputs must be laid out row-major before launch. Host
    /// tensors are always contiguous, so the flag is only carried along.
    pub fn row_contiguous(mut self, ensure: bool) -> Self {
        self.ensure_row_contiguous = ensure;
        self
    }

    /// Replace the template arguments.
    pub fn template<I, K>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, TemplateArg)>,
        K: Into<String>,
    {
        self.template.clear();
        for (key, arg) in args {
            let key = key.into();
            require_identifier(&key, "template")?;
            self.template.insert(key, arg);
        }
        Ok(self)
    }

    /// Generate the full source for these inputs.
    fn generate_source(&self, func_name: &str, inputs: &BTreeMap<String, Array>) -> String {
        let mut src = String::new();
        let mut dtypes: Vec<DType> = inputs.values().map(Array::dtype).collect();
        dtypes.extend(self.output_dtypes.values().copied());
        dtypes.extend(self.template.values().filter_map(|a| match a {
            TemplateArg::DType(d) => Some(*d),
            _ => None,
        }));
        if dtypes.contains(&DType::F16) {
            src.push_str("#include <cuda_fp16.h>\n");
        }
        if dtypes.contains(&DType::BF16) {
            src.push_str("#include <cuda_bf16.h>\n");
        }

        for (key, arg) in &self.template {
            let line = match arg {
                TemplateArg::Bool(b) => format!("constexpr bool {key} = {b};\n"),
                TemplateArg::Int(i) => format!("constexpr long long {key} = {i};\n"),
                TemplateArg::DType(d) => format!("typedef {} {key};\n", cuda_type(*d)),
            };
            src.push_str(&line);
        }
        let sizes = inputs
            .iter()
            .map(|(key, arr)| (key, arr.shape().numel()))
            .chain(self.output_shapes.iter().map(|(key, dims)| (key, dims.iter().product())));
        for (key, numel) in sizes {
            src.push_str(&format!("constexpr unsigned long long {key}_size = {numel};\n"));
        }

        let mut params: Vec<String> = inputs
            .iter()
            .map(|(key, arr)| format!("const {}* __restrict__ {key}", cuda_type(arr.dtype())))
            .collect();
        params.extend(
            self.output_dtypes
                .iter()
                .map(|(key, dtype)| format!("{}* __restrict__ {key}", cuda_type(*dtype))),
        );
        src.push_str(&format!(
            "extern \"C\" __global__ void {func_name}({}) {{\n{}\n}}\n",
            params.join(", "),
            self.source
        ));
        src
    }

    /// Build the node. Inputs are passed in name order.
    pub fn run(&self, inputs: &BTreeMap<String, Array>, ctx: &Context) -> Result<BTreeMap<String, Array>> {
        for key in inputs.keys() {
            require_identifier(key, "input")?;
            if self.output_shapes.contains_key(key) {
                return Err(FuseError::invalid(
                    OP,
                    format!("`{key}` names both an input and an output."),
                ));
            }
        }
        match dispatch::kernel_support(ctx) {
            KernelSupport::Available => {}
            KernelSupport::Disabled => {
                return Err(FuseError::invalid(
                    OP,
                    format!(
                        "{} has no fallback and custom kernels are disabled in the dispatch configuration.",
                        self.name
                    ),
                ));
            }
            KernelSupport::NoCompiler => {
                return Err(FuseError::invalid(
                    OP,
                    format!(
                        "{} has no fallback and can only run on a device that compiles kernels; {} cannot.",
                        self.name, ctx.stream
                    ),
                ));
            }
        }

        let call = self.prepare(inputs);
        tracing::debug!(op = OP, kernel = %self.name, stream = %ctx.stream, module = %call.module_name, "dispatch");

        let specs = call.output_specs.clone();
        let outputs = make_arrays(
            Primitive::new(ctx.stream, Op::CustomKernel(Arc::new(call))),
            inputs.values().cloned().collect(),
            specs,
        );
        Ok(self.output_shapes.keys().cloned().zip(outputs).collect())
    }

    /// Generate the source and launch description for these inputs.
    fn prepare(&self, inputs: &BTreeMap<String, Array>) -> KernelCall {
        let func_name = format!("custom_kernel_{}", self.name);
        let source = self.generate_source(&func_name, inputs);
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        self.grid.hash(&mut hasher);
        self.threadgroup.hash(&mut hasher);
        let module_name = format!("{func_name}_{:016x}", hasher.finish());

        let specs: Vec<OutputSpec> = self
            .output_shapes
            .iter()
            .zip(self.output_dtypes.values())
            .map(|((_, dims), dtype)| OutputSpec::new(dims, *dtype))
            .collect();
        KernelCall {
            name: self.name.clone(),
            func_name,
            module_name,
            source,
            output_specs: specs,
            grid: self.grid,
            threadgroup: self.threadgroup,
            ensure_row_contiguous: self.ensure_row_contiguous,
        }
    }
}

// ============================================================================
// Launch
// ============================================================================

/// One concrete launch of a [`CustomKernel`], carried by its graph node.
#[derive(Debug)]
pub struct KernelCall {
    name: String,
    func_name: String,
    module_name: String,
    source: String,
    output_specs: Vec<OutputSpec>,
    grid: [usize; 3],
    threadgroup: [usize; 3],
    ensure_row_contiguous: bool,
}

impl KernelCall {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry point symbol inside the generated source.
    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    /// Cache key for the compiled module: function name plus a hash of
    /// the source and launch geometry.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// The generated translation unit.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn output_specs(&self) -> &[OutputSpec] {
        &self.output_specs
    }

    /// Total threads per axis.
    pub fn grid(&self) -> [usize; 3] {
        self.grid
    }

    pub fn threadgroup(&self) -> [usize; 3] {
        self.threadgroup
    }

    pub fn ensure_row_contiguous(&self) -> bool {
        self.ensure_row_contiguous
    }
}

#[cfg(feature = "cuda")]
pub(crate) fn launch(call: &KernelCall, inputs: &[Tensor], stream: Stream) -> Result<Vec<Tensor>> {
    use fuse_core::Storage;
    use fuse_kernels::cuda::{launch_source, KernelLaunch};

    let device_idx = stream.device.cuda_index().ok_or_else(|| {
        FuseError::Kernel(format!("{} cannot launch on {stream}", call.name))
    })?;
    let launch = KernelLaunch {
        device_idx,
        module_name: call.module_name(),
        func_name: call.func_name(),
        source: call.source(),
        inputs: inputs.iter().map(|t| t.storage().as_bytes()).collect(),
        output_bytes: call
            .output_specs()
            .iter()
            .map(|s| s.dtype.storage_bytes(s.dims.iter().product()))
            .collect(),
        grid: call.grid(),
        threadgroup: call.threadgroup(),
    };
    tracing::trace!(op = OP, kernel = %call.name, module = %call.module_name(), "launch");
    let buffers = launch_source(&launch)?;

    call.output_specs()
        .iter()
        .zip(buffers)
        .map(|(spec, bytes)| {
            let numel = spec.dims.iter().product();
            Tensor::from_raw(Storage::from_bytes(spec.dtype, numel, bytes)?, &spec.dims)
        })
        .collect()
}

#[cfg(not(feature = "cuda"))]
pub(crate) fn launch(call: &KernelCall, _inputs: &[Tensor], stream: Stream) -> Result<Vec<Tensor>> {
    Err(FuseError::Kernel(format!(
        "{} ({}) cannot launch on {stream}: built without the `cuda` feature",
        call.name,
        call.func_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchConfig;
    use fuse_core::Device;

    fn outputs() -> (BTreeMap<String, Vec<usize>>, BTreeMap<String, DType>) {
        let shapes = BTreeMap::from([("out".to_string(), vec![4])]);
        let dtypes = BTreeMap::from([("out".to_string(), DType::F32)]);
        (shapes, dtypes)
    }

    fn kernel() -> CustomKernel {
        let (shapes, dtypes) = outputs();
        CustomKernel::new(
            "scale_add",
            "  unsigned i = blockIdx.x * blockDim.x + threadIdx.x;\n  if (i < out_size) out[i] = a[i] * K + b[i];",
            shapes,
            dtypes,
            [4, 1, 1],
            [4, 1, 1],
        )
        .unwrap()
    }

    fn inputs() -> BTreeMap<String, Array> {
        BTreeMap::from([
            ("a".to_string(), Array::from(Tensor::ones(&[4], DType::F32))),
            ("b".to_string(), Array::from(Tensor::zeros(&[4], DType::F16))),
        ])
    }

    #[test]
    fn test_mismatched_output_keys() {
        let (shapes, _) = outputs();
        let dtypes = BTreeMap::from([("y".to_string(), DType::F32)]);
        let err = CustomKernel::new("k", "", shapes, dtypes, [1, 1, 1], [1, 1, 1]).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_template_names_are_validated() {
        assert!(kernel().template([("2bad", TemplateArg::Bool(true))]).is_err());
        assert!(kernel().template([("K", TemplateArg::Int(3))]).is_ok());
    }

    #[test]
    fn test_template_replaces_previous_args() {
        let k = kernel()
            .template([("K", TemplateArg::Int(3)), ("USE_BIAS", TemplateArg::Bool(true))])
            .unwrap()
            .template([("K", TemplateArg::from(7i64))])
            .unwrap();
        let src = k.generate_source("f", &inputs());
        assert!(src.contains("constexpr long long K = 7;"));
        assert!(!src.contains("USE_BIAS"));
    }

    #[test]
    fn test_generated_signature() {
        let k = kernel().template([("T", TemplateArg::DType(DType::F32))]).unwrap();
        let src = k.generate_source("custom_kernel_scale_add", &inputs());
        assert!(src.contains("#include <cuda_fp16.h>"));
        assert!(src.contains("typedef float T;"));
        assert!(src.contains("constexpr unsigned long long out_size = 4;"));
        assert!(src.contains(
            "extern \"C\" __global__ void custom_kernel_scale_add(const float* __restrict__ a, const __half* __restrict__ b, float* __restrict__ out)"
        ));
    }

    #[test]
    fn test_generated_source_ends_with_body() {
        let src = kernel().generate_source("f", &inputs());
        assert!(src.ends_with("if (i < out_size) out[i] = a[i] * K + b[i];\n}\n"));
        assert!(src.contains("constexpr unsigned long long a_size = 4;\nconstexpr unsigned long long b_size = 4;\n"));
    }

    #[test]
    fn test_prepared_call_carries_launch() {
        let call = kernel().prepare(&inputs());
        assert_eq!(call.name(), "scale_add");
        assert_eq!(call.func_name(), "custom_kernel_scale_add");
        assert!(call.module_name().starts_with("custom_kernel_scale_add_"));
        assert_eq!(call.output_specs(), &[OutputSpec::new(&[4], DType::F32)]);
        assert_eq!(call.grid(), [4, 1, 1]);
        assert_eq!(call.threadgroup(), [4, 1, 1]);
        assert!(call.ensure_row_contiguous());

        let wider = kernel().row_contiguous(false).prepare(&inputs());
        assert!(!wider.ensure_row_contiguous());
        assert_eq!(wider.module_name(), call.module_name());
    }

    #[test]
    fn test_host_stream_cannot_run() {
        let err = kernel().run(&inputs(), &Context::default()).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().starts_with("[custom_kernel] scale_add has no fallback"));
        assert!(err.to_string().ends_with("cpu) cannot."));
    }

    #[test]
    fn test_disabled_switch_is_reported() {
        let off = DispatchConfig { custom_kernels: false, ..DispatchConfig::default() };
        for device in [Device::Cpu, Device::Cuda(0)] {
            let ctx = Context::on(device).with_config(off.clone());
            let err = kernel().run(&inputs(), &ctx).unwrap_err();
            assert_eq!(
                err.to_string(),
                "[custom_kernel] scale_add has no fallback and custom kernels are disabled in the dispatch configuration."
            );
        }
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn test_cuda_stream_builds_declared_outputs() {
        let ctx = Context::on(Device::Cuda(0));
        let outs = kernel().run(&inputs(), &ctx).unwrap();
        let out = &outs["out"];
        assert!(out.is_pending());
        assert_eq!(out.dims(), &[4]);
        assert_eq!(out.dtype(), DType::F32);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_stream_needs_feature() {
        let ctx = Context::on(Device::Cuda(0));
        assert!(kernel().run(&inputs(), &ctx).is_err());
    }

    #[test]
    fn test_input_output_name_clash() {
        let mut ins = inputs();
        ins.insert("out".to_string(), Array::from(Tensor::ones(&[4], DType::F32)));
        assert!(kernel().run(&ins, &Context::default()).is_err());
    }
}
