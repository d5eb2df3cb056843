use std::fmt;

/// Element types supported by fuse tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    /// Boolean stored as one byte (0 or 1)
    Bool,
    /// 8-bit unsigned integer
    U8,
    /// 32-bit unsigned integer (packed quantized words)
    U32,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 16-bit Brain Float (same exponent range as F32, reduced mantissa)
    BF16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Width in bits of one element.
    pub fn bits(&self) -> u32 {
        (self.element_size() * 8) as u32
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integer type (bool excluded).
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::U8 | DType::U32 | DType::I32 | DType::I64)
    }

    /// Whether this dtype is an unsigned integer type.
    pub fn is_unsigned(&self) -> bool {
        matches!(self, DType::U8 | DType::U32)
    }

    /// Common type two operands are computed in.
    ///
    /// Floats beat integers, the wider float wins and f16 with bf16 meets at
    /// f32. Mixed-sign integers widen to the next signed type that holds both.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        match (self.is_float(), other.is_float()) {
            (true, false) => self,
            (false, true) => other,
            (true, true) => match (self, other) {
                (DType::F64, _) | (_, DType::F64) => DType::F64,
                _ => DType::F32,
            },
            (false, false) => {
                if self == DType::Bool {
                    return other;
                }
                if other == DType::Bool {
                    return self;
                }
                if self.is_unsigned() == other.is_unsigned() {
                    if self.element_size() >= other.element_size() {
                        self
                    } else {
                        other
                    }
                } else {
                    let (unsigned, signed) = if self.is_unsigned() {
                        (self, other)
                    } else {
                        (other, self)
                    };
                    if signed.element_size() > unsigned.element_size() {
                        signed
                    } else {
                        DType::I64
                    }
                }
            }
        }
    }

    /// Common type of a list of dtypes. `None` for an empty list.
    pub fn result_type(dtypes: &[DType]) -> Option<DType> {
        let (first, rest) = dtypes.split_first()?;
        Some(rest.iter().fold(*first, |acc, &d| acc.promote(d)))
    }

    /// Floating type an integer operand is lifted to by transcendental ops.
    pub fn to_float(self) -> DType {
        if self.is_float() {
            self
        } else {
            DType::F32
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Bool => write!(f, "bool"),
            DType::U8 => write!(f, "uint8"),
            DType::U32 => write!(f, "uint32"),
            DType::I32 => write!(f, "int32"),
            DType::I64 => write!(f, "int64"),
            DType::F16 => write!(f, "float16"),
            DType::BF16 => write!(f, "bfloat16"),
            DType::F32 => write!(f, "float32"),
            DType::F64 => write!(f, "float64"),
        }
    }
}
