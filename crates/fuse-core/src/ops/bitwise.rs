//! Integer bit shifts.

use crate::dtype::DType;
use crate::error::FuseError;
use crate::ops::arithmetic::binary_op;
use crate::tensor::Tensor;
use crate::Result;

fn shift(a: f64, b: f64, left: bool, dtype: DType) -> f64 {
    let s = b as u32;
    if s >= dtype.bits() {
        return 0.0;
    }
    match dtype {
        DType::U8 => {
            let v = a as u8;
            (if left { v << s } else { v >> s }) as f64
        }
        DType::U32 => {
            let v = a as u32;
            (if left { v << s } else { v >> s }) as f64
        }
        DType::I32 => {
            let v = a as i32;
            (if left { v.wrapping_shl(s) } else { v >> s }) as f64
        }
        DType::I64 => {
            let v = a as i64;
            (if left { v.wrapping_shl(s) } else { v >> s }) as f64
        }
        _ => 0.0,
    }
}

fn shift_op(a: &Tensor, b: &Tensor, left: bool) -> Result<Tensor> {
    for t in [a, b] {
        if !t.dtype().is_integer() {
            return Err(FuseError::UnsupportedDType(t.dtype()));
        }
    }
    let dtype = a.dtype().promote(b.dtype());
    binary_op(a, b, Some(dtype), move |x, y| shift(x, y, left, dtype))
}

impl Tensor {
    /// Element-wise `self << other`; bits shifted past the dtype width are dropped.
    pub fn left_shift(&self, other: &Tensor) -> Result<Tensor> {
        shift_op(self, other, true)
    }

    /// Element-wise `self >> other` (logical for unsigned, arithmetic for signed).
    pub fn right_shift(&self, other: &Tensor) -> Result<Tensor> {
        shift_op(self, other, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_shift_drops_high_bits() {
        let w = Tensor::from_u32(&[0xABCD_1234], &[1]);
        let s = Tensor::from_u32(&[28], &[1]);
        assert_eq!(w.left_shift(&s).unwrap().to_vec_u32(), vec![0x4000_0000]);
        assert_eq!(w.right_shift(&s).unwrap().to_vec_u32(), vec![0xA]);
    }

    #[test]
    fn test_extract_field() {
        // bits 4..8 of 0x0000_00F3 via shift-left then shift-right
        let w = Tensor::from_u32(&[0xF3], &[1]);
        let hi = w.left_shift(&Tensor::from_u32(&[24], &[1])).unwrap();
        let field = hi.right_shift(&Tensor::from_u32(&[28], &[1])).unwrap();
        assert_eq!(field.to_vec_u32(), vec![0xF]);
    }

    #[test]
    fn test_float_operand_rejected() {
        let w = Tensor::from_f32(&[1.0], &[1]);
        let s = Tensor::from_u32(&[1], &[1]);
        assert!(w.left_shift(&s).is_err());
    }
}
