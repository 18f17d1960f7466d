use crate::machine::{BuildError, OpFn, StrHandle};

/// Largest component width with a monomorphized specialization. Colors are
/// 3 wide, vectors 3 or 4; custom tuple types go up to here.
pub const MAX_WIDTH: usize = 16;

/// A family of element-wise operator implementations, one per component
/// width `D`. Each member applies its operation across `D` contiguous
/// scalar registers with the loop count baked in at compile time, so the
/// hot path never branches on the width.
pub trait WideKernel {
    fn run<const D: usize>(args: &[i32], fp: &mut [f64], strs: &mut [StrHandle]) -> i32;
}

/// Resolve the entry point of kernel family `K` for a runtime `width`.
///
/// Called once per instruction while building; the returned pointer is
/// baked into the instruction, so evaluation pays nothing for the width
/// selection. A width outside `1..=16` means the code generator emitted an
/// unsupported vector/color width and is reported, never silently clamped.
pub fn wide_op<K: WideKernel>(width: usize) -> Result<OpFn, BuildError> {
    let f: OpFn = match width {
        1 => K::run::<1>,
        2 => K::run::<2>,
        3 => K::run::<3>,
        4 => K::run::<4>,
        5 => K::run::<5>,
        6 => K::run::<6>,
        7 => K::run::<7>,
        8 => K::run::<8>,
        9 => K::run::<9>,
        10 => K::run::<10>,
        11 => K::run::<11>,
        12 => K::run::<12>,
        13 => K::run::<13>,
        14 => K::run::<14>,
        15 => K::run::<15>,
        16 => K::run::<16>,
        _ => return Err(BuildError::UnsupportedWidth { width }),
    };
    Ok(f)
}
