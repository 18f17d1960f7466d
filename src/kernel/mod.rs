//! Built-in operator kernels.
//!
//! Element-wise kernels are [`WideKernel`] families: resolve a concrete
//! width with [`wide_op`](crate::machine::dispatch::wide_op) while building.
//! Scalar-only kernels (comparisons, branches, string ops) are plain
//! [`OpFn`](crate::machine::OpFn)s passed to `begin_op` directly.
//!
//! Register operands are trusted as built; an out-of-range offset panics
//! via the slice index rather than reading out of bounds.

use crate::machine::dispatch::WideKernel;
use crate::machine::StrHandle;

/// Promote a width-1 value to width `D`: operands `[pos_in, pos_out]`, the
/// value at `pos_in` is copied into all `D` slots starting at `pos_out`.
pub struct Promote;

impl WideKernel for Promote {
    #[inline]
    fn run<const D: usize>(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        let v = fp[args[0] as usize];
        let out = args[1] as usize;
        for slot in &mut fp[out..out + D] {
            *slot = v;
        }
        1
    }
}

/// Copy a `D`-wide block: operands `[pos_in, pos_out]`.
pub struct Assign;

impl WideKernel for Assign {
    #[inline]
    fn run<const D: usize>(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        let src = args[0] as usize;
        let out = args[1] as usize;
        fp.copy_within(src..src + D, out);
        1
    }
}

/// Fill a `D`-wide block with uniform values in `[0, 1)`: operands
/// `[pos_out]`.
pub struct Rand;

impl WideKernel for Rand {
    #[inline]
    fn run<const D: usize>(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        let out = args[0] as usize;
        for slot in &mut fp[out..out + D] {
            *slot = fastrand::f64();
        }
        1
    }
}

macro_rules! binary_kernel {
    ($(#[$doc:meta])* $name:ident, $op:tt) => {
        $(#[$doc])*
        pub struct $name;

        impl WideKernel for $name {
            #[inline]
            fn run<const D: usize>(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
                let a = args[0] as usize;
                let b = args[1] as usize;
                let out = args[2] as usize;
                for k in 0..D {
                    fp[out + k] = fp[a + k] $op fp[b + k];
                }
                1
            }
        }
    };
}

binary_kernel!(
    /// Element-wise addition: operands `[a, b, out]`.
    Add, +
);
binary_kernel!(
    /// Element-wise subtraction: operands `[a, b, out]`.
    Sub, -
);
binary_kernel!(
    /// Element-wise multiplication: operands `[a, b, out]`.
    Mul, *
);
binary_kernel!(
    /// Element-wise division: operands `[a, b, out]`. IEEE-754 semantics,
    /// so a zero divisor yields inf/nan instead of an error.
    Div, /
);

/// Element-wise negation: operands `[a, out]`.
pub struct Neg;

impl WideKernel for Neg {
    #[inline]
    fn run<const D: usize>(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
        let a = args[0] as usize;
        let out = args[1] as usize;
        for k in 0..D {
            fp[out + k] = -fp[a + k];
        }
        1
    }
}

// ── Scalar comparisons ───────────────────────────────────────────────
// Comparisons always produce a width-1 truth value (0.0 or 1.0), whatever
// the width of the expression they guard.

macro_rules! compare_op {
    ($(#[$doc:meta])* $name:ident, $op:tt) => {
        $(#[$doc])*
        #[inline]
        pub fn $name(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
            let a = fp[args[0] as usize];
            let b = fp[args[1] as usize];
            fp[args[2] as usize] = if a $op b { 1.0 } else { 0.0 };
            1
        }
    };
}

compare_op!(
    /// `fp[out] = fp[a] < fp[b]`: operands `[a, b, out]`.
    lt, <
);
compare_op!(
    /// `fp[out] = fp[a] <= fp[b]`: operands `[a, b, out]`.
    le, <=
);
compare_op!(
    /// `fp[out] = fp[a] > fp[b]`: operands `[a, b, out]`.
    gt, >
);
compare_op!(
    /// `fp[out] = fp[a] >= fp[b]`: operands `[a, b, out]`.
    ge, >=
);
compare_op!(
    /// `fp[out] = fp[a] == fp[b]`: operands `[a, b, out]`.
    eq, ==
);
compare_op!(
    /// `fp[out] = fp[a] != fp[b]`: operands `[a, b, out]`.
    ne, !=
);

// ── Control flow ─────────────────────────────────────────────────────

/// Unconditional relative jump: operands `[delta]`, advance = `delta`.
/// Deltas must be forward (>= 1); compiled programs have no loops.
#[inline]
pub fn skip(args: &[i32], _fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
    args[0]
}

/// Conditional forward jump: operands `[cond, delta]`. Advances by `delta`
/// when `fp[cond]` is false (0.0), else by 1 into the guarded block.
#[inline]
pub fn cond_skip(args: &[i32], fp: &mut [f64], _strs: &mut [StrHandle]) -> i32 {
    if fp[args[0] as usize] == 0.0 { args[1] } else { 1 }
}

// ── String handles ───────────────────────────────────────────────────

/// Copy a pointer register: operands `[pos_in, pos_out]`.
#[inline]
pub fn str_copy(args: &[i32], _fp: &mut [f64], strs: &mut [StrHandle]) -> i32 {
    strs[args[1] as usize] = strs[args[0] as usize];
    1
}

/// String equality: operands `[a, b, out]`; `fp[out]` becomes 1.0 when the
/// two handles hold equal C strings. Two nulls are equal; null never equals
/// a non-null handle.
#[inline]
pub fn str_eq(args: &[i32], fp: &mut [f64], strs: &mut [StrHandle]) -> i32 {
    let a = strs[args[0] as usize];
    let b = strs[args[1] as usize];
    let equal = if a.is_null() || b.is_null() {
        a.is_null() && b.is_null()
    } else {
        // SAFETY: non-null handles were stored by the code generator or a
        // prior instruction and point to NUL-terminated strings that outlive
        // the evaluation.
        unsafe { libc::strcmp(a, b) == 0 }
    };
    fp[args[2] as usize] = if equal { 1.0 } else { 0.0 };
    1
}
