//! exprtape — non-recursive, register-based interpreter core for a small
//! expression language.
//!
//! Expressions are compiled once into a flat instruction tape and then
//! evaluated an enormous number of times (typically once per data sample),
//! so the per-evaluation overhead is kept at "call a function pointer per
//! instruction": no call stack, no recursion, no allocation during the
//! walk. All state lives in two flat register arrays — scalar slots for
//! numbers (vectors and colors flattened into contiguous blocks) and
//! pointer slots for string handles.
//!
//! An external code generator drives the [`Machine`] builder to lay out
//! registers and append instructions, then freezes the build into an
//! immutable [`Program`] and a mutable [`Frame`]; the program can be shared
//! read-only while each evaluation owns its frame.
//!
//! ```
//! use exprtape::{kernel, wide_op, Machine};
//!
//! let mut m = Machine::new();
//! let input = m.alloc_fp(1);
//! let out = m.alloc_fp(3);
//! m.set_fp(input, 7.0);
//!
//! // promote the scalar input to a 3-wide color
//! m.begin_op(wide_op::<kernel::Promote>(3)?);
//! m.add_operand(input as i32);
//! m.add_operand(out as i32);
//! m.end_op(false);
//!
//! let (program, mut frame) = m.freeze();
//! program.eval(&mut frame);
//! assert_eq!(&frame.fp[out..out + 3], &[7.0, 7.0, 7.0]);
//! # Ok::<(), exprtape::BuildError>(())
//! ```

pub mod kernel;
pub mod machine;

pub use machine::dispatch::{wide_op, WideKernel, MAX_WIDTH};
pub use machine::{BuildError, Frame, Machine, OpFn, Program, StrHandle, VarId};
