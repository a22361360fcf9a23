//! Saved thread context
//!
//! The callee-saved register file captured at a context switch. Layout is
//! fixed by the switch assembly in `arch`: ra at offset 0, sp at 8, then
//! s0..s11.

#[derive(Debug, Clone)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

impl Context {
    pub const fn zeroed() -> Context {
        Context {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}
