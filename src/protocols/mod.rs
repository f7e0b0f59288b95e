pub mod dfu;
pub mod stk500v2;
