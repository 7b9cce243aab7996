pub mod cpu;
pub mod hle;
pub mod jit;
pub mod machine;
pub mod mips;
pub mod timing;
