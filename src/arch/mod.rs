pub mod abi;
pub mod writer;
pub mod x86_64;
