pub mod cosmos;
pub mod evm;
