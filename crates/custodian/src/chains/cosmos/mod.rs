pub mod address;
pub mod adr36;
pub mod amino;
pub mod direct;
