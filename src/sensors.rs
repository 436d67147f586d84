pub mod bh1750;

pub use bh1750::Bh1750;
