pub mod compression;
pub mod defer;
