pub mod filter;
pub mod merger;
pub mod recorder;
pub mod slicer;
