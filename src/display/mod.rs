pub mod report;

pub use report::format_blocks;
