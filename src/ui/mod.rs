//! Terminal output for the `kanadb` binary.

pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{error, human_bytes, info, section, success};
pub use table::{analyses_table, stats_table};
pub use theme::{theme, Theme};
