pub mod config;
pub mod dataholder;
pub mod filters;
pub mod postings;
pub mod select;
pub mod suffix_map;
pub mod typos;
