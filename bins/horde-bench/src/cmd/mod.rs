pub mod inner_join;
pub mod workload;
pub mod zip_last;
