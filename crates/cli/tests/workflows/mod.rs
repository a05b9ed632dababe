//! Workflows exercising several commands against one project

pub mod check_remap;
pub mod hashtable_run;
