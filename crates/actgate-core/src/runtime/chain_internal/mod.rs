//! Implementation modules for `runtime::chain`.
//!
//! `src/runtime/chain.rs` is the stable facade; evaluation, execution and
//! outcome settlement live here.

pub(crate) mod outcome;
pub(crate) mod run;
pub(crate) mod stages;
