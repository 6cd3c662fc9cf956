//! The three Pipeline FSMs (spec §4.6), each a thin wrapper registering its
//! states with `fsm_runtime::Builder`.

pub mod activate;
pub mod download;
pub mod unpack;
