//! Generated protobuf and tonic code for the services this workspace talks to.
//!
//! The files under `generated/` are produced by buf and checked in; the prost
//! file `include!`s its tonic companion.

pub mod calculator {
    include!("generated/calculator.v1.rs");
}
