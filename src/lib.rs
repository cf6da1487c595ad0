//! Library for configuring the clock crosspoint crossbar on timing boards.
//! Provides the register frame protocol carried over IPMI, the crosspoint
//! map and TX enable codecs, and the ordered configuration sequence.

pub mod crossbar;
pub mod crosspoint;
pub mod frame;
pub mod ipmi;
pub mod transport;
pub mod txenable;
