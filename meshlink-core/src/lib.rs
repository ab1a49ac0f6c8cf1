//! Building blocks of a meshlink node: addresses, the wire protocol and its
//! framing, the distance-vector route table and the tunnel stream.

pub mod address;
pub mod error;
pub mod pipe;
pub mod protocol;
pub mod route;
pub mod tunnel;
