//! Message transport between the node and the SYS VM OC compile monitor.
//!
//! Messages are single `SOCK_SEQPACKET` datagrams carrying the bincode
//! encoding of a [`SysVmOcMessage`](sysvmoc_types::SysVmOcMessage) plus up
//! to [`MAX_NUM_FDS`] descriptors passed as `SCM_RIGHTS` ancillary data.
//! A datagram is the unit of atomicity: there is no framing and a message
//! never spans two reads.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

#[cfg(not(target_os = "linux"))]
compile_error!("the SYS VM OC transport requires Linux");

mod connection;
mod error;
mod memfd;
mod message;

pub use crate::connection::{get_connection_to_compile_monitor, seqpacket_pair};
pub use crate::error::IpcError;
pub use crate::memfd::{create_memfd, memfd_for_bytearray, vector_for_memfd};
pub use crate::message::{
    read_message_with_fds, read_message_with_fds_from_socket, write_message_with_fds,
};

/// Size of the receive buffer; encoded messages must be strictly smaller.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Most descriptors passed with one message.
pub const MAX_NUM_FDS: usize = 4;
