//! Permission mailbox transports.

pub mod framing;
pub mod fs_mailbox;
#[cfg(unix)]
pub mod socket_mailbox;

pub use fs_mailbox::{FsMailbox, FsMailboxClient, channel_file_stem, request_path, response_path};
#[cfg(unix)]
pub use socket_mailbox::{SocketMailbox, SocketMailboxClient};
