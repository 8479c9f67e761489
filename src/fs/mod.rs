pub mod backend;
pub mod ftp;
pub mod listing;
pub mod local;
pub mod types;

pub use backend::{ByteReader, ByteWriter, Transport, TransportError};
pub use ftp::{FtpSettings, FtpTransport};
pub use local::{LocalBackend, LocalFs};
pub use types::*;
