//! SCM_RIGHTS ancillary-data fd passing over the QMP Unix socket.
//!
//! Abstracted as a single `send_with_fd` primitive per Design Note 9(e):
//! platforms without `sendmsg`/ancillary-data support fail the capability
//! gate rather than silently emulating fd passing.

use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tokio::net::UnixStream;

use crate::error::{DriverError, Result};

/// Write `payload` (a single QMP request line, including its trailing
/// newline) to `stream`, attaching `fd` as SCM_RIGHTS ancillary data.
///
/// The caller is responsible for closing its own copy of `fd` after this
/// call returns successfully — QEMU now owns a duplicate via `getfd`.
pub async fn send_with_fd(stream: &UnixStream, payload: &[u8], fd: RawFd) -> Result<()> {
    loop {
        stream.writable().await.map_err(DriverError::Io)?;

        let raw = stream.as_raw_fd();
        let iov = [std::io::IoSlice::new(payload)];
        let cmsgs = [ControlMessage::ScmRights(std::slice::from_ref(&fd))];

        match sendmsg::<()>(raw, &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EAGAIN) => continue,
            Err(e) => {
                return Err(DriverError::Io(std::io::Error::from_raw_os_error(e as i32)))
            }
        }
    }
}
