//! VideoCore mailbox - property-tag channel to the GPU firmware
//!
//! A property call is a flat buffer of 32-bit words that the firmware
//! rewrites in place:
//!
//! ```text
//! [total_size, request_code, tag, value_buf_size, req_len, values..., 0]
//! ```
//!
//! This module only moves the buffer across the boundary. Building tags and
//! interpreting responses is up to the caller.

use crate::{PlatformError, Result};

/// Submits property-tag buffers to the VideoCore firmware
pub trait Mailbox {
    /// Perform one property call, rewriting `buffer` with the response
    ///
    /// `buffer[0]` must hold the total buffer size in bytes.
    fn call(&self, buffer: &mut [u32]) -> Result<()>;
}

/// Check the framing every property buffer must have
pub(crate) fn check_buffer(buffer: &[u32]) -> Result<()> {
    // size word, request code and the end tag at minimum
    if buffer.len() < 3 || buffer[0] as usize != buffer.len() * 4 {
        return Err(PlatformError::MalformedBuffer(buffer.len()));
    }
    Ok(())
}

#[cfg(all(feature = "runtime", unix))]
pub use vcio::VcioMailbox;

#[cfg(all(feature = "runtime", unix))]
mod vcio {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::sync::OnceLock;

    use super::{check_buffer, Mailbox};
    use crate::{PlatformError, Result};

    /// `_IOWR(100, 0, char *)`
    const IOCTL_MBOX_PROPERTY: u64 =
        (3 << 30) | ((core::mem::size_of::<*mut libc::c_char>() as u64) << 16) | (100 << 8);

    /// Mailbox over the `/dev/vcio` character device
    ///
    /// The device is opened on the first call and kept open afterwards.
    #[derive(Debug, Default)]
    pub struct VcioMailbox {
        device: OnceLock<File>,
    }

    impl VcioMailbox {
        pub const PATH: &'static str = "/dev/vcio";

        pub fn new() -> Self {
            Self::default()
        }

        fn device(&self) -> Result<&File> {
            if let Some(file) = self.device.get() {
                return Ok(file);
            }
            let file = File::open(Self::PATH).map_err(|source| {
                log::error!("failed to open {}: {}", Self::PATH, source);
                PlatformError::DeviceOpen {
                    path: Self::PATH,
                    source,
                }
            })?;
            Ok(self.device.get_or_init(|| file))
        }
    }

    impl Mailbox for VcioMailbox {
        fn call(&self, buffer: &mut [u32]) -> Result<()> {
            check_buffer(buffer)?;
            let fd = self.device()?.as_raw_fd();

            // SAFETY: the buffer is a live, correctly sized property message;
            // the driver reads and rewrites at most buffer[0] bytes.
            let ret = unsafe { libc::ioctl(fd, IOCTL_MBOX_PROPERTY as _, buffer.as_mut_ptr()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                log::error!("mailbox ioctl failed: {}", err);
                return Err(PlatformError::MailboxIo(err));
            }
            Ok(())
        }
    }

}
