//! Non-blocking AF_VSOCK stream for the tokio runtime.
//!
//! Linux only; on other platforms connecting fails with `Unsupported`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// CID of the host.
pub const HOST_CID: u32 = 2;

/// vsock stream (connection) registered with the tokio reactor.
#[derive(Debug)]
pub struct VsockStream {
    inner: AsyncFd<OwnedFd>,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem;

    #[repr(C)]
    #[allow(non_camel_case_types)]
    struct sockaddr_vm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_zero: [u8; 4],
    }

    impl VsockStream {
        /// Connect to `port` on `cid`.
        ///
        /// A connect that runs into the kernel's connect timeout fails with
        /// `io::ErrorKind::TimedOut`.
        pub async fn connect(cid: u32, port: u32) -> io::Result<Self> {
            // SAFETY: plain socket(2) call; the returned fd is owned immediately.
            let fd = unsafe {
                let fd = libc::socket(
                    libc::AF_VSOCK,
                    libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    0,
                );
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                OwnedFd::from_raw_fd(fd)
            };

            let addr = sockaddr_vm {
                svm_family: libc::AF_VSOCK as libc::sa_family_t,
                svm_reserved1: 0,
                svm_port: port,
                svm_cid: cid,
                svm_zero: [0; 4],
            };

            // SAFETY: addr is a valid sockaddr_vm for the duration of the call.
            let rc = unsafe {
                libc::connect(
                    fd.as_raw_fd(),
                    &addr as *const sockaddr_vm as *const libc::sockaddr,
                    mem::size_of::<sockaddr_vm>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINPROGRESS) {
                    return Err(err);
                }
            }

            let inner = AsyncFd::new(fd)?;
            // Non-blocking connect completes when the socket turns writable.
            let mut guard = inner.writable().await?;
            guard.retain_ready();
            drop(guard);
            take_socket_error(&inner)?;

            Ok(Self { inner })
        }
    }

    fn take_socket_error(fd: &AsyncFd<OwnedFd>) -> io::Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: err and len are valid for writes of the advertised size.
        let rc = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        pending_error(err)
    }

    /// Map a pending `SO_ERROR` value; `ETIMEDOUT` becomes `ErrorKind::TimedOut`.
    fn pending_error(err: libc::c_int) -> io::Result<()> {
        match err {
            0 => Ok(()),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::os::unix::net::UnixStream;

        #[test]
        fn connect_timeout_is_retryable() {
            let err = pending_error(libc::ETIMEDOUT).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);

            let err = pending_error(libc::ECONNREFUSED).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
            assert!(pending_error(0).is_ok());
        }

        #[tokio::test]
        async fn connected_socket_has_no_pending_error() {
            let (local, _peer) = UnixStream::pair().unwrap();
            local.set_nonblocking(true).unwrap();
            let fd = AsyncFd::new(OwnedFd::from(local)).unwrap();
            take_socket_error(&fd).unwrap();
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl VsockStream {
    pub async fn connect(_cid: u32, _port: u32) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vsock only supported on Linux",
        ))
    }
}

impl AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|fd| {
                // SAFETY: unfilled is a valid, initialized, writable region.
                let n = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut libc::c_void,
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            let result = guard.try_io(|fd| {
                // SAFETY: buf is a valid readable region of buf.len() bytes.
                let n = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // SAFETY: shutdown(2) on an fd we own.
        let rc = unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_WR) };
        if rc < 0 {
            return Poll::Ready(Err(io::Error::last_os_error()));
        }
        Poll::Ready(Ok(()))
    }
}
