pub mod doh;
pub mod stcp;
pub mod tcp;
pub mod udp;

use std::io;

/// Transient errors (timeouts, interrupted syscalls) are retried in place;
/// everything else — including the listener having been torn down out from
/// under the loop — terminates the accept loop rather than spinning on it
/// forever. Grounded on the reference's `handleAccept`'s three-way
/// `errors.Is(err, net.ErrClosed)` / `ne.Timeout()` / default policy.
pub(crate) fn is_transient_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
