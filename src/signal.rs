use libc::c_int;
use std::io;

/// exit status of a process ended by SIGINT
pub const INTERRUPTED_STATUS: c_int = 128 + libc::SIGINT;

extern "C" fn on_interrupt(_: c_int) {
    // only async-signal-safe calls here; the kernel closes the image descriptor
    unsafe { libc::_exit(INTERRUPTED_STATUS) }
}

/// Ends the process on Ctrl-C outside the prompt. Every write is positional and
/// unbuffered, so nothing is lost except the operation in flight.
pub fn install_interrupt_handler() -> io::Result<()> {
    let handler = on_interrupt as extern "C" fn(c_int) as libc::sighandler_t;
    if unsafe { libc::signal(libc::SIGINT, handler) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_installs() {
        install_interrupt_handler().unwrap();
        assert_eq!(INTERRUPTED_STATUS, 130);
    }
}
