use std::io;
use std::mem;

/// Pin the calling thread to a single CPU core.
///
/// Threads spawned afterwards inherit the caller's mask, so a connection
/// group pins itself once before spawning its sibling workers and the whole
/// group lands on the same core.
pub fn pin_current_thread(core: usize) -> io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("core id {} out of range (max {})", core, libc::CPU_SETSIZE - 1),
        ));
    }

    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_to_first_core_succeeds() {
        pin_current_thread(0).expect("pin to core 0");
    }

    #[test]
    fn out_of_range_core_is_rejected() {
        let err = pin_current_thread(libc::CPU_SETSIZE as usize).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
