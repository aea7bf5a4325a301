use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Write};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;

/// Creates an anonymous close-on-exec memfd.
pub fn create_memfd(name: &CStr) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Copies `bytes` into a new memfd suitable for passing to another process.
pub fn memfd_for_bytearray(bytes: &[u8]) -> io::Result<OwnedFd> {
    let mut file = File::from(create_memfd(c"sysvmoc_bytes")?);
    file.write_all(bytes)?;
    Ok(file.into())
}

/// Copies the whole content of a memfd into an owned buffer.
///
/// The descriptor is mapped only for the duration of the copy.
pub fn vector_for_memfd(fd: BorrowedFd<'_>) -> io::Result<Vec<u8>> {
    // SAFETY: stat is plain old data.
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let size = usize::try_from(st.st_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative memfd size"))?;
    if size == 0 {
        return Ok(Vec::new());
    }

    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let bytes = unsafe { std::slice::from_raw_parts(p.cast::<u8>(), size) }.to_vec();
    unsafe {
        libc::munmap(p, size);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn empty_memfd_reads_empty() {
        let fd = memfd_for_bytearray(&[]).unwrap();
        assert!(vector_for_memfd(fd.as_fd()).unwrap().is_empty());
    }

    #[test]
    fn contents_survive_large_copies() {
        let data: Vec<u8> = (0..3 * 4096 + 17).map(|i| (i % 251) as u8).collect();
        let fd = memfd_for_bytearray(&data).unwrap();
        assert_eq!(vector_for_memfd(fd.as_fd()).unwrap(), data);
    }
}
