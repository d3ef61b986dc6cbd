//! POSIX open flags to remote open mode

use crate::remote::OpenFlags;

/// Translate POSIX open/create flags into remote open flags.
///
/// No combination is rejected here; whether e.g. `O_EXCL` without `O_CREAT`
/// makes sense is for the remote service to decide.
pub fn translate(flags: i32) -> OpenFlags {
    let mut remote = OpenFlags::empty();

    if matches!(flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR) {
        remote |= OpenFlags::WRITE;
    }
    if flags & libc::O_APPEND != 0 {
        remote |= OpenFlags::APPEND;
    }
    if flags & libc::O_CREAT != 0 {
        remote |= OpenFlags::CREAT;
    }
    if flags & libc::O_EXCL != 0 {
        remote |= OpenFlags::EXCL;
    }
    if flags & libc::O_TRUNC != 0 {
        remote |= OpenFlags::TRUNC;
    }

    remote
}

/// Flags for opening an existing file by id outside of an explicit open:
/// creation and truncation bits are dropped.
pub fn reopen(flags: i32) -> OpenFlags {
    translate(flags) & (OpenFlags::WRITE | OpenFlags::APPEND)
}

pub fn is_write_only(flags: i32) -> bool {
    flags & libc::O_ACCMODE == libc::O_WRONLY
}

/// True if the flags carry any intent to modify the file
pub fn wants_write(flags: i32) -> bool {
    translate(flags).intersects(
        OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREAT | OpenFlags::TRUNC,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_is_empty() {
        assert_eq!(translate(libc::O_RDONLY), OpenFlags::empty());
    }

    #[test]
    fn test_access_modes() {
        assert_eq!(translate(libc::O_WRONLY), OpenFlags::WRITE);
        assert_eq!(translate(libc::O_RDWR), OpenFlags::WRITE);
    }

    #[test]
    fn test_modifier_bits() {
        let flags = translate(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC);
        assert_eq!(flags, OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);

        let flags = translate(libc::O_RDWR | libc::O_APPEND);
        assert_eq!(flags, OpenFlags::WRITE | OpenFlags::APPEND);
    }

    #[test]
    fn test_exclusive_without_create_passes_through() {
        assert_eq!(translate(libc::O_RDONLY | libc::O_EXCL), OpenFlags::EXCL);
    }

    #[test]
    fn test_reopen_drops_create_and_truncate() {
        let flags = reopen(libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
        assert_eq!(flags, OpenFlags::WRITE);
    }

    #[test]
    fn test_write_intent() {
        assert!(is_write_only(libc::O_WRONLY | libc::O_APPEND));
        assert!(!is_write_only(libc::O_RDWR));
        assert!(wants_write(libc::O_RDWR));
        assert!(wants_write(libc::O_RDONLY | libc::O_TRUNC));
        assert!(!wants_write(libc::O_RDONLY));
    }
}
