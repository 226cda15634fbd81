//! Mapping of VFS errors onto errno values for FUSE replies.

use addfs_kernel::VfsError;
use libc::c_int;

/// Conversion to the errno sent back to the kernel.
pub trait ToErrno {
    fn to_errno(&self) -> c_int;
}

impl ToErrno for VfsError {
    fn to_errno(&self) -> c_int {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::AlreadyExists(_) => libc::EEXIST,
            VfsError::PermissionDenied(_) | VfsError::PathEscapesRoot(_) => libc::EACCES,
            VfsError::NotADirectory(_) => libc::ENOTDIR,
            VfsError::IsADirectory(_) => libc::EISDIR,
            VfsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            VfsError::NotASymlink(_) => libc::EINVAL,
            VfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            VfsError::Other(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_policy_denial_is_eacces() {
        assert_eq!(VfsError::permission_denied("unlink /a").to_errno(), libc::EACCES);
        assert_eq!(VfsError::path_escapes_root("../a").to_errno(), libc::EACCES);
    }

    #[test]
    fn test_common_errors() {
        assert_eq!(VfsError::not_found("a").to_errno(), libc::ENOENT);
        assert_eq!(VfsError::already_exists("a").to_errno(), libc::EEXIST);
        assert_eq!(VfsError::directory_not_empty("a").to_errno(), libc::ENOTEMPTY);
        assert_eq!(VfsError::not_a_symlink("a").to_errno(), libc::EINVAL);
        assert_eq!(VfsError::is_a_directory("a").to_errno(), libc::EISDIR);
        assert_eq!(VfsError::other("boom").to_errno(), libc::EIO);
    }

    #[test]
    fn test_os_errors_keep_their_code() {
        let err = VfsError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);

        let err = VfsError::Io(io::Error::other("no code"));
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
