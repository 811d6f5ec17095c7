use std::io;

use thiserror::Error;

/// The error taxonomy of the host contract. Every variant maps onto a
/// single errno; validation failures never mutate state.
#[derive(Debug, Error)]
pub enum EfsError {
    #[error("no such inode {0}")]
    NotFound(u64),

    #[error("no entry named {name:?} under inode {parent}")]
    NoEntry { parent: u64, name: String },

    #[error("inode {0} is a directory")]
    IsDirectory(u64),

    #[error("inode {0} is not a directory")]
    NotDirectory(u64),

    #[error("access denied on inode {0}")]
    AccessDenied(u64),

    #[error("write access requested on a read-only directory handle")]
    ReadOnly,

    #[error("bad handle {0}")]
    BadHandle(u64),

    #[error("not enough free space for {0} pages")]
    NoSpace(u64),

    #[error("inode {0} cannot be fragmented further")]
    TooFragmented(u64),

    #[error("descriptor for inode {0} is stale")]
    Stale(u64),

    #[error("session is degraded, mutations refused until remount")]
    Degraded,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl EfsError {
    /// The errno delivered to the host for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            EfsError::NotFound(_) | EfsError::NoEntry { .. } => libc::ENOENT,
            EfsError::IsDirectory(_) => libc::EISDIR,
            EfsError::NotDirectory(_) => libc::ENOTDIR,
            EfsError::AccessDenied(_) => libc::EACCES,
            EfsError::ReadOnly => libc::EROFS,
            EfsError::BadHandle(_) => libc::EBADF,
            EfsError::NoSpace(_) | EfsError::TooFragmented(_) => libc::ENOSPC,
            EfsError::Stale(_) => libc::ESTALE,
            EfsError::Degraded | EfsError::Io(_) => libc::EIO,
        }
    }
}
