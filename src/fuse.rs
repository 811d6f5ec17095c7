use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyLock, ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use log::{debug, error, warn};

use crate::PAGE_SIZE;
use crate::layout::Descriptor;
use crate::session::{EntryKind, Session};

/// Longest filename the format stores, NUL excluded.
const NAME_MAX: u32 = 1023;

/// Cache lifetimes granted to the kernel for entries and attributes.
const ENTRY_TTL: Duration = Duration::from_secs(10_000);
const ATTR_TTL: Duration = Duration::from_secs(3_600);

const GENERATION: u64 = 1;

/// Translates kernel upcalls into core calls against the session and
/// formats the replies. Borrows the session per request; the transport
/// serializes requests by handing the dispatcher out exclusively.
pub struct EfsFilesystem {
    session: Session,
}

impl EfsFilesystem {
    pub fn new(session: Session) -> EfsFilesystem {
        EfsFilesystem { session }
    }
}

fn timestamp(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn kind_of(desc: &Descriptor) -> FileType {
    if desc.is_link() {
        FileType::Symlink
    } else if desc.is_file() {
        FileType::RegularFile
    } else {
        FileType::Directory
    }
}

fn entry_kind(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    }
}

/// Attribute record served for lookup and getattr. The descriptor does
/// not track status-change time, so ctime stays at the epoch; hard
/// links do not exist, so every file reports one link.
fn attributes(desc: &Descriptor) -> FileAttr {
    FileAttr {
        ino: desc.file_id,
        size: desc.size,
        blocks: desc.size.div_ceil(PAGE_SIZE as u64) + 1,
        atime: timestamp(desc.accessed),
        mtime: timestamp(desc.modified),
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: kind_of(desc),
        perm: desc.permissions(),
        nlink: 1,
        uid: desc.owner as u32,
        gid: desc.group as u32,
        rdev: 0,
        blksize: PAGE_SIZE as u32,
        flags: 0,
    }
}

impl Filesystem for EfsFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.session.lookup(parent, name.as_bytes()) {
            Ok(desc) => reply.entry(&ENTRY_TTL, &attributes(desc), GENERATION),
            Err(err) => {
                debug!("lookup of {name:?} under {parent} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.session.getattr(ino) {
            Ok(desc) => reply.attr(&ATTR_TTL, &attributes(desc)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.session.open_file(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => {
                debug!("open of inode {ino} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.session.getattr(ino) {
            Ok(desc) if !desc.is_file() => {
                reply.error(libc::EISDIR);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        }
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let mut buf = vec![0u8; size as usize];
        match self.session.read_file(ino, offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => {
                warn!("read of inode {ino} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.session.release_file(ino) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.session.open_dir(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => {
                debug!("opendir of inode {ino} failed: {err}");
                reply.error(err.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        // Negative cursors are the end sentinel; everything else is an
        // index into the handle's snapshot, with the cursor returned
        // alongside entry i resuming after it.
        if offset < 0 {
            reply.ok();
            return;
        }
        let entries = match self.session.dir_entries(fh) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let name = OsStr::from_bytes(&entry.name);
            if reply.add(entry.ino, (i + 1) as i64, entry_kind(entry.kind), name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.session.release_dir(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        debug!("fsyncdir on inode {ino} is not implemented");
        reply.error(libc::ENOSYS);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.session.statfs();
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bfree,
            stats.files,
            stats.ffree,
            PAGE_SIZE as u32,
            NAME_MAX,
            PAGE_SIZE as u32,
        );
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        debug!("getxattr on inode {ino} is not supported");
        reply.error(libc::ENOTSUP);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        reply: ReplyLock,
    ) {
        debug!("getlk on inode {ino} is not implemented");
        reply.error(libc::ENOSYS);
    }

    fn destroy(&mut self) {
        if let Err(err) = self.session.flush() {
            error!("failed to flush image on unmount: {err:#}");
        }
    }
}
