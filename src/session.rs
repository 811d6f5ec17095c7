use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;

use anyhow::Context;
use log::{debug, info, warn};

use crate::error::EfsError;
use crate::freespace::FreeSpaceTable;
use crate::image::Image;
use crate::layout::{self, Descriptor, FreeNode, Fragment, NodeHeader, Superblock};
use crate::table::{FileEntry, FileTable, SlotAddr};
use crate::{PageNo, enc};

/// What a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    fn of(desc: &Descriptor) -> EntryKind {
        if desc.is_link() {
            EntryKind::Symlink
        } else if desc.is_file() {
            EntryKind::File
        } else {
            EntryKind::Directory
        }
    }
}

/// One entry of a directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: Vec<u8>,
    pub kind: EntryKind,
}

/// A snapshot of a directory's children, owned by an opendir handle.
/// Readdir cursors index into this sequence, which stays valid until the
/// handle is released.
#[derive(Debug)]
struct DirHandle {
    ino: u64,
    entries: Vec<DirEntry>,
}

/// Filesystem totals reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
    pub ffree: u64,
}

/// State that must persist between host requests: the image handle, the
/// superblock copy, both in-memory indices, and the open-file and
/// directory-handle sets. Owns everything for the lifetime of a mount;
/// request handlers borrow it per call.
#[derive(Debug)]
pub struct Session {
    pub(crate) image: Image,
    pub(crate) superblock: Superblock,
    pub(crate) table: FileTable,
    pub(crate) free: FreeSpaceTable,
    /// Pages of the descriptor-node headers, in list order.
    pub(crate) node_pages: Vec<PageNo>,
    /// Inodes currently open for writing.
    open_files: BTreeSet<u64>,
    dir_handles: HashMap<u64, DirHandle>,
    next_handle: u64,
    /// Set on the first I/O failure inside a mutation; mutations are
    /// refused afterwards until remount.
    degraded: bool,
}

impl Session {
    /// Mount bring-up: map the image, parse the superblock, load both
    /// on-disk lists into the in-memory indices, start with an empty
    /// open-file set.
    pub fn open(path: &Path) -> anyhow::Result<Session> {
        let image = Image::open(path)?;

        let superblock = Superblock::decode(image.page(0).context("read superblock")?)
            .context("parse superblock")?;
        debug!(
            "superblock: {} pages, descriptor list at page {}, free list at page {}",
            superblock.size, superblock.descriptor_list, superblock.free_list
        );

        let (table, node_pages) = Session::load_file_table(&image, superblock.descriptor_list)?;
        let free = Session::load_free_table(&image, superblock.free_list)?;

        info!(
            "mounted filesystem with {} pages, {} files, {} pages free",
            superblock.size,
            table.len(),
            free.total_free()
        );

        Ok(Session {
            image,
            superblock,
            table,
            free,
            node_pages,
            open_files: BTreeSet::new(),
            dir_handles: HashMap::new(),
            next_handle: 1,
            degraded: false,
        })
    }

    /// Walk the unrolled descriptor list and decode every occupied slot.
    fn load_file_table(image: &Image, head: PageNo) -> anyhow::Result<(FileTable, Vec<PageNo>)> {
        let mut table = FileTable::new();
        let mut node_pages = Vec::new();

        let mut next = head;
        while next != 0 {
            if (node_pages.len() as u64 + 1) * layout::NODE_PAGES > image.pages() {
                return Err(anyhow::anyhow!("descriptor node list does not terminate"));
            }

            let header = NodeHeader::decode(
                image
                    .page(next)
                    .with_context(|| format!("read descriptor node at page {next}"))?,
            );
            debug!("descriptor node at page {next} holds {} entries", header.count);

            for slot in 0..layout::SLOTS_PER_NODE {
                let addr = SlotAddr { node: next, slot };
                let page = image
                    .page(addr.page())
                    .with_context(|| format!("read descriptor slot {slot} of node {next}"))?;
                if enc::read_8(&page[layout::FD_FILE_ID..]) == 0 {
                    continue;
                }
                let desc = Descriptor::decode(page)
                    .with_context(|| format!("decode descriptor slot {slot} of node {next}"))?;
                table.insert(FileEntry { desc, slot: addr });
            }

            node_pages.push(next);
            next = header.next;
        }

        Ok((table, node_pages))
    }

    /// Walk the free-space list. The list must be strictly ascending and
    /// non-overlapping; a violation aborts the mount.
    fn load_free_table(image: &Image, head: PageNo) -> anyhow::Result<FreeSpaceTable> {
        let mut free = FreeSpaceTable::new();

        let mut next = head;
        let mut last_end = 0;
        let mut seen = 0u64;
        while next != 0 {
            seen += 1;
            if seen > image.pages() {
                return Err(anyhow::anyhow!("free-space list does not terminate"));
            }
            let node = FreeNode::decode(
                image
                    .page(next)
                    .with_context(|| format!("read free-space node at page {next}"))?,
            );
            if next < last_end {
                return Err(anyhow::anyhow!(
                    "free-space list out of order at page {next} (previous region ends at {last_end})",
                ));
            }
            debug!("free region at page {next} spanning {} pages", node.size);
            free.release(Fragment { location: next, length: node.size });
            last_end = next + node.size;
            next = node.next;
        }

        Ok(free)
    }

    pub fn table(&self) -> &FileTable {
        &self.table
    }

    pub fn free(&self) -> &FreeSpaceTable {
        &self.free
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn descriptor_nodes(&self) -> &[PageNo] {
        &self.node_pages
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Refuse mutations once the session is degraded.
    pub(crate) fn check_writable(&self) -> Result<(), EfsError> {
        if self.degraded { Err(EfsError::Degraded) } else { Ok(()) }
    }

    /// Record an I/O failure inside a mutation. The in-memory indices may
    /// now disagree with disk, so the session stops accepting mutations.
    pub(crate) fn fail_io(&mut self, err: io::Error) -> EfsError {
        warn!("i/o failure, marking session degraded: {err}");
        self.degraded = true;
        EfsError::Io(err)
    }

    /* host verbs */

    /// Resolve `name` under `parent`. `.` and `..` resolve to the parent
    /// itself; anything else is an exact byte match among its children.
    pub fn lookup(&self, parent: u64, name: &[u8]) -> Result<&Descriptor, EfsError> {
        if name == b"." || name == b".." {
            return self.getattr(parent);
        }
        self.table
            .lookup_child(parent, name)
            .map(|entry| &entry.desc)
            .ok_or_else(|| EfsError::NoEntry {
                parent,
                name: String::from_utf8_lossy(name).into_owned(),
            })
    }

    pub fn getattr(&self, inode: u64) -> Result<&Descriptor, EfsError> {
        self.table
            .lookup(inode)
            .map(|entry| &entry.desc)
            .ok_or(EfsError::NotFound(inode))
    }

    /// Open a regular file. A second open while the inode sits in the
    /// open set is refused; any write access enters the inode into the
    /// open set until release.
    pub fn open_file(&mut self, inode: u64, flags: i32) -> Result<(), EfsError> {
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        if !entry.desc.is_file() {
            return Err(EfsError::IsDirectory(inode));
        }
        if self.open_files.contains(&inode) {
            return Err(EfsError::AccessDenied(inode));
        }
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            self.open_files.insert(inode);
        }
        debug!("opened inode {inode}");
        Ok(())
    }

    pub fn release_file(&mut self, inode: u64) -> Result<(), EfsError> {
        if self.open_files.remove(&inode) { Ok(()) } else { Err(EfsError::BadHandle(inode)) }
    }

    /// Open a directory read-only and snapshot its children into a
    /// handle-owned sequence, in ascending inode order.
    pub fn open_dir(&mut self, inode: u64, flags: i32) -> Result<u64, EfsError> {
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        if entry.desc.is_file() {
            return Err(EfsError::NotDirectory(inode));
        }
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(EfsError::ReadOnly);
        }

        let entries: Vec<DirEntry> = self
            .table
            .children(inode)
            .map(|child| DirEntry {
                ino: child.desc.file_id,
                name: child.desc.name.clone(),
                kind: EntryKind::of(&child.desc),
            })
            .collect();

        let fh = self.next_handle;
        self.next_handle += 1;
        debug!("opened directory {inode} as handle {fh} with {} entries", entries.len());
        self.dir_handles.insert(fh, DirHandle { ino: inode, entries });
        Ok(fh)
    }

    /// The snapshot behind a directory handle.
    pub fn dir_entries(&self, fh: u64) -> Result<&[DirEntry], EfsError> {
        self.dir_handles
            .get(&fh)
            .map(|handle| handle.entries.as_slice())
            .ok_or(EfsError::BadHandle(fh))
    }

    pub fn release_dir(&mut self, fh: u64) -> Result<(), EfsError> {
        self.dir_handles
            .remove(&fh)
            .map(|handle| debug!("released directory handle {fh} (inode {})", handle.ino))
            .ok_or(EfsError::BadHandle(fh))
    }

    pub fn statfs(&self) -> FsStats {
        let slots = (self.node_pages.len() * layout::SLOTS_PER_NODE) as u64;
        FsStats {
            blocks: self.superblock.size,
            bfree: self.free.total_free(),
            files: self.table.len() as u64,
            ffree: slots.saturating_sub(self.table.len() as u64),
        }
    }

    /// Teardown: push descriptor and free-list writes out to the image.
    pub fn flush(&self) -> anyhow::Result<()> {
        self.image.flush_all()
    }
}
