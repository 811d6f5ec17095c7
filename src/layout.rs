use std::io::{Error, ErrorKind, Result};

use crate::enc;
use crate::{PAGE_SIZE, PageNo};

/// Magic identifier at offset 0 of page 0. Its presence is the only
/// integrity check the format carries; there is no version field, so any
/// change to the layout below is a breaking change.
pub const EFS_MAGIC: [u8; 16] = *b"EFSFILESYSTEM\0\0\0";

/* Superblock field offsets (page 0) @{ */
pub const SB_MAGIC: usize = 0;
/// Filesystem size in pages.
pub const SB_SIZE: usize = 16;
/// First page of the first descriptor node. 0 when the list is empty.
pub const SB_DESCRIPTOR_LIST: usize = 24;
/// First page of the first free-space region. 0 when the list is empty.
pub const SB_FREE_LIST: usize = 32;
/* @} */

/* Descriptor node header offsets @{ */
/// Next node page, 0 terminates the list. The list is unordered.
pub const NODE_NEXT: usize = 0;
/// Count of valid descriptors stored in this node.
pub const NODE_COUNT: usize = 8;
/* @} */

/// Descriptor slots per node. Slot `i` lives at page `node + 1 + i`.
pub const SLOTS_PER_NODE: usize = 255;
/// Pages spanned by a whole node block: the header page plus its slots.
pub const NODE_PAGES: u64 = 1 + SLOTS_PER_NODE as u64;

/* Descriptor slot field offsets @{ */
pub const FD_FILE_ID: usize = 0;
pub const FD_PARENT_ID: usize = 8;
pub const FD_FLAGS: usize = 16;
pub const FD_OWNER: usize = 18;
pub const FD_GROUP: usize = 26;
pub const FD_ACCESSED: usize = 34;
pub const FD_MODIFIED: usize = 42;
pub const FD_SIZE: usize = 50;
pub const FD_NAME: usize = 58;
/// The filename field, NUL terminator included.
pub const NAME_FIELD: usize = 1024;
pub const FD_FRAGMENTS: usize = FD_NAME + NAME_FIELD;
pub const FRAGMENT_SIZE: usize = 16;
/// The fragment array fills the rest of the slot page. When it is shorter
/// it is terminated by a fragment whose location is 0.
pub const MAX_FRAGMENTS: usize = (PAGE_SIZE - FD_FRAGMENTS) / FRAGMENT_SIZE;
/* @} */

/* Descriptor flag bits @{ */
pub const FLAG_FILE: u16 = 1 << 0;
pub const FLAG_LINK: u16 = 1 << 1;
pub const FLAG_OWNER_READ: u16 = 1 << 2;
pub const FLAG_OWNER_WRITE: u16 = 1 << 3;
pub const FLAG_OWNER_EXEC: u16 = 1 << 4;
pub const FLAG_GROUP_READ: u16 = 1 << 5;
pub const FLAG_GROUP_WRITE: u16 = 1 << 6;
pub const FLAG_GROUP_EXEC: u16 = 1 << 7;
pub const FLAG_OTHERS_READ: u16 = 1 << 8;
pub const FLAG_OTHERS_WRITE: u16 = 1 << 9;
pub const FLAG_OTHERS_EXEC: u16 = 1 << 10;
/* @} */

/// Default bits for a freshly created file: owner rw, group r, others r.
pub const FLAGS_NEW_FILE: u16 =
    FLAG_FILE | FLAG_OWNER_READ | FLAG_OWNER_WRITE | FLAG_GROUP_READ | FLAG_OTHERS_READ;

/* Free-space node offsets. The node occupies the first page of the
region it describes, and the region size includes that page. @{ */
pub const FREE_NEXT: usize = 0;
pub const FREE_SIZE: usize = 8;
/* @} */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Filesystem size in pages.
    pub size: u64,
    pub descriptor_list: PageNo,
    pub free_list: PageNo,
}

impl Superblock {
    pub fn decode(page: &[u8]) -> Result<Superblock> {
        if page[SB_MAGIC..SB_MAGIC + 16] != EFS_MAGIC {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "image does not contain a valid filesystem (bad magic)",
            ));
        }

        Ok(Superblock {
            size: enc::read_8(&page[SB_SIZE..]),
            descriptor_list: enc::read_8(&page[SB_DESCRIPTOR_LIST..]),
            free_list: enc::read_8(&page[SB_FREE_LIST..]),
        })
    }

    pub fn encode(&self, page: &mut [u8]) {
        page[SB_MAGIC..SB_MAGIC + 16].copy_from_slice(&EFS_MAGIC);
        enc::write_8(&mut page[SB_SIZE..], self.size);
        enc::write_8(&mut page[SB_DESCRIPTOR_LIST..], self.descriptor_list);
        enc::write_8(&mut page[SB_FREE_LIST..], self.free_list);
    }
}

/// Header of a descriptor node, stored in the first page of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub next: PageNo,
    pub count: u64,
}

impl NodeHeader {
    pub fn decode(page: &[u8]) -> NodeHeader {
        NodeHeader {
            next: enc::read_8(&page[NODE_NEXT..]),
            count: enc::read_8(&page[NODE_COUNT..]),
        }
    }

    pub fn encode(&self, page: &mut [u8]) {
        enc::write_8(&mut page[NODE_NEXT..], self.next);
        enc::write_8(&mut page[NODE_COUNT..], self.count);
    }
}

/// A contiguous run of pages. Files are sequences of these; the
/// free-space index trades in the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub location: PageNo,
    /// Length in pages.
    pub length: u64,
}

impl Fragment {
    /// First page past the fragment.
    pub fn end(&self) -> PageNo {
        self.location + self.length
    }

    /// Capacity in bytes.
    pub fn bytes(&self) -> u64 {
        self.length * PAGE_SIZE as u64
    }
}

/// The in-memory (compact) form of an on-disk descriptor: the filename
/// and fragment array are heap-allocated with explicit lengths, all
/// other fields are copies of the on-disk fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Unique nonzero inode. 1 is the root directory.
    pub file_id: u64,
    pub parent_id: u64,
    pub flags: u16,
    pub owner: u64,
    pub group: u64,
    pub accessed: u64,
    pub modified: u64,
    /// File size in bytes.
    pub size: u64,
    /// Filename bytes, without the NUL terminator.
    pub name: Vec<u8>,
    pub fragments: Vec<Fragment>,
}

impl Descriptor {
    pub fn decode(page: &[u8]) -> Result<Descriptor> {
        let name_field = &page[FD_NAME..FD_NAME + NAME_FIELD];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "filename is not NUL-terminated"))?;

        let mut fragments = Vec::new();
        for i in 0..MAX_FRAGMENTS {
            let at = FD_FRAGMENTS + i * FRAGMENT_SIZE;
            let location = enc::read_8(&page[at..]);
            if location == 0 {
                break;
            }
            fragments.push(Fragment {
                location,
                length: enc::read_8(&page[at + 8..]),
            });
        }

        Ok(Descriptor {
            file_id: enc::read_8(&page[FD_FILE_ID..]),
            parent_id: enc::read_8(&page[FD_PARENT_ID..]),
            flags: enc::read_2(&page[FD_FLAGS..]),
            owner: enc::read_8(&page[FD_OWNER..]),
            group: enc::read_8(&page[FD_GROUP..]),
            accessed: enc::read_8(&page[FD_ACCESSED..]),
            modified: enc::read_8(&page[FD_MODIFIED..]),
            size: enc::read_8(&page[FD_SIZE..]),
            name: name_field[..name_len].to_vec(),
            fragments,
        })
    }

    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        if self.name.len() >= NAME_FIELD {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("filename longer than {} bytes", NAME_FIELD - 1),
            ));
        }
        if self.fragments.len() > MAX_FRAGMENTS {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("more than {MAX_FRAGMENTS} fragments"),
            ));
        }

        page.fill(0);
        enc::write_8(&mut page[FD_FILE_ID..], self.file_id);
        enc::write_8(&mut page[FD_PARENT_ID..], self.parent_id);
        enc::write_2(&mut page[FD_FLAGS..], self.flags);
        enc::write_8(&mut page[FD_OWNER..], self.owner);
        enc::write_8(&mut page[FD_GROUP..], self.group);
        enc::write_8(&mut page[FD_ACCESSED..], self.accessed);
        enc::write_8(&mut page[FD_MODIFIED..], self.modified);
        enc::write_8(&mut page[FD_SIZE..], self.size);
        page[FD_NAME..FD_NAME + self.name.len()].copy_from_slice(&self.name);
        for (i, fragment) in self.fragments.iter().enumerate() {
            let at = FD_FRAGMENTS + i * FRAGMENT_SIZE;
            enc::write_8(&mut page[at..], fragment.location);
            enc::write_8(&mut page[at + 8..], fragment.length);
        }
        Ok(())
    }

    pub fn is_file(&self) -> bool {
        self.flags & FLAG_FILE != 0
    }

    pub fn is_link(&self) -> bool {
        self.flags & FLAG_LINK != 0
    }

    /// The nine permission bits in POSIX 0o777 form.
    pub fn permissions(&self) -> u16 {
        let mut mode = 0;
        for (flag, bit) in [
            (FLAG_OWNER_READ, 0o400),
            (FLAG_OWNER_WRITE, 0o200),
            (FLAG_OWNER_EXEC, 0o100),
            (FLAG_GROUP_READ, 0o040),
            (FLAG_GROUP_WRITE, 0o020),
            (FLAG_GROUP_EXEC, 0o010),
            (FLAG_OTHERS_READ, 0o004),
            (FLAG_OTHERS_WRITE, 0o002),
            (FLAG_OTHERS_EXEC, 0o001),
        ] {
            if self.flags & flag != 0 {
                mode |= bit;
            }
        }
        mode
    }

    /// Total page capacity of the fragment array.
    pub fn capacity_pages(&self) -> u64 {
        self.fragments.iter().map(|f| f.length).sum()
    }
}

/// On-disk node of the free-space list, stored in the first page of the
/// free region it describes. `size` counts that page too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeNode {
    pub next: PageNo,
    pub size: u64,
}

impl FreeNode {
    pub fn decode(page: &[u8]) -> FreeNode {
        FreeNode {
            next: enc::read_8(&page[FREE_NEXT..]),
            size: enc::read_8(&page[FREE_SIZE..]),
        }
    }

    pub fn encode(&self, page: &mut [u8]) {
        enc::write_8(&mut page[FREE_NEXT..], self.next);
        enc::write_8(&mut page[FREE_SIZE..], self.size);
    }
}
