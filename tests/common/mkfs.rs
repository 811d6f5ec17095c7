// Builds pristine filesystem images for the integration suites. The
// shipped binary never creates images; the suites need them.
#![allow(dead_code)]

use std::fs;
use std::path::Path;

use efsfuse::layout::{self, Descriptor, FreeNode, Fragment, NodeHeader, Superblock};
use efsfuse::{PAGE_SIZE, ROOT_INODE};

/// Page of the descriptor-node header in images built here. Page 1 holds
/// the root directory's single fragment.
pub const NODE_PAGE: u64 = 2;

/// First page past the node block; basic images carry one free region
/// from here to the end of the image.
pub const FREE_PAGE: u64 = NODE_PAGE + layout::NODE_PAGES;

pub struct Mkfs {
    pub total_pages: u64,
    /// Placed into slots 0.. of the node block, in order.
    pub descriptors: Vec<Descriptor>,
    /// Free regions, chained in the order given.
    pub free: Vec<Fragment>,
}

pub fn root() -> Descriptor {
    Descriptor {
        file_id: ROOT_INODE,
        parent_id: ROOT_INODE,
        flags: layout::FLAG_OWNER_READ
            | layout::FLAG_OWNER_WRITE
            | layout::FLAG_OWNER_EXEC
            | layout::FLAG_GROUP_READ
            | layout::FLAG_GROUP_EXEC
            | layout::FLAG_OTHERS_READ
            | layout::FLAG_OTHERS_EXEC,
        owner: 0,
        group: 0,
        accessed: 1_700_000_000,
        modified: 1_700_000_000,
        size: 0,
        name: Vec::new(),
        fragments: vec![Fragment { location: 1, length: 1 }],
    }
}

pub fn file(
    file_id: u64,
    parent: u64,
    name: &[u8],
    size: u64,
    fragments: Vec<Fragment>,
) -> Descriptor {
    Descriptor {
        file_id,
        parent_id: parent,
        flags: layout::FLAGS_NEW_FILE,
        owner: 0,
        group: 0,
        accessed: 1_700_000_000,
        modified: 1_700_000_000,
        size,
        name: name.to_vec(),
        fragments,
    }
}

/// An image holding only the root directory, with everything past the
/// node block free.
pub fn basic(total_pages: u64) -> Mkfs {
    assert!(total_pages > FREE_PAGE);
    Mkfs {
        total_pages,
        descriptors: vec![root()],
        free: vec![Fragment { location: FREE_PAGE, length: total_pages - FREE_PAGE }],
    }
}

impl Mkfs {
    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.total_pages as usize * PAGE_SIZE];

        let superblock = Superblock {
            size: self.total_pages,
            descriptor_list: NODE_PAGE,
            free_list: self.free.first().map_or(0, |f| f.location),
        };
        superblock.encode(page_mut(&mut image, 0));

        NodeHeader { next: 0, count: self.descriptors.len() as u64 }
            .encode(page_mut(&mut image, NODE_PAGE));
        for (slot, desc) in self.descriptors.iter().enumerate() {
            desc.encode(page_mut(&mut image, NODE_PAGE + 1 + slot as u64))
                .expect("descriptor fits its slot");
        }

        for (i, region) in self.free.iter().enumerate() {
            let next = self.free.get(i + 1).map_or(0, |r| r.location);
            FreeNode { next, size: region.length }.encode(page_mut(&mut image, region.location));
        }

        image
    }

    pub fn write_to(&self, path: &Path) {
        fs::write(path, self.build()).expect("write image");
    }
}

pub fn page_mut(image: &mut [u8], page: u64) -> &mut [u8] {
    let at = page as usize * PAGE_SIZE;
    &mut image[at..at + PAGE_SIZE]
}
