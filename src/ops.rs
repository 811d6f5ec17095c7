use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::EfsError;
use crate::layout::{self, Descriptor, FreeNode, Fragment, NodeHeader};
use crate::session::Session;
use crate::table::{FileEntry, SlotAddr};
use crate::{PAGE_SIZE, PageNo, ROOT_INODE, enc};

/// Chunk used when growing a file with zeros.
const ZERO_CHUNK: usize = 16 * PAGE_SIZE;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Session {
    /// Create an empty file under `parent` and persist its descriptor.
    /// Assigns the smallest unused positive file-ID; the filename starts
    /// empty and is set through [`Session::update_descriptor`].
    pub fn create_file(&mut self, parent: u64) -> Result<u64, EfsError> {
        self.check_writable()?;
        let parent_entry = self.table.lookup(parent).ok_or(EfsError::NotFound(parent))?;
        if parent_entry.desc.is_file() {
            return Err(EfsError::NotDirectory(parent));
        }

        let file_id = self.table.next_file_id();
        let now = unix_now();
        let desc = Descriptor {
            file_id,
            parent_id: parent,
            flags: layout::FLAGS_NEW_FILE,
            owner: unsafe { libc::geteuid() } as u64,
            group: unsafe { libc::getegid() } as u64,
            accessed: now,
            modified: now,
            size: 0,
            name: Vec::new(),
            fragments: Vec::new(),
        };

        let slot = self.find_free_slot()?;
        self.store_descriptor(&desc, slot)?;
        self.bump_node_count(slot.node, 1)?;
        self.flush_free_list()?;
        self.table.insert(FileEntry { desc, slot });
        debug!("created inode {file_id} under {parent} in slot {} of node {}", slot.slot, slot.node);
        Ok(file_id)
    }

    /// Release all space held by `inode` and clear its descriptor slot.
    /// Children of a deleted directory are orphaned, not deleted.
    pub fn delete_file(&mut self, inode: u64) -> Result<(), EfsError> {
        self.delete_resolved(inode, None)
    }

    /// Descriptor form of delete: additionally fails when the on-disk
    /// slot no longer carries the supplied descriptor's file-ID.
    pub fn delete_descriptor(&mut self, descriptor: &Descriptor) -> Result<(), EfsError> {
        self.delete_resolved(descriptor.file_id, Some(descriptor.file_id))
    }

    fn delete_resolved(&mut self, inode: u64, expect: Option<u64>) -> Result<(), EfsError> {
        self.check_writable()?;
        if inode == ROOT_INODE {
            return Err(EfsError::AccessDenied(inode));
        }
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        let slot = entry.slot;
        let fragments = entry.desc.fragments.clone();

        if let Some(expected) = expect {
            let on_disk = self.slot_file_id(slot)?;
            if on_disk != expected {
                return Err(EfsError::Stale(inode));
            }
        }

        self.image
            .page_mut(slot.page())
            .map(|page| page.fill(0))
            .map_err(|err| self.fail_io(err))?;
        self.bump_node_count(slot.node, -1)?;
        self.free.release_all(fragments);
        self.flush_free_list()?;
        self.table.remove(inode);
        debug!("deleted inode {inode}");
        Ok(())
    }

    /// Read the descriptor for `inode` back from its on-disk slot.
    pub fn read_descriptor(&self, inode: u64) -> Result<Descriptor, EfsError> {
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        let page = self.image.page(entry.slot.page())?;
        Ok(Descriptor::decode(page)?)
    }

    /// Overwrite the on-disk descriptor whose file-ID matches the one
    /// supplied, and mirror the change into the index. Fails with a
    /// staleness error when the slot holds a different file-ID.
    pub fn update_descriptor(&mut self, descriptor: &Descriptor) -> Result<(), EfsError> {
        self.check_writable()?;
        let inode = descriptor.file_id;
        let slot = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?.slot;
        if self.slot_file_id(slot)? != inode {
            return Err(EfsError::Stale(inode));
        }
        self.store_descriptor(descriptor, slot)?;
        self.table.insert(FileEntry { desc: descriptor.clone(), slot });
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `offset`, walking the
    /// fragment array and crossing fragment boundaries as needed. Reads
    /// past EOF are clamped; an offset at or past EOF reads 0 bytes. An
    /// I/O failure is reported as an error, never as a short read.
    pub fn read_file(&self, inode: u64, offset: u64, buf: &mut [u8]) -> Result<usize, EfsError> {
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        let desc = &entry.desc;
        if offset >= desc.size {
            return Ok(0);
        }
        let len = buf.len().min((desc.size - offset) as usize);

        let mut skip = offset;
        let mut read = 0;
        for fragment in &desc.fragments {
            if read == len {
                break;
            }
            let capacity = fragment.bytes();
            if skip >= capacity {
                skip -= capacity;
                continue;
            }
            let take = ((capacity - skip) as usize).min(len - read);
            let src = self.image.range(fragment.location, skip, take)?;
            buf[read..read + take].copy_from_slice(src);
            read += take;
            skip = 0;
        }
        Ok(read)
    }

    /// In-place overwrite starting at `offset`. Never extends the file:
    /// a write reaching EOF stops there and reports the short count.
    pub fn update_file(&mut self, inode: u64, offset: u64, data: &[u8]) -> Result<usize, EfsError> {
        self.check_writable()?;
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        let desc = entry.desc.clone();
        if offset >= desc.size {
            return Ok(0);
        }
        let len = data.len().min((desc.size - offset) as usize);
        self.write_into(&desc, offset, &data[..len])?;
        Ok(len)
    }

    /// Append `data` at EOF, updating the fragment array and file size
    /// on disk. The tail slack of the last fragment is filled first;
    /// then the last fragment is grown in place when the pages right
    /// after it are free; new fragments are allocated for the rest.
    /// Timestamps are left to the caller.
    pub fn append_file(&mut self, inode: u64, data: &[u8]) -> Result<(), EfsError> {
        self.check_writable()?;
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        let (mut desc, slot) = (entry.desc.clone(), entry.slot);
        if data.is_empty() {
            return Ok(());
        }

        self.grow_fragments(&mut desc, data.len() as u64)?;
        let offset = desc.size;
        self.write_into(&desc, offset, data)?;
        desc.size += data.len() as u64;
        self.store_descriptor(&desc, slot)?;
        self.flush_free_list()?;
        self.table.insert(FileEntry { desc, slot });
        Ok(())
    }

    /// Change the file size. Growth reserves the whole delta before any
    /// write and back-fills it with zeros, so a failed reservation
    /// leaves the file untouched. Shrinking releases whole tail
    /// fragments and then the spare tail pages of the last fragment
    /// kept, so the retained capacity stays within one page of the new
    /// size.
    pub fn resize_file(&mut self, inode: u64, new_size: u64) -> Result<(), EfsError> {
        self.check_writable()?;
        let entry = self.table.lookup(inode).ok_or(EfsError::NotFound(inode))?;
        let (mut desc, slot) = (entry.desc.clone(), entry.slot);
        if new_size == desc.size {
            return Ok(());
        }

        if new_size > desc.size {
            let delta = new_size - desc.size;
            self.grow_fragments(&mut desc, delta)?;
            let zeros = vec![0u8; ZERO_CHUNK.min(delta as usize)];
            let mut at = desc.size;
            while at < new_size {
                let n = ((new_size - at) as usize).min(zeros.len());
                self.write_into(&desc, at, &zeros[..n])?;
                at += n as u64;
            }
        } else {
            let need_pages = new_size.div_ceil(PAGE_SIZE as u64);
            let mut freed = Vec::new();

            while let Some(&last) = desc.fragments.last() {
                if desc.capacity_pages() - last.length >= need_pages {
                    desc.fragments.pop();
                    freed.push(last);
                } else {
                    break;
                }
            }
            let before_last =
                desc.capacity_pages() - desc.fragments.last().map_or(0, |f| f.length);
            if let Some(last) = desc.fragments.last_mut() {
                let keep = need_pages - before_last;
                if keep < last.length {
                    freed.push(Fragment {
                        location: last.location + keep,
                        length: last.length - keep,
                    });
                    last.length = keep;
                }
            }
            self.free.release_all(freed);
        }

        desc.size = new_size;
        self.store_descriptor(&desc, slot)?;
        self.flush_free_list()?;
        self.table.insert(FileEntry { desc, slot });
        Ok(())
    }

    /* persistence plumbing */

    /// Extend the fragment array so the file can take `extra` more
    /// bytes: the tail slack counts first, then the last fragment grows
    /// in place when the pages right after it are free, then new
    /// fragments cover the rest. Touches only the free-space index and
    /// the descriptor copy; on failure every page already taken is
    /// returned to the index before the error propagates.
    fn grow_fragments(&mut self, desc: &mut Descriptor, extra: u64) -> Result<(), EfsError> {
        let slack = desc.capacity_pages() * PAGE_SIZE as u64 - desc.size;
        let need_pages = extra.saturating_sub(slack).div_ceil(PAGE_SIZE as u64);
        if need_pages == 0 {
            return Ok(());
        }

        let grown = match desc.fragments.last() {
            Some(last) => self.free.allocate_at(last.end(), need_pages),
            None => None,
        };
        let still = need_pages - grown.map_or(0, |g| g.length);

        let appended = if still > 0 {
            match self.free.allocate(still, false) {
                Ok(fragments) => fragments,
                Err(err) => {
                    // return the partial reservation before failing
                    if let Some(g) = grown {
                        self.free.release(g);
                    }
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        if desc.fragments.len() + appended.len() > layout::MAX_FRAGMENTS {
            self.free.release_all(appended);
            if let Some(g) = grown {
                self.free.release(g);
            }
            return Err(EfsError::TooFragmented(desc.file_id));
        }

        if let (Some(g), Some(last)) = (grown, desc.fragments.last_mut()) {
            last.length += g.length;
        }
        desc.fragments.extend(appended);
        Ok(())
    }

    /// Write `data` at byte `offset` of the file described by `desc`.
    /// The caller guarantees the fragment array has the capacity.
    fn write_into(&mut self, desc: &Descriptor, offset: u64, data: &[u8]) -> Result<(), EfsError> {
        let mut skip = offset;
        let mut written = 0;
        for fragment in &desc.fragments {
            if written == data.len() {
                break;
            }
            let capacity = fragment.bytes();
            if skip >= capacity {
                skip -= capacity;
                continue;
            }
            let take = ((capacity - skip) as usize).min(data.len() - written);
            self.image
                .range_mut(fragment.location, skip, take)
                .map(|dst| dst.copy_from_slice(&data[written..written + take]))
                .map_err(|err| self.fail_io(err))?;
            written += take;
            skip = 0;
        }
        debug_assert_eq!(written, data.len());
        Ok(())
    }

    fn slot_file_id(&self, slot: SlotAddr) -> Result<u64, EfsError> {
        let field = self.image.range(slot.page(), layout::FD_FILE_ID as u64, 8)?;
        Ok(enc::read_8(field))
    }

    /// Encode a descriptor into its slot page.
    fn store_descriptor(&mut self, desc: &Descriptor, slot: SlotAddr) -> Result<(), EfsError> {
        let mut buf = [0u8; PAGE_SIZE];
        desc.encode(&mut buf)?;
        self.image
            .page_mut(slot.page())
            .map(|page| page.copy_from_slice(&buf))
            .map_err(|err| self.fail_io(err))
    }

    fn bump_node_count(&mut self, node: PageNo, delta: i64) -> Result<(), EfsError> {
        let result = (|| -> io::Result<()> {
            let page = self.image.page_mut(node)?;
            let mut header = NodeHeader::decode(page);
            header.count = header.count.saturating_add_signed(delta);
            header.encode(page);
            Ok(())
        })();
        result.map_err(|err| self.fail_io(err))
    }

    /// Find an empty descriptor slot, scanning the node list in order;
    /// when every slot is taken, extend the list with a fresh node block.
    fn find_free_slot(&mut self) -> Result<SlotAddr, EfsError> {
        for i in 0..self.node_pages.len() {
            let node = self.node_pages[i];
            for slot in 0..layout::SLOTS_PER_NODE {
                let addr = SlotAddr { node, slot };
                let id = self.slot_file_id(addr)?;
                if id == 0 {
                    return Ok(addr);
                }
            }
        }
        self.append_node_block()
    }

    /// Allocate, zero, and link one contiguous node block (header page
    /// plus 255 slot pages) at the tail of the descriptor list.
    fn append_node_block(&mut self) -> Result<SlotAddr, EfsError> {
        let extent = self.free.allocate(layout::NODE_PAGES, true)?;
        let node = extent[0].location;

        let result = (|| -> io::Result<()> {
            for p in 0..layout::NODE_PAGES {
                self.image.page_mut(node + p)?.fill(0);
            }
            NodeHeader { next: 0, count: 0 }.encode(self.image.page_mut(node)?);
            match self.node_pages.last() {
                Some(&tail) => {
                    let page = self.image.page_mut(tail)?;
                    let mut header = NodeHeader::decode(page);
                    header.next = node;
                    header.encode(page);
                }
                None => self.superblock.descriptor_list = node,
            }
            Ok(())
        })();
        if let Err(err) = result {
            self.free.release(extent[0]);
            return Err(self.fail_io(err));
        }

        self.node_pages.push(node);
        debug!("descriptor list extended with a node block at page {node}");
        Ok(SlotAddr { node, slot: 0 })
    }

    /// Rewrite the on-disk free-space chain and the superblock pointers
    /// from the in-memory index. Node pages land only inside regions
    /// that are currently free.
    pub(crate) fn flush_free_list(&mut self) -> Result<(), EfsError> {
        let regions: Vec<Fragment> = self.free.regions().collect();
        let result = (|| -> io::Result<()> {
            for (i, region) in regions.iter().enumerate() {
                let next = regions.get(i + 1).map_or(0, |r| r.location);
                FreeNode { next, size: region.length }
                    .encode(self.image.page_mut(region.location)?);
            }
            self.superblock.free_list = regions.first().map_or(0, |r| r.location);
            self.superblock.encode(self.image.page_mut(0)?);
            Ok(())
        })();
        result.map_err(|err| self.fail_io(err))
    }
}
