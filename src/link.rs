//! Link graph of an inode: 5 direct links, one indirect-1 block of `count_links`
//! links, one indirect-2 block of `count_links` indirect-1 blocks.
//!
//! Leaves are always an ordered prefix of that tree: allocation fills slots
//! direct -> indirect-1 -> indirect-2 and release takes them back from the tail,
//! so the leaf order is the byte order of the file.

use super::*;
use disk::DiskInode;
use volume::Volume;

use log::{debug, warn};
use std::collections::BTreeMap;
use std::ops::ControlFlow;

/// Largest number of leaves one inode can address.
pub fn max_leaves(count_links: usize) -> usize {
    DIRECT_LINKS + count_links + count_links * count_links
}

/// Walks the populated pointer blocks in order: the direct array, the indirect-1
/// block, then every indirect-1 block under indirect-2. `visit` sees each block of
/// links once (free slots included) and stops the walk by breaking.
pub fn iterate<B, F>(vol: &Volume, inode: &DiskInode, mut visit: F) -> Result<Option<B>>
where
    F: FnMut(&[Link]) -> Result<ControlFlow<B>>,
{
    if let ControlFlow::Break(found) = visit(&inode.direct)? {
        return Ok(Some(found));
    }
    if inode.indirect1 != FREE_LINK {
        let links = vol.read_links(inode.indirect1)?;
        if let ControlFlow::Break(found) = visit(&links)? {
            return Ok(Some(found));
        }
    }
    if inode.indirect2 != FREE_LINK {
        for outer in vol.read_links(inode.indirect2)? {
            if outer == FREE_LINK {
                continue;
            }
            let links = vol.read_links(outer)?;
            if let ControlFlow::Break(found) = visit(&links)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// Data links in file order.
pub fn leaves(vol: &Volume, inode: &DiskInode) -> Result<Vec<Link>> {
    let mut out = Vec::new();
    iterate::<(), _>(vol, inode, |links| {
        out.extend(links.iter().copied().filter(|&link| link != FREE_LINK));
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(out)
}

pub fn count_leaves(vol: &Volume, inode: &DiskInode) -> Result<usize> {
    let mut count = 0;
    iterate::<(), _>(vol, inode, |links| {
        count += links.iter().filter(|&&link| link != FREE_LINK).count();
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(count)
}

/// Blocks holding links rather than data.
pub fn index_blocks(vol: &Volume, inode: &DiskInode) -> Result<Vec<Link>> {
    let mut out = Vec::new();
    if inode.indirect1 != FREE_LINK {
        out.push(inode.indirect1);
    }
    if inode.indirect2 != FREE_LINK {
        out.push(inode.indirect2);
        out.extend(
            vol.read_links(inode.indirect2)?
                .into_iter()
                .filter(|&link| link != FREE_LINK),
        );
    }
    Ok(out)
}

/// Index blocks a tree with `leaves` leaves needs.
pub fn index_blocks_for(leaves: usize, count_links: usize) -> usize {
    let beyond_direct = leaves.saturating_sub(DIRECT_LINKS);
    if beyond_direct == 0 {
        return 0;
    }
    let beyond_indirect1 = beyond_direct.saturating_sub(count_links);
    if beyond_indirect1 == 0 {
        return 1;
    }
    2 + beyond_indirect1.div_ceil(count_links)
}

/// Worst case for `n_leaf_blocks` new leaves: the leaves plus every index block
/// they may activate must fit into `n_free_blocks`.
pub fn capacity_check(n_leaf_blocks: usize, n_free_blocks: usize, count_links: usize) -> bool {
    n_leaf_blocks + index_blocks_for(n_leaf_blocks, count_links) <= n_free_blocks
}

/// `OutOfSpace` unless a fresh tree of `n_leaf_blocks` leaves plus `extra` other
/// blocks fit into what is free.
pub fn ensure_capacity(vol: &Volume, n_leaf_blocks: usize, extra: usize) -> Result<()> {
    let free = vol.free_blocks()?;
    let count_links = vol.count_links();
    if extra > free || !capacity_check(n_leaf_blocks, free - extra, count_links) {
        let needed = n_leaf_blocks + index_blocks_for(n_leaf_blocks, count_links) + extra;
        return Err(FsError::OutOfSpace { needed, free });
    }
    Ok(())
}

/// Blocks consumed by growing a tree from `current` to `current + extra` leaves.
pub fn growth_cost(current: usize, extra: usize, count_links: usize) -> usize {
    extra + index_blocks_for(current + extra, count_links)
        - index_blocks_for(current, count_links)
}

/// Pointer tables changed while staging an allocation.
/// Nothing reaches the disk except bitmap bits until every block is taken.
struct Staging<'a> {
    vol: &'a Volume,
    want: usize,
    taken: Vec<Link>,
    leaves: Vec<Link>,
    tables: BTreeMap<Link, Vec<Link>>,
}

impl Staging<'_> {
    fn take(&mut self) -> Result<Link> {
        let link = self.vol.alloc_block()?;
        self.taken.push(link);
        Ok(link)
    }

    fn done(&self) -> bool {
        self.leaves.len() == self.want
    }

    /// Fills free slots with new leaves; true when a slot changed.
    fn fill_slots(&mut self, slots: &mut [Link]) -> Result<bool> {
        let mut changed = false;
        for slot in slots.iter_mut() {
            if self.done() {
                break;
            }
            if *slot == FREE_LINK {
                *slot = self.take()?;
                self.leaves.push(*slot);
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Table behind `owner`; a free owner gets a new, zeroed index block.
    fn open_table(&mut self, owner: &mut Link) -> Result<Vec<Link>> {
        if *owner == FREE_LINK {
            *owner = self.take()?;
            Ok(vec![FREE_LINK; self.vol.count_links()])
        } else {
            self.vol.read_links(*owner)
        }
    }

    fn fill(&mut self, inode: &mut DiskInode) -> Result<()> {
        self.fill_slots(&mut inode.direct)?;

        if !self.done() {
            let mut table = self.open_table(&mut inode.indirect1)?;
            if self.fill_slots(&mut table)? {
                self.tables.insert(inode.indirect1, table);
            }
        }

        if !self.done() {
            let fresh = inode.indirect2 == FREE_LINK;
            let mut outer = self.open_table(&mut inode.indirect2)?;
            let mut outer_changed = fresh;
            for slot in outer.iter_mut() {
                if self.done() {
                    break;
                }
                let before = *slot;
                let mut table = self.open_table(slot)?;
                outer_changed |= before != *slot;
                if self.fill_slots(&mut table)? {
                    self.tables.insert(*slot, table);
                }
            }
            if outer_changed {
                self.tables.insert(inode.indirect2, outer);
            }
        }

        if !self.done() {
            return Err(FsError::OutOfLinks(inode.id));
        }
        Ok(())
    }
}

/// Adds `n` leaves to the inode and returns them in order. All or nothing: on
/// failure every block taken here goes back and the inode is left untouched.
pub fn allocate_links(vol: &Volume, inode: &mut DiskInode, n: usize) -> Result<Vec<Link>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let current = count_leaves(vol, inode)?;
    if current + n > max_leaves(vol.count_links()) {
        return Err(FsError::OutOfLinks(inode.id));
    }

    let mut staged = inode.clone();
    let mut stage = Staging {
        vol,
        want: n,
        taken: Vec::with_capacity(n),
        leaves: Vec::with_capacity(n),
        tables: BTreeMap::new(),
    };
    if let Err(err) = stage.fill(&mut staged) {
        warn!(
            "inode {}: giving back {} block(s) after: {err}",
            inode.id,
            stage.taken.len()
        );
        for &link in stage.taken.iter().rev() {
            vol.free_block(link)?;
        }
        return Err(err);
    }

    for (link, table) in &stage.tables {
        vol.write_links(*link, table)?;
    }
    vol.write_inode(&staged)?;
    *inode = staged;
    debug!(
        "inode {}: +{n} leaves, {} index block(s) written",
        inode.id,
        stage.tables.len()
    );
    Ok(stage.leaves)
}

/// Releases up to `n` leaves, deepest level first and from the tail of each
/// table. Index blocks left empty are released too. Returns the leaves freed.
pub fn free_links(vol: &Volume, inode: &mut DiskInode, n: usize) -> Result<usize> {
    let mut released = 0;

    if released < n && inode.indirect2 != FREE_LINK {
        let mut outer = vol.read_links(inode.indirect2)?;
        for slot in outer.iter_mut().rev() {
            if released == n {
                break;
            }
            if *slot != FREE_LINK {
                released += release_table(vol, slot, n - released)?;
            }
        }
        if outer.iter().all(|&link| link == FREE_LINK) {
            vol.free_block(inode.indirect2)?;
            inode.indirect2 = FREE_LINK;
        } else {
            vol.write_links(inode.indirect2, &outer)?;
        }
    }

    if released < n && inode.indirect1 != FREE_LINK {
        released += release_table(vol, &mut inode.indirect1, n - released)?;
    }

    if released < n {
        released += release_tail(vol, &mut inode.direct, n - released)?;
    }

    vol.write_inode(inode)?;
    debug!("inode {}: -{released} leaves", inode.id);
    Ok(released)
}

pub fn free_all_links(vol: &Volume, inode: &mut DiskInode) -> Result<usize> {
    free_links(vol, inode, usize::MAX)
}

/// Frees up to `want` leaves of the table behind `owner`, then the table itself
/// once it is empty.
fn release_table(vol: &Volume, owner: &mut Link, want: usize) -> Result<usize> {
    let mut table = vol.read_links(*owner)?;
    let released = release_tail(vol, &mut table, want)?;
    if table.iter().all(|&link| link == FREE_LINK) {
        vol.free_block(*owner)?;
        *owner = FREE_LINK;
    } else {
        vol.write_links(*owner, &table)?;
    }
    Ok(released)
}

fn release_tail(vol: &Volume, slots: &mut [Link], want: usize) -> Result<usize> {
    let mut released = 0;
    for slot in slots.iter_mut().rev() {
        if released == want {
            break;
        }
        if *slot != FREE_LINK {
            vol.free_block(*slot)?;
            *slot = FREE_LINK;
            released += 1;
        }
    }
    Ok(released)
}

/// The first `file_size` bytes behind the leaves.
pub fn read_data(vol: &Volume, inode: &DiskInode) -> Result<Vec<u8>> {
    let size = inode.file_size as usize;
    let mut out = Vec::with_capacity(size);
    iterate(vol, inode, |links| {
        for &link in links.iter().filter(|&&link| link != FREE_LINK) {
            if out.len() >= size {
                return Ok(ControlFlow::Break(()));
            }
            let block = vol.read_block(link)?;
            let take = block.len().min(size - out.len());
            out.extend_from_slice(&block[..take]);
        }
        Ok(ControlFlow::Continue(()))
    })?;
    if out.len() < size {
        return Err(FsError::inconsistent(format!(
            "inode {}: {} of {size} bytes reachable",
            inode.id,
            out.len()
        )));
    }
    Ok(out)
}

/// Replaces the content, growing or shrinking the leaf set to fit.
pub fn write_data(vol: &Volume, inode: &mut DiskInode, data: &[u8]) -> Result<()> {
    let file_size = u32::try_from(data.len())
        .map_err(|_| FsError::OutOfLinks(inode.id))?;
    let want = data.len().div_ceil(vol.block_size());
    let current = count_leaves(vol, inode)?;
    if want > current {
        allocate_links(vol, inode, want - current)?;
    } else if want < current {
        free_links(vol, inode, current - want)?;
    }

    for (link, chunk) in leaves(vol, inode)?.into_iter().zip(data.chunks(vol.block_size())) {
        vol.write_block(link, chunk)?;
    }
    inode.file_size = file_size;
    vol.write_inode(inode)
}
