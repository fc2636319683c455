//! Reachability check. Inodes marked used but unreachable from the root are
//! relinked into `lost+found` under random names; bitmap bits that disagree with
//! the tree are repaired where the fix is unambiguous.

use super::*;
use bitmap::SLOT_USED;
use disk::{DiskInode, InodeKind, Name};
use fs::FileSystem;
use volume::Volume;

use log::{info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsckStatus {
    Ok,
    /// something was repaired, the tree is consistent now
    Recovered,
    /// damage remains that fsck cannot repair
    Corrupted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsckReport {
    /// used in the inode bitmap, unreachable from the root
    pub lost: usize,
    /// lost inodes relinked into `lost+found` and the names they got
    pub recovered: Vec<(InodeId, String)>,
    /// reachable inodes whose bit was free
    pub remarked: usize,
    /// used bits with no live inode behind them
    pub released: usize,
    /// directory entries removed because their target was free or out of range
    pub unlinked: usize,
    /// used data blocks no inode refers to
    pub leaked_blocks: usize,
    /// links out of range or pointing at free blocks
    pub damaged_links: usize,
    /// unreadable directories and entries that could not be unlinked
    pub damaged_entries: usize,
    pub status: FsckStatus,
}

impl FsckReport {
    fn new() -> Self {
        Self {
            lost: 0,
            recovered: Vec::new(),
            remarked: 0,
            released: 0,
            unlinked: 0,
            leaked_blocks: 0,
            damaged_links: 0,
            damaged_entries: 0,
            status: FsckStatus::Ok,
        }
    }
}

impl fmt::Display for FsckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsckStatus::Ok => "OK",
            FsckStatus::Recovered => "RECOVERED",
            FsckStatus::Corrupted => "CORRUPTED",
        })
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if self.status == FsckStatus::Ok {
            return Ok(());
        }
        write!(
            f,
            ": lost {}, recovered {}, re-marked {}, released {}, unlinked {}, \
             leaked blocks {}, damaged links {}, damaged entries {}",
            self.lost,
            self.recovered.len(),
            self.remarked,
            self.released,
            self.unlinked,
            self.leaked_blocks,
            self.damaged_links,
            self.damaged_entries
        )?;
        for (id, name) in &self.recovered {
            write!(f, "\n  {id} -> /{LOST_FOUND}/{name}")?;
        }
        Ok(())
    }
}

impl FileSystem {
    /// Checks the image and repairs what it can. Running it again right after
    /// reports `Ok` and writes nothing.
    pub fn fsck(&mut self) -> Result<FsckReport> {
        self.track(|fs| {
            let report = Checker::new(fs.volume()).run()?;
            info!(
                "fsck: {}, {} lost, {} recovered",
                report.status,
                report.lost,
                report.recovered.len()
            );
            Ok(report)
        })
    }
}

/// Damage shows up as `InternalInconsistency`; the checker counts it and moves on.
fn tolerate<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == ErrorKind::InternalInconsistency => Ok(None),
        Err(err) => Err(err),
    }
}

struct Walk {
    reached: BTreeSet<InodeId>,
    /// directories whose entries could not be read
    unreadable: usize,
    /// (directory, target) of entries pointing at no live inode
    dangling: Vec<(InodeId, InodeId)>,
}

/// Inodes reachable from directory `start` through entries other than the dots.
/// `start` itself is only included when a cycle leads back to it.
fn walk(vol: &Volume, start: InodeId) -> Result<Walk> {
    let mut walk = Walk {
        reached: BTreeSet::new(),
        unreadable: 0,
        dangling: Vec::new(),
    };
    let mut pending = vec![start];
    while let Some(id) = pending.pop() {
        let listed = vol
            .read_inode(id)
            .and_then(|inode| dir::entries(vol, &inode));
        let Some(entries) = tolerate(listed)? else {
            walk.unreadable += 1;
            continue;
        };
        for entry in entries.iter().filter(|entry| !entry.is_dot()) {
            match tolerate(vol.read_inode(entry.inode_id))? {
                Some(inode) if !inode.is_free() => {
                    if walk.reached.insert(inode.id) && inode.is_dir() {
                        pending.push(inode.id);
                    }
                }
                _ => {
                    warn!("dir {id}: `{}` -> {} is dangling", entry.name(), entry.inode_id);
                    walk.dangling.push((id, entry.inode_id));
                }
            }
        }
    }
    Ok(walk)
}

fn random_name() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(Name::MAX)
        .map(char::from)
        .collect()
}

struct Checker<'a> {
    vol: &'a Volume,
    report: FsckReport,
    /// lost inodes could not all be relinked
    unresolved: bool,
}

impl<'a> Checker<'a> {
    fn new(vol: &'a Volume) -> Self {
        Self {
            vol,
            report: FsckReport::new(),
            unresolved: false,
        }
    }

    fn run(mut self) -> Result<FsckReport> {
        let first = walk(self.vol, ROOT_ID)?;
        self.unlink_dangling(&first.dangling)?;
        let mut reached = first.reached;
        reached.insert(ROOT_ID);
        self.remark(&reached)?;

        let lost = self.lost(&reached)?;
        self.report.lost = lost.len();
        if !lost.is_empty() {
            self.recover(&lost)?;
        }

        let last = walk(self.vol, ROOT_ID)?;
        self.report.damaged_entries = last.unreadable + last.dangling.len();
        self.audit_blocks()?;

        let mut report = self.report;
        report.status = if self.unresolved
            || report.damaged_links > 0
            || report.damaged_entries > 0
        {
            FsckStatus::Corrupted
        } else if report.lost > 0
            || report.remarked > 0
            || report.released > 0
            || report.unlinked > 0
            || report.leaked_blocks > 0
        {
            FsckStatus::Recovered
        } else {
            FsckStatus::Ok
        };
        Ok(report)
    }

    /// Removes entries whose target is out of range or free.
    fn unlink_dangling(&mut self, dangling: &[(InodeId, InodeId)]) -> Result<()> {
        let mut by_dir: BTreeMap<InodeId, BTreeSet<InodeId>> = BTreeMap::new();
        for &(dir, target) in dangling {
            by_dir.entry(dir).or_default().insert(target);
        }
        for (id, targets) in by_dir {
            let dir = self.vol.read_inode(id)?;
            let removed = dir::delete_where(self.vol, &dir, |entry| {
                targets.contains(&entry.inode_id)
            })?;
            warn!("dir {id}: unlinked {removed} dangling entries");
            self.report.unlinked += removed;
        }
        Ok(())
    }

    fn remark(&mut self, reached: &BTreeSet<InodeId>) -> Result<()> {
        let (map, dev) = (self.vol.inode_map(), self.vol.blk_dev());
        for &id in reached {
            let slot = id as usize - 1;
            if map.is_free(dev, slot)? {
                warn!("inode {id} is reachable but marked free");
                map.mark_used(dev, slot)?;
                self.report.remarked += 1;
            }
        }
        Ok(())
    }

    fn lost(&self, reached: &BTreeSet<InodeId>) -> Result<Vec<InodeId>> {
        let slots = self.vol.inode_map().load(self.vol.blk_dev())?;
        Ok(slots
            .iter()
            .enumerate()
            .filter(|&(_, &slot)| slot == SLOT_USED)
            .map(|(slot, _)| slot as InodeId + 1)
            .filter(|id| !reached.contains(id))
            .collect())
    }

    fn recover(&mut self, lost: &[InodeId]) -> Result<()> {
        let mut live = Vec::new();
        for &id in lost {
            match tolerate(self.vol.read_inode(id))? {
                Some(inode) if !inode.is_free() => live.push(inode),
                _ => self.release_slot(id)?,
            }
        }
        if live.is_empty() {
            return Ok(());
        }

        let Some(mut lost_found) = self.lost_found()? else {
            self.unresolved = true;
            return Ok(());
        };

        // a lost directory brings its lost children along
        let mut covered = BTreeSet::new();
        for inode in live.iter().filter(|inode| inode.is_dir()) {
            covered.extend(
                walk(self.vol, inode.id)?
                    .reached
                    .into_iter()
                    .filter(|&id| id != inode.id),
            );
        }
        let (tops, rest): (Vec<&DiskInode>, Vec<&DiskInode>) =
            live.iter().partition(|inode| !covered.contains(&inode.id));

        let mut placed = BTreeSet::new();
        for inode in tops.into_iter().chain(rest) {
            if placed.contains(&inode.id) {
                continue;
            }
            if let Err(err) = self.relink(&mut lost_found, inode) {
                if err.kind() == ErrorKind::HostIo {
                    return Err(err);
                }
                warn!("cannot relink inode {}: {err}", inode.id);
                self.unresolved = true;
                break;
            }
            placed.insert(inode.id);
            if inode.is_dir() {
                placed.extend(walk(self.vol, inode.id)?.reached);
            }
        }
        Ok(())
    }

    /// Existing `lost+found` or a new one; `None` when neither is possible.
    fn lost_found(&mut self) -> Result<Option<DiskInode>> {
        let vol = self.vol;
        let mut root = vol.read_inode(ROOT_ID)?;
        if let Some(id) = dir::find_by_name(vol, &root, LOST_FOUND)? {
            return match tolerate(vol.read_inode(id))? {
                Some(inode) if inode.is_dir() => Ok(Some(inode)),
                _ => {
                    warn!("`/{LOST_FOUND}` is not a directory");
                    Ok(None)
                }
            };
        }
        match dir::make_dir(vol, &mut root, &Name::new(LOST_FOUND)?) {
            Ok(id) => {
                info!("created `/{LOST_FOUND}` ({id})");
                Ok(Some(vol.read_inode(id)?))
            }
            Err(err) if err.kind() == ErrorKind::HostIo => Err(err),
            Err(err) => {
                warn!("cannot create `/{LOST_FOUND}`: {err}");
                Ok(None)
            }
        }
    }

    fn relink(&mut self, lost_found: &mut DiskInode, inode: &DiskInode) -> Result<()> {
        let vol = self.vol;
        let name = loop {
            let candidate = Name::new(&random_name())?;
            if dir::find_by_name(vol, lost_found, candidate.as_str())?.is_none() {
                break candidate;
            }
        };
        vol.ensure_free_blocks(dir::insert_cost(vol, lost_found)?)?;
        dir::insert(vol, lost_found, inode.id, &name)?;
        if inode.is_dir() && tolerate(dir::set_parent(vol, inode, lost_found.id))?.is_none() {
            self.unresolved = true;
        }
        warn!("relinked lost inode {} as /{LOST_FOUND}/{name}", inode.id);
        self.report.recovered.push((inode.id, name.as_str().to_owned()));
        Ok(())
    }

    /// Frees an inode bit that has no live inode behind it.
    fn release_slot(&mut self, id: InodeId) -> Result<()> {
        let mut inode = DiskInode::new(id, InodeKind::Free);
        self.vol.release_inode(&mut inode)?;
        warn!("inode {id} was marked used but is free, released");
        self.report.released += 1;
        Ok(())
    }

    /// Checks every link of every live inode, then returns data blocks that are
    /// marked used but belong to nobody.
    fn audit_blocks(&mut self) -> Result<()> {
        let vol = self.vol;
        let dev = vol.blk_dev();
        let inode_slots = vol.inode_map().load(dev)?;

        let mut referenced = BTreeSet::new();
        let mut complete = true;
        for (slot, _) in inode_slots
            .iter()
            .enumerate()
            .filter(|&(_, &slot)| slot == SLOT_USED)
        {
            let id = slot as InodeId + 1;
            let Some(inode) = tolerate(vol.read_inode(id))? else {
                complete = false;
                continue;
            };
            if inode.is_free() {
                continue;
            }
            let graph = link::index_blocks(vol, &inode).and_then(|mut links| {
                links.extend(link::leaves(vol, &inode)?);
                Ok(links)
            });
            let Some(links) = tolerate(graph)? else {
                warn!("inode {id}: link graph unreadable");
                self.report.damaged_links += 1;
                complete = false;
                continue;
            };
            for link in links {
                if !vol.link_in_range(link) || vol.data_map().is_free(dev, link as usize - 1)? {
                    warn!("inode {id}: link {link} is out of range or free");
                    self.report.damaged_links += 1;
                }
                referenced.insert(link);
            }
        }

        if !complete {
            warn!("link graphs incomplete, leaked blocks are kept");
            return Ok(());
        }
        let data_slots = vol.data_map().load(dev)?;
        for (index, _) in data_slots
            .iter()
            .enumerate()
            .filter(|&(_, &slot)| slot == SLOT_USED)
        {
            let link = index as Link + 1;
            if !referenced.contains(&link) {
                vol.free_block(link)?;
                self.report.leaked_blocks += 1;
            }
        }
        if self.report.leaked_blocks > 0 {
            warn!("released {} leaked block(s)", self.report.leaked_blocks);
        }
        Ok(())
    }
}
