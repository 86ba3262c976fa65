/*
 * BSD 2-Clause License
 *
 * Copyright (c) 2021, Khaled Emara
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 *    list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
 * DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
 * FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
 * SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
 * CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
 * OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */
use bincode::Decode;
use tracing::debug;

use super::{
    blkptr::BlockPtr,
    definitions::*,
    error::{Error, Result},
    nvlist::NvList,
    utils::decode,
};

/// Pool state root, one slot of the label's uberblock ring.
#[derive(Clone, Debug)]
pub struct Uberblock {
    pub version: u64,
    pub txg: ZfsTxg,
    pub guid_sum: u64,
    pub timestamp: u64,
    pub rootbp: BlockPtr,
}

#[derive(Debug, Decode)]
struct UberblockPhys {
    magic: u64,
    version: u64,
    txg: u64,
    guid_sum: u64,
    timestamp: u64,
    rootbp: BlockPtr,
}

impl Uberblock {
    /// The active uberblock is the one with the largest txg; ties go to the
    /// first slot encountered.
    pub fn supersedes(&self, incumbent: Option<&Uberblock>) -> bool {
        incumbent.map_or(true, |cur| self.txg > cur.txg)
    }
}

/// The name/value descriptor held in a 256 KiB vdev label.
#[derive(Debug)]
pub struct Label {
    pub pool_name: String,
    pub pool_guid: ZfsGuid,
    /// Guid of the leaf this label was read from.
    pub guid: ZfsGuid,
    /// Guid of the top-level vdev the leaf belongs to.
    pub top_guid: ZfsGuid,
    pub txg: ZfsTxg,
    pub version: u64,
    pub state: u64,
    config: NvList,
}

impl Label {
    pub fn parse(raw: &[u8]) -> Result<Label> {
        if raw.len() < VDEV_UBERBLOCK_OFFSET {
            return Err(Error::Format("short vdev label"));
        }

        let phys = &raw[VDEV_PHYS_OFFSET..VDEV_UBERBLOCK_OFFSET];
        let eck_offset = VDEV_PHYS_SIZE - 40;
        let eck_magic = u64::from_le_bytes(phys[eck_offset..eck_offset + 8].try_into().unwrap());
        if eck_magic != ZEC_MAGIC {
            return Err(Error::Format("bad label trailer magic"));
        }

        let config = NvList::unpack(&phys[..eck_offset])?;

        let required_u64 = |name| config.u64(name).ok_or(Error::Format("incomplete label"));

        Ok(Label {
            pool_name: config
                .string("name")
                .ok_or(Error::Format("label has no pool name"))?
                .to_owned(),
            pool_guid: required_u64("pool_guid")?,
            guid: required_u64("guid")?,
            top_guid: required_u64("top_guid")?,
            txg: required_u64("txg")?,
            version: required_u64("version")?,
            state: required_u64("state")?,
            config,
        })
    }

    /// The nvlist describing the top-level vdev subtree this leaf belongs to.
    pub fn vdev_tree(&self) -> Result<&NvList> {
        self.config
            .list("vdev_tree")
            .ok_or(Error::Format("label has no vdev_tree"))
    }

    pub fn ashift(&self) -> u64 {
        self.vdev_tree()
            .ok()
            .and_then(|tree| tree.u64("ashift"))
            .unwrap_or(SECTOR_SHIFT as u64)
    }
}

/// Scan the uberblock ring at the back of a raw label.  Slot size depends on
/// the top vdev's ashift.  A byte-swapped magic means the pool was written
/// big-endian, which this reader refuses.
pub fn best_uberblock(raw: &[u8], ashift: u64) -> Result<Option<Uberblock>> {
    if raw.len() < VDEV_UBERBLOCK_OFFSET {
        return Err(Error::Format("short vdev label"));
    }
    let ring = &raw[VDEV_UBERBLOCK_OFFSET..];

    let slot_size = 1usize << ashift.max(UBERBLOCK_SHIFT as u64);
    let mut best: Option<Uberblock> = None;

    for slot in ring.chunks_exact(slot_size) {
        let magic = u64::from_le_bytes(slot[..8].try_into().unwrap());
        if magic == UBERBLOCK_MAGIC.swap_bytes() {
            return Err(Error::Unsupported("big-endian pool"));
        }
        if magic != UBERBLOCK_MAGIC {
            continue;
        }

        let phys: UberblockPhys = match decode(slot) {
            Ok((phys, _)) => phys,
            Err(_) => {
                debug!("skipping undecodable uberblock slot");
                continue;
            }
        };

        let candidate = Uberblock {
            version: phys.version,
            txg: phys.txg,
            guid_sum: phys.guid_sum,
            timestamp: phys.timestamp,
            rootbp: phys.rootbp,
        };

        if candidate.supersedes(best.as_ref()) {
            best = Some(candidate);
        }
    }

    Ok(best)
}
