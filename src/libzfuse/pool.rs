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
use std::{path::Path, sync::Arc};

use tracing::{debug, error, warn};

use super::{
    blkptr::BlockPtr,
    checksum,
    compress,
    definitions::ZfsGuid,
    device::LeafDevice,
    error::{Error, Result},
    label::{best_uberblock, Label, Uberblock},
    vdev::TopVdev,
};

/// An imported pool: every member device bound into its top-level vdev, plus
/// the active uberblock.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub guid: ZfsGuid,
    vdevs: Vec<TopVdev>,
    active: Uberblock,
}

impl Pool {
    /// Open a set of candidate pool members.  Members naming a different
    /// pool are skipped with a warning; missing members are tolerated up to
    /// each top vdev's redundancy.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Pool> {
        let mut identity: Option<(String, ZfsGuid)> = None;
        let mut vdevs: Vec<TopVdev> = Vec::new();
        let mut leaves: Vec<(ZfsGuid, Arc<LeafDevice>)> = Vec::new();
        let mut active: Option<Uberblock> = None;

        for path in paths {
            let path = path.as_ref();
            let dev = LeafDevice::open(path, 0)?;

            let (label, raw) = Self::read_label(&dev)?;

            match &identity {
                None => identity = Some((label.pool_name.clone(), label.pool_guid)),
                Some((name, guid)) => {
                    if *name != label.pool_name || *guid != label.pool_guid {
                        warn!(
                            "{} belongs to pool {:?}, not {:?}; skipping it",
                            path.display(),
                            label.pool_name,
                            name
                        );
                        continue;
                    }
                }
            }

            if let Some(ub) = best_uberblock(&raw, label.ashift())? {
                if ub.supersedes(active.as_ref()) {
                    active = Some(ub);
                }
            }

            if !vdevs.iter().any(|top| top.guid == label.top_guid) {
                vdevs.push(TopVdev::from_nvlist(label.vdev_tree()?)?);
            }

            leaves.push((label.guid, Arc::new(dev)));
        }

        let (name, guid) = identity.ok_or(Error::Format("no usable pool member"))?;

        for (leaf_guid, dev) in &leaves {
            if !vdevs.iter_mut().any(|top| top.vdev.bind(*leaf_guid, dev)) {
                warn!("leaf {leaf_guid:#x} belongs to no known top-level vdev");
            }
        }

        for top in &vdevs {
            let missing = top.vdev.missing();
            if missing > 0 {
                if top.tolerates(missing) {
                    warn!("vdev {} has {} missing disk(s)", top.id, missing);
                } else {
                    error!("vdev {} has too many ({}) missing disk(s)", top.id, missing);
                    return Err(Error::MissingDevice);
                }
            }
        }

        let active = active.ok_or(Error::Format("pool has no valid uberblock"))?;
        debug!(
            "imported pool {:?} at txg {} with {} top-level vdev(s)",
            name,
            active.txg,
            vdevs.len()
        );

        Ok(Pool {
            name,
            guid,
            vdevs,
            active,
        })
    }

    /// Any of the four label copies will do; the first one that parses wins.
    fn read_label(dev: &LeafDevice) -> Result<(Label, Vec<u8>)> {
        let mut last = Error::Format("no parseable vdev label");
        for index in 0..dev.label_count() {
            match dev.read_label(index).and_then(|raw| {
                let label = Label::parse(&raw)?;
                Ok((label, raw))
            }) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    pub fn active(&self) -> &Uberblock {
        &self.active
    }

    pub fn vdevs(&self) -> &[TopVdev] {
        &self.vdevs
    }

    /// Resolve a block pointer to its verified, decompressed contents.  Each
    /// DVA is tried in turn; integrity failures are logged and the next copy
    /// is used.
    pub fn read_bp(&self, bp: &BlockPtr) -> Result<Vec<u8>> {
        if bp.is_hole() {
            return Err(Error::Format("dereference of a hole block pointer"));
        }
        if bp.embedded {
            return Err(Error::Unsupported("embedded block pointer"));
        }
        if !bp.little_endian {
            return Err(Error::Unsupported("big-endian block"));
        }

        let psize = bp.psize();
        let lsize = bp.lsize();
        let mut last = Error::Format("block pointer has no DVAs");

        for dva in bp.dvas.iter().filter(|dva| !dva.is_null()) {
            if dva.gang {
                warn!("gang block at vdev={} offset={:#x}", dva.vdev, dva.offset());
                last = Error::Unsupported("gang block");
                continue;
            }

            let Some(top) = self.vdevs.iter().find(|top| top.id == dva.vdev) else {
                last = Error::Format("DVA names an unknown vdev");
                continue;
            };

            let data = match top.vdev.read(psize, dva.offset()) {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        "cannot read vdev={} offset={:#x}: {}",
                        dva.vdev,
                        dva.offset(),
                        e
                    );
                    last = e;
                    continue;
                }
            };

            match checksum::verify(&data, bp.cksum_type, &bp.cksum) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "checksum mismatch (vdev={} offset={:#x})",
                        dva.vdev,
                        dva.offset()
                    );
                    last = Error::Checksum {
                        vdev: dva.vdev,
                        offset: dva.offset(),
                    };
                    continue;
                }
                Err(e) => {
                    last = e;
                    continue;
                }
            }

            match compress::decompress(&data, lsize, bp.comp) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    last = e;
                    continue;
                }
            }
        }

        Err(last)
    }
}

#[cfg(test)]
pub(super) mod t {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::super::blkptr::t::encode_bp;
    use super::super::definitions::*;
    use super::super::label::t::{encode_label, pool_config};
    use super::super::utils::decode;
    use super::*;

    /// Grows a single-disk pool image in memory: a valid label up front and
    /// data blocks in the allocatable area behind the 4 MiB skip.
    pub struct ImageBuilder {
        data: Vec<u8>,
        next_sector: u64,
    }

    impl ImageBuilder {
        pub fn new() -> ImageBuilder {
            let label = encode_label(pool_config(0x1111, 0x2222, 0x2222, 7), &[7]);
            let mut data = vec![0u8; 16 << 20];
            data[..label.len()].copy_from_slice(&label);
            ImageBuilder {
                data,
                next_sector: 16,
            }
        }

        /// Store `payload` uncompressed at the next free spot and return the
        /// on-disk encoding of a block pointer to it.
        pub fn write_block(&mut self, payload: &[u8], object_type: ObjectType, level: u8) -> Vec<u8> {
            let sectors = payload.len().div_ceil(SECTOR_SIZE as usize).max(1);
            let mut padded = payload.to_vec();
            padded.resize(sectors << SECTOR_SHIFT, 0);

            let offset_sectors = self.next_sector;
            self.next_sector += sectors as u64;

            let start = VDEV_LABEL_START_SIZE as usize + ((offset_sectors as usize) << SECTOR_SHIFT);
            self.data[start..start + padded.len()].copy_from_slice(&padded);

            encode_bp(
                &[(0, offset_sectors, sectors as u32, false)],
                (sectors - 1) as u16,
                (sectors - 1) as u16,
                CompressionType::Off,
                ChecksumType::Fletcher4,
                object_type,
                level,
                7,
                super::super::checksum::fletcher4(&padded),
            )
        }

        /// Like `write_block`, but returns the decoded pointer.
        pub fn write_block_bp(
            &mut self,
            payload: &[u8],
            object_type: ObjectType,
            level: u8,
        ) -> BlockPtr {
            let raw = self.write_block(payload, object_type, level);
            decode::<BlockPtr>(&raw).unwrap().0
        }

        /// Point the active uberblock at a real object set.
        pub fn set_root_bp(&mut self, bp: &[u8]) {
            let offset = VDEV_UBERBLOCK_OFFSET + 40;
            self.data[offset..offset + BLKPTR_SIZE].copy_from_slice(bp);
        }

        pub fn corrupt(&mut self, bp: &BlockPtr) {
            let start =
                VDEV_LABEL_START_SIZE as usize + ((bp.dvas[0].offset_sectors as usize) << SECTOR_SHIFT);
            self.data[start] ^= 0xff;
        }

        pub fn finish(self) -> (Pool, NamedTempFile) {
            let mut f = NamedTempFile::new().unwrap();
            f.write_all(&self.data).unwrap();
            let pool = Pool::open(&[f.path()]).unwrap();
            (pool, f)
        }
    }

    #[test]
    fn open_single_disk_pool() {
        let (pool, _img) = ImageBuilder::new().finish();
        assert_eq!("tank", pool.name);
        assert_eq!(0x1111, pool.guid);
        assert_eq!(7, pool.active().txg);
        assert_eq!(1, pool.vdevs().len());
    }

    #[test]
    fn read_bp_round_trip() {
        let mut img = ImageBuilder::new();
        let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let bp = img.write_block_bp(&payload, ObjectType::PlainFileContents, 0);
        let (pool, _img) = img.finish();

        assert_eq!(payload, pool.read_bp(&bp).unwrap());
    }

    #[test]
    fn checksum_mismatch_fails_without_second_dva() {
        let mut img = ImageBuilder::new();
        let bp = img.write_block_bp(b"some data", ObjectType::PlainFileContents, 0);
        img.corrupt(&bp);
        let (pool, _img) = img.finish();

        assert!(matches!(
            pool.read_bp(&bp),
            Err(Error::Checksum { vdev: 0, .. })
        ));
    }

    #[test]
    fn second_dva_recovers_from_corruption() {
        let mut img = ImageBuilder::new();
        let payload = b"replicated block".repeat(8);
        let bad = img.write_block_bp(&payload, ObjectType::PlainFileContents, 0);
        let good = img.write_block_bp(&payload, ObjectType::PlainFileContents, 0);
        img.corrupt(&bad);

        let mut bp = bad;
        bp.dvas[1] = good.dvas[0];
        let (pool, _img) = img.finish();

        assert_eq!(payload, pool.read_bp(&bp).unwrap());
    }

    #[test]
    fn gang_dva_is_unsupported() {
        let mut img = ImageBuilder::new();
        let mut bp = img.write_block_bp(b"x", ObjectType::PlainFileContents, 0);
        bp.dvas[0].gang = true;
        let (pool, _img) = img.finish();

        assert!(matches!(pool.read_bp(&bp), Err(Error::Unsupported(_))));
    }

    #[test]
    fn hole_cannot_be_dereferenced() {
        let (pool, _img) = ImageBuilder::new().finish();
        assert!(pool.read_bp(&BlockPtr::hole()).is_err());
    }

    #[test]
    fn foreign_member_is_skipped() {
        let foreign = encode_label(pool_config(0x9999, 0x8888, 0x8888, 3), &[3]);
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&foreign).unwrap();
        f.as_file().set_len(16 << 20).unwrap();

        let img = ImageBuilder::new();
        let mut native = NamedTempFile::new().unwrap();
        native.write_all(&img.data).unwrap();

        let pool = Pool::open(&[native.path(), f.path()]).unwrap();
        assert_eq!(0x1111, pool.guid);
        assert_eq!(1, pool.vdevs().len());
    }
}
