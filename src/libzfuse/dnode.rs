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
use bincode::{
    de::{read::Reader, Decoder},
    error::DecodeError,
    impl_borrow_decode, Decode,
};
use bitflags::bitflags;
use num_traits::FromPrimitive;

use super::{
    blkptr::BlockPtr,
    definitions::*,
    error::{Error, Result},
    utils::decode,
};

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DnodeFlags: u8 {
        const UsedBytes = 1 << 0;
        const UserusedAccounted = 1 << 1;
        const SpillBlkptr = 1 << 2;
        const _ = !0;
    }
}

/// The 512-byte on-disk record describing one object: indirect-tree geometry,
/// 1-3 inline block pointers, and a typed bonus buffer.
#[derive(Clone, Debug)]
pub struct DnodePhys {
    pub object_type: ObjectType,
    pub indblkshift: u8,
    pub nlevels: u8,
    pub nblkptr: u8,
    pub bonustype: ObjectType,
    pub checksum: u8,
    pub compress: u8,
    pub flags: DnodeFlags,
    pub datablkszsec: u16,
    pub bonuslen: u16,
    pub maxblkid: u64,
    pub used: u64,
    pub blkptr: Vec<BlockPtr>,
    pub bonus: Vec<u8>,
    /// Index of this dnode within its object set.  Not part of the on-disk
    /// record; stamped by `ObjectSet::read_dnode` so callers can refer back.
    pub object_id: ZfsObjId,
}

impl DnodePhys {
    pub fn is_allocated(&self) -> bool {
        self.object_type != ObjectType::None
    }

    /// Data block size in bytes.
    pub fn datablksize(&self) -> u64 {
        (self.datablkszsec as u64) << SECTOR_SHIFT
    }

    /// The znode held in the bonus buffer of files and directories.
    pub fn znode(&self) -> Result<ZnodePhys> {
        if self.bonustype != ObjectType::Znode {
            return Err(Error::Format("bonus buffer is not a znode"));
        }
        if self.flags.contains(DnodeFlags::SpillBlkptr) {
            return Err(Error::Unsupported("system-attribute spill block"));
        }
        let (znode, _) = decode(&self.bonus)?;
        Ok(znode)
    }

    /// Bonus bytes past the znode; short symlink targets live here.
    pub fn inline_payload(&self) -> &[u8] {
        if self.bonus.len() > ZNODE_SIZE {
            &self.bonus[ZNODE_SIZE..]
        } else {
            &[]
        }
    }

    pub fn dsl_dir(&self) -> Result<DslDirPhys> {
        if self.bonustype != ObjectType::DslDir {
            return Err(Error::Format("bonus buffer is not a DSL directory"));
        }
        let (dir, _) = decode(&self.bonus)?;
        Ok(dir)
    }

    pub fn dsl_dataset(&self) -> Result<DslDatasetPhys> {
        if self.bonustype != ObjectType::DslDataset {
            return Err(Error::Format("bonus buffer is not a DSL dataset"));
        }
        let (dataset, _) = decode(&self.bonus)?;
        Ok(dataset)
    }
}

impl bincode::Decode for DnodePhys {
    fn decode<D: Decoder>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        let object_type: ObjectType = Decode::decode(decoder)?;
        let indblkshift: u8 = Decode::decode(decoder)?;
        let nlevels: u8 = Decode::decode(decoder)?;
        let nblkptr: u8 = Decode::decode(decoder)?;
        let bonustype: ObjectType = Decode::decode(decoder)?;
        let checksum: u8 = Decode::decode(decoder)?;
        let compress: u8 = Decode::decode(decoder)?;
        let flags: u8 = Decode::decode(decoder)?;
        let datablkszsec: u16 = Decode::decode(decoder)?;
        let bonuslen: u16 = Decode::decode(decoder)?;
        let _pad2: [u8; 4] = Decode::decode(decoder)?;
        let maxblkid: u64 = Decode::decode(decoder)?;
        let used: u64 = Decode::decode(decoder)?;
        let _pad3: [u64; 4] = Decode::decode(decoder)?;

        let mut remaining = DNODE_SIZE - DNODE_CORE_SIZE;
        let mut blkptr = Vec::new();

        if object_type != ObjectType::None {
            if !(1..=3).contains(&nblkptr) {
                return Err(DecodeError::Other("dnode block pointer count out of range"));
            }
            for _ in 0..nblkptr {
                blkptr.push(BlockPtr::decode(decoder)?);
                remaining -= BLKPTR_SIZE;
            }
            if bonuslen as usize > remaining {
                return Err(DecodeError::Other("dnode bonus length out of range"));
            }
        }

        let mut bonus = vec![0u8; if object_type == ObjectType::None { 0 } else { bonuslen.into() }];
        decoder.reader().read(&mut bonus)?;
        decoder.reader().consume(remaining - bonus.len());

        Ok(DnodePhys {
            object_type,
            indblkshift,
            nlevels,
            nblkptr,
            bonustype,
            checksum,
            compress,
            flags: DnodeFlags::from_bits_retain(flags),
            datablkszsec,
            bonuslen,
            maxblkid,
            used,
            blkptr,
            bonus,
            object_id: 0,
        })
    }
}
impl_borrow_decode!(DnodePhys);

/// The persistent half of a znode, stored in the bonus buffer of file and
/// directory dnodes.  Times are {seconds, nanoseconds} since the epoch.
#[derive(Clone, Debug, Decode)]
pub struct ZnodePhys {
    pub atime: [u64; 2],
    pub mtime: [u64; 2],
    pub ctime: [u64; 2],
    pub crtime: [u64; 2],
    pub gen: u64,
    pub mode: u64,
    pub size: u64,
    pub parent: u64,
    pub links: u64,
    pub xattr: u64,
    pub rdev: u64,
    pub flags: u64,
    pub uid: u64,
    pub gid: u64,
    pub zap: u64,
    _pad: [u64; 3],
    _acl: [u8; 88],
}

#[derive(Clone, Debug, Decode)]
pub struct DslDirPhys {
    pub creation_time: u64,
    pub head_dataset_obj: ZfsObjId,
    pub parent_obj: ZfsObjId,
    pub origin_obj: ZfsObjId,
    pub child_dir_zapobj: ZfsObjId,
    pub used_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub quota: u64,
    pub reserved: u64,
    pub props_zapobj: ZfsObjId,
    pub deleg_zapobj: ZfsObjId,
    pub flags: u64,
    pub used_breakdown: [u64; 5],
    _pad: [u64; 14],
}

#[derive(Clone, Debug, Decode)]
pub struct DslDatasetPhys {
    pub dir_obj: ZfsObjId,
    pub prev_snap_obj: ZfsObjId,
    pub prev_snap_txg: u64,
    pub next_snap_obj: ZfsObjId,
    pub snapnames_zapobj: ZfsObjId,
    pub num_children: u64,
    pub creation_time: u64,
    pub creation_txg: u64,
    pub deadlist_obj: ZfsObjId,
    pub used_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub unique_bytes: u64,
    pub fsid_guid: u64,
    pub guid: u64,
    pub flags: u64,
    pub bp: BlockPtr,
    pub next_clones_obj: ZfsObjId,
    pub props_obj: ZfsObjId,
    pub userrefs_obj: ZfsObjId,
    _pad: [u64; 5],
}

/// Header of an object set: the meta-dnode whose data blocks are the dnode
/// array, plus the set's type.
#[derive(Clone, Debug)]
pub struct ObjsetPhys {
    pub meta_dnode: DnodePhys,
    pub os_type: ObjsetType,
    pub flags: u64,
}

impl bincode::Decode for ObjsetPhys {
    fn decode<D: Decoder>(decoder: &mut D) -> std::result::Result<Self, DecodeError> {
        let meta_dnode = DnodePhys::decode(decoder)?;
        decoder.reader().consume(192); // zil header
        let os_type: u64 = Decode::decode(decoder)?;
        let flags: u64 = Decode::decode(decoder)?;

        Ok(ObjsetPhys {
            meta_dnode,
            os_type: ObjsetType::from_u64(os_type)
                .ok_or(DecodeError::Other("unknown object set type"))?,
            flags,
        })
    }
}
impl_borrow_decode!(ObjsetPhys);

#[cfg(test)]
pub(super) mod t {
    use super::super::blkptr::t::encode_bp;
    use super::*;

    pub struct DnodeLayout<'a> {
        pub object_type: ObjectType,
        pub indblkshift: u8,
        pub nlevels: u8,
        pub bonustype: ObjectType,
        pub datablkszsec: u16,
        pub maxblkid: u64,
        pub blkptrs: &'a [Vec<u8>],
        pub bonus: &'a [u8],
    }

    pub fn encode_dnode(layout: &DnodeLayout) -> Vec<u8> {
        let mut out = Vec::with_capacity(DNODE_SIZE);
        out.push(layout.object_type as u8);
        out.push(layout.indblkshift);
        out.push(layout.nlevels);
        out.push(layout.blkptrs.len() as u8);
        out.push(layout.bonustype as u8);
        out.push(0); // checksum
        out.push(0); // compress
        out.push(0); // flags
        out.extend_from_slice(&layout.datablkszsec.to_le_bytes());
        out.extend_from_slice(&(layout.bonus.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&layout.maxblkid.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // used
        out.extend_from_slice(&[0u8; 32]);
        for bp in layout.blkptrs {
            out.extend_from_slice(bp);
        }
        out.extend_from_slice(layout.bonus);
        out.resize(DNODE_SIZE, 0);
        out
    }

    pub fn encode_znode(size: u64, mode: u64, inline: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ZNODE_SIZE + inline.len());
        for times in 0..4 {
            out.extend_from_slice(&(1_600_000_000u64 + times).to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
        }
        out.extend_from_slice(&9u64.to_le_bytes()); // gen
        out.extend_from_slice(&mode.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes()); // parent
        out.extend_from_slice(&1u64.to_le_bytes()); // links
        for _ in 0..4 {
            out.extend_from_slice(&0u64.to_le_bytes()); // xattr, rdev, flags, uid
        }
        out.extend_from_slice(&0u64.to_le_bytes()); // gid
        out.extend_from_slice(&0u64.to_le_bytes()); // zap
        out.resize(ZNODE_SIZE, 0);
        out.extend_from_slice(inline);
        out
    }

    pub fn hole_bp() -> Vec<u8> {
        vec![0u8; BLKPTR_SIZE]
    }

    #[test]
    fn decode_file_dnode() {
        let bp = encode_bp(
            &[(0, 0x200, 1, false)],
            0,
            0,
            CompressionType::Off,
            ChecksumType::Fletcher2,
            ObjectType::PlainFileContents,
            0,
            10,
            [0; 4],
        );
        let bonus = encode_znode(123, 0o100644, b"");
        let raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::PlainFileContents,
            indblkshift: 14,
            nlevels: 1,
            bonustype: ObjectType::Znode,
            datablkszsec: 1,
            maxblkid: 0,
            blkptrs: &[bp],
            bonus: &bonus,
        });
        assert_eq!(DNODE_SIZE, raw.len());

        let (dn, consumed): (DnodePhys, usize) = decode(&raw).unwrap();
        assert_eq!(DNODE_SIZE, consumed);
        assert_eq!(ObjectType::PlainFileContents, dn.object_type);
        assert_eq!(1, dn.blkptr.len());
        assert_eq!(512, dn.datablksize());
        assert!(dn.is_allocated());

        let znode = dn.znode().unwrap();
        assert_eq!(123, znode.size);
        assert_eq!(0o100644, znode.mode);
        assert_eq!(1_600_000_000, znode.atime[0]);
    }

    #[test]
    fn decode_unallocated_slot() {
        let raw = [0u8; DNODE_SIZE];
        let (dn, consumed): (DnodePhys, usize) = decode(&raw).unwrap();
        assert_eq!(DNODE_SIZE, consumed);
        assert!(!dn.is_allocated());
        assert!(dn.blkptr.is_empty());
    }

    #[test]
    fn inline_payload_past_znode() {
        let bonus = encode_znode(4, 0o120777, b"/tmp");
        let raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::PlainFileContents,
            indblkshift: 14,
            nlevels: 1,
            bonustype: ObjectType::Znode,
            datablkszsec: 1,
            maxblkid: 0,
            blkptrs: &[hole_bp()],
            bonus: &bonus,
        });
        let (dn, _): (DnodePhys, usize) = decode(&raw).unwrap();
        assert_eq!(b"/tmp", dn.inline_payload());
    }

    #[test]
    fn wrong_bonus_type_is_rejected() {
        let raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::DslDir,
            indblkshift: 14,
            nlevels: 1,
            bonustype: ObjectType::DslDir,
            datablkszsec: 1,
            maxblkid: 0,
            blkptrs: &[hole_bp()],
            bonus: &[0u8; 256],
        });
        let (dn, _): (DnodePhys, usize) = decode(&raw).unwrap();
        assert!(dn.znode().is_err());
        assert!(dn.dsl_dir().is_ok());
    }

    #[test]
    fn bad_nblkptr_is_rejected() {
        let mut raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::PlainFileContents,
            indblkshift: 14,
            nlevels: 1,
            bonustype: ObjectType::Znode,
            datablkszsec: 1,
            maxblkid: 0,
            blkptrs: &[hole_bp()],
            bonus: &[],
        });
        raw[3] = 4; // nblkptr
        assert!(decode::<DnodePhys>(&raw).is_err());
    }

    #[test]
    fn decode_objset_phys() {
        let meta = encode_dnode(&DnodeLayout {
            object_type: ObjectType::Dnode,
            indblkshift: 14,
            nlevels: 1,
            bonustype: ObjectType::None,
            datablkszsec: 32, // 16 KiB dnode blocks
            maxblkid: 0,
            blkptrs: &[hole_bp()],
            bonus: &[],
        });

        let mut raw = Vec::new();
        raw.extend_from_slice(&meta);
        raw.extend_from_slice(&[0u8; 192]);
        raw.extend_from_slice(&(ObjsetType::Zfs as u64).to_le_bytes());
        raw.extend_from_slice(&0u64.to_le_bytes());
        raw.resize(OBJSET_PHYS_SIZE, 0);

        let (os, _): (ObjsetPhys, usize) = decode(&raw).unwrap();
        assert_eq!(ObjsetType::Zfs, os.os_type);
        assert_eq!(ObjectType::Dnode, os.meta_dnode.object_type);
    }
}
