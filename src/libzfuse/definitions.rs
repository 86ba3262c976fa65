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
use bincode::{de::Decoder, error::DecodeError, impl_borrow_decode, Decode};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

pub type ZfsObjId = u64;
pub type ZfsTxg = u64;
pub type ZfsGuid = u64;

/// All on-disk sizes and DVA offsets are in units of 512-byte sectors.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

/// A block pointer is 128 bytes.
pub const SPA_BLKPTRSHIFT: u32 = 7;
pub const BLKPTR_SIZE: usize = 1 << SPA_BLKPTRSHIFT;
pub const DVAS_PER_BP: usize = 3;

pub const DNODE_SIZE: usize = 512;
pub const DNODE_CORE_SIZE: usize = 64;
pub const DN_MAX_BONUSLEN: usize = DNODE_SIZE - DNODE_CORE_SIZE - BLKPTR_SIZE;
pub const DN_MIN_INDBLKSHIFT: u8 = 7;

pub const OBJSET_PHYS_SIZE: usize = 2048;

pub const UBERBLOCK_MAGIC: u64 = 0x00ba_b10c;
pub const UBERBLOCK_SHIFT: u32 = 10;

/// Magic of the zio_eck trailer at the end of the label's nvlist region.
pub const ZEC_MAGIC: u64 = 0x0210_da7a_b10c_7a11;

pub const VDEV_PAD_SIZE: usize = 8 << 10;
pub const VDEV_PHYS_OFFSET: usize = 2 * VDEV_PAD_SIZE;
pub const VDEV_PHYS_SIZE: usize = 112 << 10;
pub const VDEV_UBERBLOCK_OFFSET: usize = VDEV_PHYS_OFFSET + VDEV_PHYS_SIZE;
pub const VDEV_LABEL_SIZE: usize = 256 << 10;
pub const VDEV_LABELS: usize = 4;

/// Two labels plus the embedded boot region precede the allocatable space on
/// every leaf; DVA offsets are relative to the end of this area.
pub const VDEV_LABEL_START_SIZE: u64 = 4 << 20;

/// The persistent half of a znode, stored in the bonus buffer.  Bytes past it
/// hold inline data such as short symlink targets.
pub const ZNODE_SIZE: usize = 264;

pub const MASTER_NODE_OBJ: ZfsObjId = 1;
pub const ZFS_ROOT_OBJ: &str = "ROOT";

/// A ZAP directory entry carries the entry type in the top 4 bits and the
/// object number in the low 48.
pub const ZFS_DIRENT_OBJ_MASK: u64 = (1 << 48) - 1;

pub const MZAP_ENT_LEN: usize = 64;
pub const MZAP_NAME_LEN: usize = MZAP_ENT_LEN - 8 - 4 - 2;

pub const ZBT_LEAF: u64 = 1 << 63;
pub const ZBT_HEADER: u64 = (1 << 63) + 1;
pub const ZBT_MICRO: u64 = (1 << 63) + 3;

pub const ZAP_MAGIC: u64 = 0x2_F52A_B2AB;
pub const ZAP_LEAF_MAGIC: u32 = 0x2AB_1EAF;

/// Fat-ZAP block granularity.  The format documentation is outdated here;
/// 0x4000 is what pools in the wild use.
pub const ZAP_LEAF_BLOCK_SIZE: usize = 0x4000;
pub const ZAP_LEAF_CHUNKSIZE: usize = 24;
pub const ZAP_LEAF_ARRAY_BYTES: usize = ZAP_LEAF_CHUNKSIZE - 3;
pub const ZAP_CHAIN_END: u16 = 0xffff;

pub const ZAP_CHUNK_ARRAY: u8 = 251;
pub const ZAP_CHUNK_ENTRY: u8 = 252;
pub const ZAP_CHUNK_FREE: u8 = 253;

/// DMU object types, from the on-disk format.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
pub enum ObjectType {
    None = 0,
    ObjectDirectory,
    ObjectArray,
    PackedNvlist,
    PackedNvlistSize,
    Bplist,
    BplistHdr,
    SpaceMapHeader,
    SpaceMap = 8,
    IntentLog,
    Dnode,
    Objset,
    DslDir,
    DslDirChildMap,
    DslDsSnapMap,
    DslProps,
    DslDataset = 16,
    Znode,
    OldAcl,
    PlainFileContents,
    DirectoryContents,
    MasterNode,
    UnlinkedSet,
    Zvol,
    ZvolProp = 24,
    PlainOther,
    Uint64Other,
    ZapOther,
    ErrorLog,
    SpaHistory,
    SpaHistoryOffsets,
    PoolProps,
    DslPerms = 32,
    Acl,
    SysAcl,
    Fuid,
    FuidSize,
    NextClones,
    ScrubQueue,
    UsergroupUsed,
    UsergroupQuota = 40,
    Userrefs,
    DdtZap,
    DdtStats,
}

impl bincode::Decode for ObjectType {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, DecodeError> {
        let discriminant: u8 = Decode::decode(decoder)?;
        ObjectType::from_u8(discriminant).ok_or(DecodeError::Other("unknown DMU object type"))
    }
}
impl_borrow_decode!(ObjectType);

/// Object set flavors.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
pub enum ObjsetType {
    None = 0,
    Meta,
    Zfs,
    Zvol,
}

#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
pub enum ChecksumType {
    Inherit = 0,
    On,
    Off,
    Label,
    GangHeader,
    Zilog,
    Fletcher2,
    Fletcher4,
    Sha256,
    Zilog2,
    NoParity,
    Sha512,
    Skein,
    Edonr,
    Blake3,
}

#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
pub enum CompressionType {
    Inherit = 0,
    On,
    Off,
    Lzjb,
    Empty,
    Gzip1,
    Gzip2,
    Gzip3,
    Gzip4,
    Gzip5,
    Gzip6,
    Gzip7,
    Gzip8,
    Gzip9,
    Zle,
    Lz4,
    Zstd,
}
