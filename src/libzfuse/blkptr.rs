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
use num_traits::FromPrimitive;

use super::definitions::*;

/// Data virtual address: one replica location of a block.
#[derive(Clone, Copy, Debug, Default)]
pub struct Dva {
    pub vdev: u64,
    pub asize_sectors: u32,
    pub offset_sectors: u64,
    pub gang: bool,
}

impl Dva {
    /// An all-zero DVA marks an absent replica.
    pub fn is_null(&self) -> bool {
        self.vdev == 0 && self.asize_sectors == 0 && self.offset_sectors == 0 && !self.gang
    }

    /// Byte offset within the owning top-level vdev.
    pub fn offset(&self) -> u64 {
        self.offset_sectors << SECTOR_SHIFT
    }
}

impl bincode::Decode for Dva {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, DecodeError> {
        let word0: u64 = Decode::decode(decoder)?;
        let word1: u64 = Decode::decode(decoder)?;
        Ok(Dva {
            vdev: word0 >> 32,
            asize_sectors: (word0 & 0x00ff_ffff) as u32,
            offset_sectors: word1 & ((1 << 63) - 1),
            gang: word1 >> 63 != 0,
        })
    }
}
impl_borrow_decode!(Dva);

/// The 128-byte block pointer.
#[derive(Clone, Copy, Debug)]
pub struct BlockPtr {
    pub dvas: [Dva; DVAS_PER_BP],
    lsize_sectors: u16,
    psize_sectors: u16,
    pub comp: CompressionType,
    pub cksum_type: ChecksumType,
    pub object_type: ObjectType,
    pub level: u8,
    /// Bit 39 of the property word; set on embedded block pointers, which
    /// this reader does not interpret.
    pub embedded: bool,
    /// Byteorder bit; clear means the block was written big-endian.
    pub little_endian: bool,
    pub birth: ZfsTxg,
    pub fill: u64,
    pub cksum: [u64; 4],
}

impl BlockPtr {
    /// A hole: no data, reads as zeros.
    pub fn hole() -> BlockPtr {
        BlockPtr {
            dvas: [Dva::default(); DVAS_PER_BP],
            lsize_sectors: 0,
            psize_sectors: 0,
            comp: CompressionType::Inherit,
            cksum_type: ChecksumType::Inherit,
            object_type: ObjectType::None,
            level: 0,
            embedded: false,
            little_endian: false,
            birth: 0,
            fill: 0,
            cksum: [0; 4],
        }
    }

    pub fn is_hole(&self) -> bool {
        self.object_type == ObjectType::None
    }

    /// Logical (decompressed) size in bytes.
    pub fn lsize(&self) -> usize {
        (self.lsize_sectors as usize + 1) << SECTOR_SHIFT
    }

    /// Physical (on-disk) size in bytes.
    pub fn psize(&self) -> usize {
        (self.psize_sectors as usize + 1) << SECTOR_SHIFT
    }
}

impl bincode::Decode for BlockPtr {
    fn decode<D: Decoder>(decoder: &mut D) -> Result<Self, DecodeError> {
        let dvas: [Dva; DVAS_PER_BP] = Decode::decode(decoder)?;
        let prop: u64 = Decode::decode(decoder)?;
        let _pad: [u64; 2] = Decode::decode(decoder)?;
        let _phys_birth: u64 = Decode::decode(decoder)?;
        let birth: u64 = Decode::decode(decoder)?;
        let fill: u64 = Decode::decode(decoder)?;
        let cksum: [u64; 4] = Decode::decode(decoder)?;

        let object_type = ObjectType::from_u64((prop >> 48) & 0xff)
            .ok_or(DecodeError::Other("unknown object type in block pointer"))?;
        let cksum_type = ChecksumType::from_u64((prop >> 40) & 0xff)
            .ok_or(DecodeError::Other("unknown checksum type in block pointer"))?;
        let comp = CompressionType::from_u64((prop >> 32) & 0x7f)
            .ok_or(DecodeError::Other("unknown compression type in block pointer"))?;

        Ok(BlockPtr {
            dvas,
            lsize_sectors: (prop & 0xffff) as u16,
            psize_sectors: ((prop >> 16) & 0xffff) as u16,
            comp,
            cksum_type,
            object_type,
            level: ((prop >> 56) & 0x1f) as u8,
            embedded: (prop >> 39) & 1 != 0,
            little_endian: prop >> 63 != 0,
            birth,
            fill,
            cksum,
        })
    }
}
impl_borrow_decode!(BlockPtr);
