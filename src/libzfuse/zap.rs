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
use std::collections::BTreeMap;

use tracing::debug;

use super::{
    block_reader::BlockReader,
    definitions::*,
    dnode::DnodePhys,
    error::{Error, Result},
    pool::Pool,
};

const LEAF_HEADER_SIZE: usize = 48;

/// A fully decoded name → byte-vector dictionary.  Both encodings collapse
/// into the same map; micro-ZAP values are stored in the fat-ZAP's
/// big-endian representation so lookups are uniform.
#[derive(Debug, Default)]
pub struct ZapObject {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ZapObject {
    /// Read the whole object through a block reader and decode it.
    pub fn from_dnode(pool: &Pool, dnode: &DnodePhys) -> Result<ZapObject> {
        let mut reader = BlockReader::new(dnode)?;
        let buff = reader.read_all(pool)?;
        Self::parse(&buff)
    }

    pub fn parse(buff: &[u8]) -> Result<ZapObject> {
        if buff.len() < 8 {
            return Err(Error::Format("zap object too small"));
        }

        match u64::from_le_bytes(buff[..8].try_into().unwrap()) {
            ZBT_MICRO => Self::parse_micro(buff),
            ZBT_HEADER => Self::parse_fat(buff),
            _ => Err(Error::Format("not a zap object")),
        }
    }

    /// Fixed 64-byte slots after a one-slot header; slots with empty names
    /// are unused.
    fn parse_micro(buff: &[u8]) -> Result<ZapObject> {
        let mut entries = BTreeMap::new();

        for slot in buff.chunks_exact(MZAP_ENT_LEN).skip(1) {
            let name_bytes = &slot[14..14 + MZAP_NAME_LEN];
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MZAP_NAME_LEN);
            if name_len == 0 {
                continue;
            }

            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();
            let value = u64::from_le_bytes(slot[..8].try_into().unwrap());
            entries.insert(name, value.to_be_bytes().to_vec());
        }

        Ok(ZapObject { entries })
    }

    /// Header block followed by leaf blocks at 0x4000 granularity.  Pointer
    /// table blocks may be interleaved; anything that is not a leaf is
    /// skipped.
    fn parse_fat(buff: &[u8]) -> Result<ZapObject> {
        if buff.len() < 2 * ZAP_LEAF_BLOCK_SIZE {
            return Err(Error::Format("fat zap smaller than header plus one leaf"));
        }
        if buff.len() % ZAP_LEAF_BLOCK_SIZE != 0 {
            return Err(Error::Format("fat zap size is not block aligned"));
        }

        let mut entries = BTreeMap::new();

        for leaf in buff.chunks_exact(ZAP_LEAF_BLOCK_SIZE).skip(1) {
            let block_type = u64::from_le_bytes(leaf[..8].try_into().unwrap());
            if block_type != ZBT_LEAF {
                continue;
            }
            let magic = u32::from_le_bytes(leaf[24..28].try_into().unwrap());
            if magic != ZAP_LEAF_MAGIC {
                debug!("skipping zap leaf with bad magic {magic:#x}");
                continue;
            }

            Self::parse_leaf(leaf, &mut entries)?;
        }

        Ok(ZapObject { entries })
    }

    fn leaf_chunk(leaf: &[u8], index: u16) -> Option<&[u8]> {
        let hash_entries = ZAP_LEAF_BLOCK_SIZE / 32;
        let chunks_start = LEAF_HEADER_SIZE + 2 * hash_entries;
        let nchunks = (ZAP_LEAF_BLOCK_SIZE - chunks_start) / ZAP_LEAF_CHUNKSIZE;

        if index as usize >= nchunks {
            return None;
        }
        let start = chunks_start + index as usize * ZAP_LEAF_CHUNKSIZE;
        Some(&leaf[start..start + ZAP_LEAF_CHUNKSIZE])
    }

    fn parse_leaf(leaf: &[u8], entries: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        let hash_entries = ZAP_LEAF_BLOCK_SIZE / 32;
        let chunks_start = LEAF_HEADER_SIZE + 2 * hash_entries;
        let nchunks = (ZAP_LEAF_BLOCK_SIZE - chunks_start) / ZAP_LEAF_CHUNKSIZE;

        for index in 0..nchunks as u16 {
            let chunk = Self::leaf_chunk(leaf, index).unwrap();
            if chunk[0] != ZAP_CHUNK_ENTRY {
                continue;
            }

            let value_intlen = chunk[1] as usize;
            let name_chunk = u16::from_le_bytes(chunk[4..6].try_into().unwrap());
            let name_numints = u16::from_le_bytes(chunk[6..8].try_into().unwrap()) as usize;
            let value_chunk = u16::from_le_bytes(chunk[8..10].try_into().unwrap());
            let value_numints = u16::from_le_bytes(chunk[10..12].try_into().unwrap()) as usize;

            let name = match Self::parse_array(leaf, name_chunk, name_numints) {
                Ok(name) if name.len() > 1 => name,
                Ok(_) => continue,
                Err(e) => {
                    debug!("skipping zap entry with bad name chain: {e}");
                    continue;
                }
            };

            let value = match Self::parse_array(leaf, value_chunk, value_numints * value_intlen) {
                Ok(value) => value,
                Err(e) => {
                    debug!("skipping zap entry with bad value chain: {e}");
                    continue;
                }
            };

            // The encoded name length includes its NUL terminator.
            let name = String::from_utf8_lossy(&name[..name.len() - 1]).into_owned();
            entries.insert(name, value);
        }

        Ok(())
    }

    /// Collect `size` bytes from a chain of array chunks.  Running out of
    /// chain before the buffer is full is corrupt input.
    fn parse_array(leaf: &[u8], mut index: u16, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);

        while index != ZAP_CHAIN_END && out.len() < size {
            let chunk =
                Self::leaf_chunk(leaf, index).ok_or(Error::Format("zap chunk index out of range"))?;
            if chunk[0] != ZAP_CHUNK_ARRAY {
                return Err(Error::Format("zap chain enters a non-array chunk"));
            }

            let n = (size - out.len()).min(ZAP_LEAF_ARRAY_BYTES);
            out.extend_from_slice(&chunk[1..1 + n]);
            index = u16::from_le_bytes(chunk[22..24].try_into().unwrap());
        }

        if out.len() < size {
            return Err(Error::Format("unterminated zap array chain"));
        }

        Ok(out)
    }

    /// Look up an 8-byte value, interpreted big-endian.
    pub fn lookup_u64(&self, name: &str) -> Option<u64> {
        let value = self.entries.get(name)?;
        if value.len() != 8 {
            return None;
        }
        Some(u64::from_be_bytes(value[..].try_into().unwrap()))
    }

    /// Look up a string value, trailing NUL bytes trimmed.
    pub fn lookup_string(&self, name: &str) -> Option<String> {
        let value = self.entries.get(name)?;
        let end = value
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1);
        Some(String::from_utf8_lossy(&value[..end]).into_owned())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
pub(super) mod t {
    use super::*;

    /// A micro-ZAP image: header slot plus one slot per entry.
    pub fn encode_micro_zap(entries: &[(&str, u64)]) -> Vec<u8> {
        let mut out = vec![0u8; MZAP_ENT_LEN];
        out[..8].copy_from_slice(&ZBT_MICRO.to_le_bytes());

        for (name, value) in entries {
            let mut slot = vec![0u8; MZAP_ENT_LEN];
            slot[..8].copy_from_slice(&value.to_le_bytes());
            slot[14..14 + name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&slot);
        }
        out
    }

    pub struct LeafBuilder {
        leaf: Vec<u8>,
        next_chunk: u16,
    }

    impl LeafBuilder {
        fn new() -> LeafBuilder {
            let mut leaf = vec![0u8; ZAP_LEAF_BLOCK_SIZE];
            leaf[..8].copy_from_slice(&ZBT_LEAF.to_le_bytes());
            leaf[24..28].copy_from_slice(&ZAP_LEAF_MAGIC.to_le_bytes());
            LeafBuilder {
                leaf,
                next_chunk: 0,
            }
        }

        fn chunk_offset(index: u16) -> usize {
            LEAF_HEADER_SIZE + 2 * (ZAP_LEAF_BLOCK_SIZE / 32) + index as usize * ZAP_LEAF_CHUNKSIZE
        }

        fn put_array(&mut self, data: &[u8]) -> u16 {
            let first = self.next_chunk;
            let nchunks = data.len().div_ceil(ZAP_LEAF_ARRAY_BYTES).max(1);
            for (i, part) in data.chunks(ZAP_LEAF_ARRAY_BYTES).enumerate() {
                let index = self.next_chunk;
                let offset = Self::chunk_offset(index);
                self.leaf[offset] = ZAP_CHUNK_ARRAY;
                self.leaf[offset + 1..offset + 1 + part.len()].copy_from_slice(part);
                let next = if i + 1 == nchunks {
                    ZAP_CHAIN_END
                } else {
                    index + 1
                };
                self.leaf[offset + 22..offset + 24].copy_from_slice(&next.to_le_bytes());
                self.next_chunk += 1;
            }
            first
        }

        fn put_entry(&mut self, name: &str, value: &[u8], value_intlen: u8) {
            let mut name_bytes = name.as_bytes().to_vec();
            name_bytes.push(0);
            let name_chunk = self.put_array(&name_bytes);
            let value_chunk = self.put_array(value);

            let index = self.next_chunk;
            self.next_chunk += 1;
            let offset = Self::chunk_offset(index);
            let entry = &mut self.leaf[offset..offset + ZAP_LEAF_CHUNKSIZE];
            entry[0] = ZAP_CHUNK_ENTRY;
            entry[1] = value_intlen;
            entry[2..4].copy_from_slice(&ZAP_CHAIN_END.to_le_bytes()); // next
            entry[4..6].copy_from_slice(&name_chunk.to_le_bytes());
            entry[6..8].copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            entry[8..10].copy_from_slice(&value_chunk.to_le_bytes());
            entry[10..12]
                .copy_from_slice(&((value.len() / value_intlen as usize) as u16).to_le_bytes());
        }
    }

    /// A single-leaf fat ZAP holding string values, as a props object would.
    pub fn encode_fat_zap_strings(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut leaf = LeafBuilder::new();
        for (name, value) in entries {
            let mut bytes = value.as_bytes().to_vec();
            bytes.push(0);
            leaf.put_entry(name, &bytes, 1);
        }
        fat_zap(vec![leaf])
    }

    fn fat_zap(leaves: Vec<LeafBuilder>) -> Vec<u8> {
        let mut out = vec![0u8; ZAP_LEAF_BLOCK_SIZE];
        out[..8].copy_from_slice(&ZBT_HEADER.to_le_bytes());
        out[8..16].copy_from_slice(&ZAP_MAGIC.to_le_bytes());
        for leaf in leaves {
            out.extend_from_slice(&leaf.leaf);
        }
        out
    }

    #[test]
    fn micro_zap_lookup() {
        let buff = encode_micro_zap(&[("root_dataset", 2), ("config", 16)]);
        let zap = ZapObject::parse(&buff).unwrap();

        assert_eq!(Some(2), zap.lookup_u64("root_dataset"));
        assert_eq!(Some(16), zap.lookup_u64("config"));
        assert_eq!(None, zap.lookup_u64("sync_bplist"));
        assert_eq!(2, zap.len());
    }

    #[test]
    fn micro_zap_skips_empty_slots() {
        let buff = encode_micro_zap(&[("", 77), ("deleting", 5)]);
        let zap = ZapObject::parse(&buff).unwrap();
        assert_eq!(1, zap.len());
        assert_eq!(Some(5), zap.lookup_u64("deleting"));
    }

    #[test]
    fn iteration_round_trips_through_lookup() {
        let buff = encode_micro_zap(&[("a", 1), ("b", 2), ("c", 3)]);
        let zap = ZapObject::parse(&buff).unwrap();
        for (name, _) in zap.iter() {
            assert!(zap.lookup_u64(name).is_some());
        }
    }

    #[test]
    fn fat_zap_u64_entry() {
        let mut leaf = LeafBuilder::new();
        leaf.put_entry("head_dataset", &21u64.to_be_bytes(), 8);
        let zap = ZapObject::parse(&fat_zap(vec![leaf])).unwrap();
        assert_eq!(Some(21), zap.lookup_u64("head_dataset"));
    }

    #[test]
    fn fat_zap_chained_name_and_string_value() {
        let mut leaf = LeafBuilder::new();
        let long_name = "a-property-name-long-enough-to-span-chunks";
        leaf.put_entry(long_name, b"/export/home\0\0\0", 1);
        let zap = ZapObject::parse(&fat_zap(vec![leaf])).unwrap();
        assert_eq!(
            Some("/export/home".to_owned()),
            zap.lookup_string(long_name)
        );
    }

    #[test]
    fn fat_zap_multiple_leaves() {
        let mut first = LeafBuilder::new();
        first.put_entry("alpha", &1u64.to_be_bytes(), 8);
        let mut second = LeafBuilder::new();
        second.put_entry("beta", &2u64.to_be_bytes(), 8);

        let zap = ZapObject::parse(&fat_zap(vec![first, second])).unwrap();
        assert_eq!(Some(1), zap.lookup_u64("alpha"));
        assert_eq!(Some(2), zap.lookup_u64("beta"));
    }

    #[test]
    fn fat_zap_skips_non_leaf_blocks() {
        let mut leaf = LeafBuilder::new();
        leaf.put_entry("gamma", &3u64.to_be_bytes(), 8);

        let mut buff = fat_zap(vec![leaf]);
        // splice a pointer-table block between header and leaf
        let mut ptrtbl = vec![0u8; ZAP_LEAF_BLOCK_SIZE];
        ptrtbl[..8].copy_from_slice(&0x1234u64.to_le_bytes());
        buff.splice(
            ZAP_LEAF_BLOCK_SIZE..ZAP_LEAF_BLOCK_SIZE,
            ptrtbl.into_iter(),
        );

        let zap = ZapObject::parse(&buff).unwrap();
        assert_eq!(Some(3), zap.lookup_u64("gamma"));
    }

    #[test]
    fn fat_zap_size_guards() {
        let mut small = vec![0u8; ZAP_LEAF_BLOCK_SIZE];
        small[..8].copy_from_slice(&ZBT_HEADER.to_le_bytes());
        assert!(ZapObject::parse(&small).is_err());

        let mut unaligned = vec![0u8; 2 * ZAP_LEAF_BLOCK_SIZE + 512];
        unaligned[..8].copy_from_slice(&ZBT_HEADER.to_le_bytes());
        assert!(ZapObject::parse(&unaligned).is_err());
    }

    #[test]
    fn unterminated_chain_drops_the_entry() {
        let mut leaf = LeafBuilder::new();
        leaf.put_entry("victim", &9u64.to_be_bytes(), 8);
        // Claim a longer name than the chain provides.
        let entry_offset = LeafBuilder::chunk_offset(2) + 6;
        leaf.leaf[entry_offset..entry_offset + 2].copy_from_slice(&100u16.to_le_bytes());

        let zap = ZapObject::parse(&fat_zap(vec![leaf])).unwrap();
        assert!(zap.is_empty());
    }

    #[test]
    fn junk_buffer_is_rejected() {
        assert!(ZapObject::parse(&[0u8; 4]).is_err());
        assert!(ZapObject::parse(&[0u8; 64]).is_err());
    }
}
