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
use super::{
    blkptr::BlockPtr,
    definitions::*,
    dnode::DnodePhys,
    error::{Error, Result},
    pool::Pool,
    utils::decode,
};

/// Streams the contents of one dnode as a byte-addressable range, walking
/// the indirect-block tree on demand.
///
/// Level `nlevels - 1` holds the single root column copied from the dnode's
/// inline block pointers; lower levels are sparse arrays of columns, each a
/// slab of decoded block pointers covering one indirect block.  Columns are
/// resolved at most once and never shrink.  The reader owns its caches;
/// nothing is shared between dnodes.
#[derive(Debug)]
pub struct BlockReader {
    dnode: DnodePhys,
    datablksize: u64,
    indblkcount: usize,
    levels: Vec<Vec<Option<Box<[BlockPtr]>>>>,
    cache: Option<(u64, Vec<u8>)>,
}

impl BlockReader {
    pub fn new(dnode: &DnodePhys) -> Result<BlockReader> {
        if !dnode.is_allocated() {
            return Err(Error::Format("reader over an unallocated dnode"));
        }
        if dnode.nlevels < 1 {
            return Err(Error::Format("dnode has no levels"));
        }
        if dnode.indblkshift < DN_MIN_INDBLKSHIFT {
            return Err(Error::Format("indirect block shift too small"));
        }
        if dnode.datablkszsec == 0 {
            return Err(Error::Format("dnode has no data block size"));
        }

        let indblkcount = (1usize << dnode.indblkshift) >> SPA_BLKPTRSHIFT;
        if dnode.blkptr.len() > indblkcount {
            return Err(Error::Format("more root block pointers than the fanout"));
        }

        let mut levels: Vec<Vec<Option<Box<[BlockPtr]>>>> =
            (0..dnode.nlevels).map(|_| Vec::new()).collect();
        levels[dnode.nlevels as usize - 1] = vec![Some(dnode.blkptr.clone().into_boxed_slice())];

        Ok(BlockReader {
            dnode: dnode.clone(),
            datablksize: dnode.datablksize(),
            indblkcount,
            levels,
            cache: None,
        })
    }

    pub fn dnode(&self) -> &DnodePhys {
        &self.dnode
    }

    /// Addressable size: everything up to and including the last allocated
    /// block.
    pub fn total_size(&self) -> u64 {
        (self.dnode.maxblkid + 1) * self.datablksize
    }

    /// Resolve the block pointer for `id` at `level`, materializing the
    /// column that holds it (and, recursively, the ancestors of that column).
    fn fetch_block(&mut self, pool: &Pool, level: usize, id: u64) -> Result<BlockPtr> {
        let top = self.dnode.nlevels as usize - 1;
        if level == top {
            let root = self.levels[top][0].as_ref().unwrap();
            return root
                .get(id as usize)
                .copied()
                .ok_or(Error::Format("block id beyond the root block pointers"));
        }

        let shift = u32::from(self.dnode.indblkshift) - SPA_BLKPTRSHIFT;
        let col = (id >> shift) as usize;
        let slot = (id & ((1 << shift) - 1)) as usize;

        if self.levels[level].len() <= col {
            self.levels[level].resize_with(col + 1, || None);
        }

        if self.levels[level][col].is_none() {
            let parent = self.fetch_block(pool, level + 1, col as u64)?;

            let slab: Box<[BlockPtr]> = if parent.is_hole() {
                vec![BlockPtr::hole(); self.indblkcount].into_boxed_slice()
            } else {
                let raw = pool.read_bp(&parent)?;
                if raw.len() < self.indblkcount << SPA_BLKPTRSHIFT {
                    return Err(Error::Format("short indirect block"));
                }
                raw.chunks_exact(BLKPTR_SIZE)
                    .take(self.indblkcount)
                    .map(|chunk| decode::<BlockPtr>(chunk).map(|(bp, _)| bp))
                    .collect::<std::result::Result<Vec<_>, _>>()?
                    .into_boxed_slice()
            };

            self.levels[level][col] = Some(slab);
        }

        Ok(self.levels[level][col].as_ref().unwrap()[slot])
    }

    /// The bonus-resident payload served for an inline symlink: present when
    /// the whole file fits in the bonus bytes past the znode.
    fn inline_data(&self) -> Option<&[u8]> {
        if self.dnode.object_type != ObjectType::PlainFileContents {
            return None;
        }
        let size = self.dnode.znode().ok()?.size as usize;
        let payload = self.dnode.inline_payload();
        (size <= payload.len()).then(|| &payload[..size])
    }

    /// Read `size` bytes at `offset`.  Holes read as zeros; so does the tail
    /// past the last allocated block of a plain file, where zfs may report a
    /// file size larger than what is allocated.
    pub fn read(&mut self, pool: &Pool, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        if size == 0 {
            return Ok(out);
        }

        let mut block_id = offset / self.datablksize;
        let mut block_off = (offset % self.datablksize) as usize;
        let mut first = true;

        while out.len() < size {
            if block_id > self.dnode.maxblkid {
                if self.dnode.object_type == ObjectType::PlainFileContents {
                    out.resize(size, 0);
                    break;
                }
                return Err(Error::Format("read beyond the last block"));
            }

            let bp = self.fetch_block(pool, 0, block_id)?;
            let chunk = (self.datablksize as usize - block_off).min(size - out.len());
            let filled = out.len();

            if bp.is_hole() {
                if first {
                    if let Some(inline) = self.inline_data() {
                        let start = (offset as usize).min(inline.len());
                        let end = (offset as usize + size).min(inline.len());
                        out.extend_from_slice(&inline[start..end]);
                        out.resize(size, 0);
                        return Ok(out);
                    }
                }
                out.resize(filled + chunk, 0);
            } else if block_off == 0 && chunk == self.datablksize as usize {
                // A fully covered block goes straight to the caller without
                // touching the cache slot.
                let data = pool.read_bp(&bp)?;
                out.extend_from_slice(&data[..chunk.min(data.len())]);
                out.resize(filled + chunk, 0);
            } else {
                if self.cache.as_ref().map(|(id, _)| *id) != Some(block_id) {
                    let data = pool.read_bp(&bp)?;
                    self.cache = Some((block_id, data));
                }
                let (_, data) = self.cache.as_ref().unwrap();
                let end = (block_off + chunk).min(data.len());
                if block_off < data.len() {
                    out.extend_from_slice(&data[block_off..end]);
                }
                out.resize(filled + chunk, 0);
            }

            first = false;
            block_id += 1;
            block_off = 0;
        }

        Ok(out)
    }

    /// Read the whole object.
    pub fn read_all(&mut self, pool: &Pool) -> Result<Vec<u8>> {
        let size = self.total_size();
        self.read(pool, 0, size as usize)
    }
}

#[cfg(test)]
mod t {
    use super::super::dnode::t::{encode_dnode, encode_znode, hole_bp, DnodeLayout};
    use super::super::pool::t::ImageBuilder;
    use super::*;

    fn file_dnode(
        blkptrs: &[Vec<u8>],
        nlevels: u8,
        maxblkid: u64,
        znode_size: u64,
        inline: &[u8],
    ) -> DnodePhys {
        let bonus = encode_znode(znode_size, 0o100644, inline);
        let raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::PlainFileContents,
            indblkshift: 9, // 4-wide fanout keeps fixtures small
            nlevels,
            bonustype: ObjectType::Znode,
            datablkszsec: 1,
            maxblkid,
            blkptrs,
            bonus: &bonus,
        });
        decode::<DnodePhys>(&raw).unwrap().0
    }

    #[test]
    fn reads_slice_across_blocks() {
        let mut img = ImageBuilder::new();
        let block_a: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        let block_b = vec![0x77u8; 512];
        let bp_a = img.write_block(&block_a, ObjectType::PlainFileContents, 0);
        let bp_b = img.write_block(&block_b, ObjectType::PlainFileContents, 0);
        let (pool, _f) = img.finish();

        let dn = file_dnode(&[bp_a, bp_b], 1, 1, 1024, b"");
        let mut reader = BlockReader::new(&dn).unwrap();
        assert_eq!(1024, reader.total_size());

        let expected: Vec<u8> = block_a[256..]
            .iter()
            .chain(block_b[..256].iter())
            .copied()
            .collect();
        assert_eq!(expected, reader.read(&pool, 256, 512).unwrap());

        // Re-reads see the same bytes through the warm cache.
        assert_eq!(expected, reader.read(&pool, 256, 512).unwrap());
        assert_eq!(block_a, reader.read(&pool, 0, 512).unwrap());
    }

    #[test]
    fn walks_an_indirect_level() {
        let mut img = ImageBuilder::new();
        let blocks: Vec<Vec<u8>> = (0u8..3).map(|i| vec![i + 1; 512]).collect();
        let mut indirect = Vec::new();
        for block in &blocks {
            indirect.extend_from_slice(&img.write_block(block, ObjectType::PlainFileContents, 0));
        }
        indirect.extend_from_slice(&hole_bp());
        let ind_bp = img.write_block(&indirect, ObjectType::PlainFileContents, 1);
        let (pool, _f) = img.finish();

        let dn = file_dnode(&[ind_bp], 2, 3, 3 * 512, b"");
        assert_eq!(2, dn.nlevels);
        let mut reader = BlockReader::new(&dn).unwrap();

        let all = reader.read(&pool, 0, 3 * 512).unwrap();
        assert_eq!(blocks.concat(), all);

        // The hole slot under the same indirect column reads as zeros.
        assert_eq!(vec![0u8; 512], reader.read(&pool, 3 * 512, 512).unwrap());
    }

    #[test]
    fn holes_read_as_zeros() {
        let (pool, _f) = ImageBuilder::new().finish();
        let dn = file_dnode(&[hole_bp()], 1, 0, 512, b"");
        let mut reader = BlockReader::new(&dn).unwrap();
        assert_eq!(vec![0u8; 512], reader.read(&pool, 0, 512).unwrap());
    }

    #[test]
    fn inline_symlink_target() {
        let (pool, _f) = ImageBuilder::new().finish();
        let dn = file_dnode(&[hole_bp()], 1, 0, 9, b"/usr/bin\0");
        let mut reader = BlockReader::new(&dn).unwrap();
        assert_eq!(b"/usr/bin\0".to_vec(), reader.read(&pool, 0, 9).unwrap());
        assert_eq!(b"usr".to_vec(), reader.read(&pool, 1, 3).unwrap());
    }

    #[test]
    fn plain_file_tail_reads_zeros() {
        let mut img = ImageBuilder::new();
        let bp = img.write_block(&[0x42; 512], ObjectType::PlainFileContents, 0);
        let (pool, _f) = img.finish();

        let dn = file_dnode(&[bp], 1, 0, 2048, b"");
        let mut reader = BlockReader::new(&dn).unwrap();
        let out = reader.read(&pool, 0, 2048).unwrap();
        assert!(out[..512].iter().all(|&b| b == 0x42));
        assert!(out[512..].iter().all(|&b| b == 0));
    }

    #[test]
    fn non_file_objects_cannot_read_past_the_end() {
        let mut img = ImageBuilder::new();
        let bp = img.write_block(&[0u8; 512], ObjectType::DirectoryContents, 0);
        let (pool, _f) = img.finish();

        let raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::DirectoryContents,
            indblkshift: 9,
            nlevels: 1,
            bonustype: ObjectType::Znode,
            datablkszsec: 1,
            maxblkid: 0,
            blkptrs: &[bp],
            bonus: &encode_znode(512, 0o040755, b""),
        });
        let dn = decode::<DnodePhys>(&raw).unwrap().0;
        let mut reader = BlockReader::new(&dn).unwrap();

        assert!(reader.read(&pool, 0, 512).is_ok());
        assert!(reader.read(&pool, 0, 1024).is_err());
    }

    #[test]
    fn rejects_bad_geometry() {
        let raw = encode_dnode(&DnodeLayout {
            object_type: ObjectType::PlainFileContents,
            indblkshift: 3,
            nlevels: 1,
            bonustype: ObjectType::Znode,
            datablkszsec: 1,
            maxblkid: 0,
            blkptrs: &[hole_bp()],
            bonus: &encode_znode(0, 0o100644, b""),
        });
        let dn = decode::<DnodePhys>(&raw).unwrap().0;
        assert!(BlockReader::new(&dn).is_err());
    }
}
