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
use std::{collections::HashMap, num::NonZeroUsize, rc::Rc};

use lru::LruCache;

use super::{
    blkptr::BlockPtr,
    block_reader::BlockReader,
    definitions::*,
    dnode::{DnodePhys, ObjsetPhys},
    error::{Error, Result},
    nvlist::NvList,
    pool::Pool,
    utils::decode,
    zap::ZapObject,
};

/// File-content dnodes dominate most workloads and are rarely revisited, so
/// they are not worth cache slots.
const DNODE_CACHE_SIZE: usize = 4096;

/// An indexed view over the dnode array described by a meta-dnode: the
/// objects of one filesystem (or of the pool itself, for the meta object
/// set).
pub struct ObjectSet {
    os_type: ObjsetType,
    reader: BlockReader,
    count: u64,
    dnode_cache: LruCache<ZfsObjId, DnodePhys>,
    zap_cache: HashMap<ZfsObjId, Rc<ZapObject>>,
    master: Option<Rc<ZapObject>>,
}

impl ObjectSet {
    pub fn new(pool: &Pool, bp: &BlockPtr) -> Result<ObjectSet> {
        if bp.object_type != ObjectType::Objset {
            return Err(Error::Format("block pointer is not an object set"));
        }

        let raw = pool.read_bp(bp)?;
        let (phys, _): (ObjsetPhys, usize) = decode(&raw)?;

        if phys.meta_dnode.object_type != ObjectType::Dnode {
            return Err(Error::Format("object set meta dnode has the wrong type"));
        }

        let reader = BlockReader::new(&phys.meta_dnode)?;
        let count = reader.total_size() / DNODE_SIZE as u64;

        let mut os = ObjectSet {
            os_type: phys.os_type,
            reader,
            count,
            dnode_cache: LruCache::new(NonZeroUsize::new(DNODE_CACHE_SIZE).unwrap()),
            zap_cache: HashMap::new(),
            master: None,
        };

        // Object 1 is the object directory of the meta object set and the
        // master node of a filesystem; both are the entry point for string
        // lookups.
        if matches!(os.os_type, ObjsetType::Meta | ObjsetType::Zfs) {
            os.master = Some(os.read_zap(pool, MASTER_NODE_OBJ)?);
        }

        Ok(os)
    }

    pub fn os_type(&self) -> ObjsetType {
        self.os_type
    }

    pub fn object_count(&self) -> u64 {
        self.count
    }

    /// The object-directory (META) or master-node (ZFS) ZAP.
    pub fn master(&self) -> Result<&ZapObject> {
        self.master
            .as_deref()
            .ok_or(Error::Format("object set has no master node"))
    }

    /// Read one dnode slot.  The returned dnode is stamped with its index.
    pub fn read_dnode(&mut self, pool: &Pool, index: ZfsObjId) -> Result<DnodePhys> {
        if index >= self.count {
            return Err(Error::NotFound);
        }

        if let Some(dn) = self.dnode_cache.get(&index) {
            return Ok(dn.clone());
        }

        let raw = self
            .reader
            .read(pool, index * DNODE_SIZE as u64, DNODE_SIZE)?;
        let (mut dn, _): (DnodePhys, usize) = decode(&raw)?;
        dn.object_id = index;

        if dn.object_type != ObjectType::PlainFileContents {
            self.dnode_cache.put(index, dn.clone());
        }

        Ok(dn)
    }

    pub fn read_dnode_typed(
        &mut self,
        pool: &Pool,
        index: ZfsObjId,
        expected: ObjectType,
    ) -> Result<DnodePhys> {
        let dn = self.read_dnode(pool, index)?;
        if dn.object_type != expected {
            return Err(Error::Format("object has an unexpected type"));
        }
        Ok(dn)
    }

    /// Decode the ZAP stored in an object, memoized so directory re-entries
    /// cost one map probe.
    pub fn read_zap(&mut self, pool: &Pool, index: ZfsObjId) -> Result<Rc<ZapObject>> {
        if let Some(zap) = self.zap_cache.get(&index) {
            return Ok(Rc::clone(zap));
        }

        let dn = self.read_dnode(pool, index)?;
        let zap = Rc::new(ZapObject::from_dnode(pool, &dn)?);
        self.zap_cache.insert(index, Rc::clone(&zap));
        Ok(zap)
    }

    /// Decode a PACKED_NVLIST object.
    pub fn read_nvlist(&mut self, pool: &Pool, index: ZfsObjId) -> Result<NvList> {
        let dn = self.read_dnode_typed(pool, index, ObjectType::PackedNvlist)?;
        let mut reader = BlockReader::new(&dn)?;
        let raw = reader.read_all(pool)?;
        NvList::unpack(&raw)
    }

    /// Resolve a name through the ZAP stored in `parent`.
    pub fn lookup(&mut self, pool: &Pool, parent: ZfsObjId, name: &str) -> Result<ZfsObjId> {
        let zap = self.read_zap(pool, parent)?;
        zap.lookup_u64(name).ok_or(Error::NotFound)
    }
}
