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
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::warn;

use super::{
    blkptr::BlockPtr,
    definitions::*,
    dnode::{DnodePhys, DslDatasetPhys, DslDirPhys},
    error::{Error, Result},
    objset::ObjectSet,
    pool::Pool,
};

const PATH_CACHE_SIZE: usize = 1024;

/// One node of the DSL hierarchy: a DSL directory, its head dataset, its
/// mountpoint property, and its children.  The head filesystem's object set
/// is opened on first use.
pub struct Dataset {
    name: String,
    object_id: ZfsObjId,
    dir: DslDirPhys,
    dataset: DslDatasetPhys,
    mountpoint: Option<String>,
    children: Vec<Dataset>,
    head: Option<ObjectSet>,
    path_cache: LruCache<String, DnodePhys>,
}

impl Dataset {
    /// Build the dataset tree from the meta object set at the active
    /// uberblock's root block pointer.
    pub fn open(pool: &Pool, root_bp: &BlockPtr, name: &str) -> Result<Dataset> {
        let mut mos = ObjectSet::new(pool, root_bp)?;

        let root_index = mos
            .master()?
            .lookup_u64("root_dataset")
            .ok_or(Error::Format("object directory has no root_dataset"))?;

        Self::init(pool, &mut mos, name, root_index)
    }

    fn init(pool: &Pool, mos: &mut ObjectSet, name: &str, dir_index: ZfsObjId) -> Result<Dataset> {
        let dir_dnode = mos.read_dnode_typed(pool, dir_index, ObjectType::DslDir)?;
        let dir = dir_dnode.dsl_dir()?;

        let ds_dnode = mos.read_dnode_typed(pool, dir.head_dataset_obj, ObjectType::DslDataset)?;
        let dataset = ds_dnode.dsl_dataset()?;

        let mountpoint = if dir.props_zapobj != 0 {
            mos.read_zap(pool, dir.props_zapobj)
                .ok()
                .and_then(|zap| zap.lookup_string("mountpoint"))
        } else {
            None
        };

        let mut children = Vec::new();
        if dir.child_dir_zapobj != 0 {
            let child_zap = mos.read_zap(pool, dir.child_dir_zapobj)?;
            let named: Vec<(String, u64)> = child_zap
                .iter()
                .filter_map(|(child, _)| {
                    child_zap.lookup_u64(child).map(|v| (child.to_owned(), v))
                })
                .collect();
            drop(child_zap);

            for (child_name, child_index) in named {
                match Self::init(pool, mos, &child_name, child_index) {
                    Ok(child) => children.push(child),
                    Err(e) => warn!("skipping dataset {child_name:?}: {e}"),
                }
            }
        }

        Ok(Dataset {
            name: name.to_owned(),
            object_id: dir_index,
            dir,
            dataset,
            mountpoint,
            children,
            head: None,
            path_cache: LruCache::new(NonZeroUsize::new(PATH_CACHE_SIZE).unwrap()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_id(&self) -> ZfsObjId {
        self.object_id
    }

    pub fn mountpoint(&self) -> Option<&str> {
        self.mountpoint.as_deref()
    }

    pub fn children(&self) -> &[Dataset] {
        &self.children
    }

    /// Space charged to this DSL directory, for statfs.
    pub fn used_bytes(&self) -> u64 {
        self.dir.used_bytes
    }

    /// Descend the child list by slash-separated dataset names.
    pub fn find(&self, path: &str) -> Option<&Dataset> {
        let mut cur = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = cur.children.iter().find(|child| child.name == part)?;
        }
        Some(cur)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Dataset> {
        let mut cur = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = cur.children.iter_mut().find(|child| child.name == part)?;
        }
        Some(cur)
    }

    /// Every dataset in this subtree that has a mountpoint property.
    pub fn mount_points(&self) -> Vec<&Dataset> {
        let mut out = Vec::new();
        if self.mountpoint.is_some() {
            out.push(self);
        }
        for child in &self.children {
            out.extend(child.mount_points());
        }
        out
    }

    /// The head filesystem's object set, opened on first use.
    pub fn head(&mut self, pool: &Pool) -> Result<&mut ObjectSet> {
        if self.head.is_none() {
            if self.dataset.bp.object_type != ObjectType::Objset {
                return Err(Error::Format("head dataset does not point at an object set"));
            }
            self.head = Some(ObjectSet::new(pool, &self.dataset.bp)?);
        }
        Ok(self.head.as_mut().unwrap())
    }

    /// Resolve an absolute filesystem path to its dnode, descending ZAP
    /// directories from the master node.  The descent starts under the
    /// `ROOT` entry, following the OpenSolaris root-filesystem layout.
    pub fn lookup_path(&mut self, pool: &Pool, path: &str) -> Result<DnodePhys> {
        if !path.starts_with('/') {
            return Err(Error::NotFound);
        }

        let key = path.trim_end_matches('/');
        if let Some(dn) = self.path_cache.get(key) {
            return Ok(dn.clone());
        }

        let mut index = MASTER_NODE_OBJ;
        let mut resolved: Option<DnodePhys> = None;

        let components =
            std::iter::once(ZFS_ROOT_OBJ).chain(key.split('/').filter(|c| !c.is_empty()));

        for component in components {
            let head = self.head(pool)?;
            let entry = head.lookup(pool, index, component)?;

            // the entry type in the top bits is not interpreted here
            index = entry & ZFS_DIRENT_OBJ_MASK;

            let dn = head.read_dnode(pool, index)?;
            if dn.object_type != ObjectType::DirectoryContents
                && dn.object_type != ObjectType::PlainFileContents
            {
                return Err(Error::Format("path component is neither file nor directory"));
            }
            resolved = Some(dn);
        }

        let dn = resolved.expect("the ROOT component always resolves");
        self.path_cache.put(key.to_owned(), dn.clone());
        Ok(dn)
    }
}
