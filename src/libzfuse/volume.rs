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
use std::{
    collections::HashMap,
    ffi::OsStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request, FUSE_ROOT_ID,
};
use libc::S_IFMT;
use tracing::{debug, error, warn};

use super::{
    block_reader::BlockReader,
    definitions::*,
    dataset::Dataset,
    dnode::DnodePhys,
    error::{Error, Result, EROFS_DENIED},
    pool::Pool,
    utils::{file_kind, wildcard_match},
};

struct OpenObject {
    dnode: DnodePhys,
    size: u64,
    reader: BlockReader,
    count: u32,
}

/// One directory entry as reported by `read_dir`.
#[derive(Debug)]
pub struct DirEntry {
    pub name: String,
    pub attr: FileAttr,
}

/// A mounted dataset: the handle-oriented read facade consumed by the fuse
/// shim and the CLI.
pub struct Volume {
    pool: Pool,
    root: Dataset,
    mounted: String,
    root_obj: ZfsObjId,
    open_objects: HashMap<u64, OpenObject>,
}

impl Volume {
    // Nothing on the pool ever changes, so the kernel may cache attributes
    // and entries indefinitely.
    const TTL: Duration = Duration::from_secs(u64::MAX);

    /// Mount one dataset of the pool.  The path's first component is the
    /// pool name, the rest descends the dataset tree.
    pub fn mount(pool: Pool, dataset_path: &str) -> Result<Volume> {
        let mut parts = dataset_path.split('/').filter(|p| !p.is_empty());
        let pool_name = parts.next().ok_or(Error::NotFound)?;
        if pool_name != pool.name {
            error!("pool is named {:?}, not {:?}", pool.name, pool_name);
            return Err(Error::NotFound);
        }

        let mounted = parts.collect::<Vec<_>>().join("/");
        let rootbp = pool.active().rootbp;
        let mut root = Dataset::open(&pool, &rootbp, pool_name)?;

        let dataset = root.find_mut(&mounted).ok_or(Error::NotFound)?;
        let root_obj = dataset.lookup_path(&pool, "/")?.object_id;

        Ok(Volume {
            pool,
            root,
            mounted,
            root_obj,
            open_objects: HashMap::new(),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn dataset(&mut self) -> (&Pool, &mut Dataset) {
        let Volume {
            pool,
            root,
            mounted,
            ..
        } = self;
        let ds = root
            .find_mut(mounted)
            .expect("the mounted dataset was resolved at mount time");
        (pool, ds)
    }

    fn obj_of(&self, ino: u64) -> ZfsObjId {
        if ino == FUSE_ROOT_ID {
            self.root_obj
        } else {
            ino
        }
    }

    fn ino_of(&self, obj: ZfsObjId) -> u64 {
        if obj == self.root_obj {
            FUSE_ROOT_ID
        } else {
            obj
        }
    }

    fn read_dnode(&mut self, obj: ZfsObjId) -> Result<DnodePhys> {
        let (pool, ds) = self.dataset();
        ds.head(pool)?.read_dnode(pool, obj)
    }

    fn attr(&self, dnode: &DnodePhys) -> Result<FileAttr> {
        let znode = dnode.znode()?;
        let kind = file_kind(znode.mode)?;
        let timestamp = |pair: [u64; 2]| UNIX_EPOCH + Duration::new(pair[0], pair[1] as u32);

        Ok(FileAttr {
            ino: self.ino_of(dnode.object_id),
            size: znode.size,
            blocks: znode.size.div_ceil(SECTOR_SIZE),
            atime: timestamp(znode.atime),
            mtime: timestamp(znode.mtime),
            ctime: timestamp(znode.ctime),
            crtime: timestamp(znode.crtime),
            kind,
            // the pool is read-only no matter what the znode says
            perm: (znode.mode as u16 & !(S_IFMT as u16)) & !0o222,
            nlink: znode.links as u32,
            uid: znode.uid as u32,
            gid: znode.gid as u32,
            rdev: znode.rdev as u32,
            blksize: dnode.datablksize() as u32,
            flags: 0,
        })
    }

    fn open_object(&mut self, obj: ZfsObjId) -> Result<()> {
        if let Some(open) = self.open_objects.get_mut(&obj) {
            open.count += 1;
            return Ok(());
        }

        let dnode = self.read_dnode(obj)?;
        let size = dnode.znode().map(|z| z.size).unwrap_or_default();
        let reader = BlockReader::new(&dnode)?;
        self.open_objects.insert(
            obj,
            OpenObject {
                dnode,
                size,
                reader,
                count: 1,
            },
        );
        Ok(())
    }

    fn release_object(&mut self, obj: ZfsObjId) {
        match self.open_objects.get_mut(&obj) {
            Some(open) => {
                open.count -= 1;
                if open.count == 0 {
                    self.open_objects.remove(&obj);
                }
            }
            None => warn!("close without open for object {obj}"),
        }
    }

    /// Open a file or directory by absolute path; the handle doubles as the
    /// object id.
    pub fn open_path(&mut self, path: &str) -> Result<u64> {
        let (pool, ds) = self.dataset();
        let dnode = ds.lookup_path(pool, path)?;
        let obj = dnode.object_id;
        self.open_object(obj)?;
        Ok(obj)
    }

    pub fn close(&mut self, handle: u64) {
        self.release_object(handle);
    }

    /// Read from an open handle, clamped to the file size.
    pub fn read(&mut self, handle: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let Volume {
            pool, open_objects, ..
        } = self;
        let open = open_objects.get_mut(&handle).ok_or(Error::NotFound)?;

        if offset >= open.size {
            return Ok(Vec::new());
        }
        let size = size.min((open.size - offset) as usize);
        open.reader.read(pool, offset, size)
    }

    pub fn stat_path(&mut self, path: &str) -> Result<FileAttr> {
        let (pool, ds) = self.dataset();
        let dnode = ds.lookup_path(pool, path)?;
        self.attr(&dnode)
    }

    /// List a directory, filtered by an optional `*`/`?` pattern.
    pub fn read_dir(&mut self, path: &str, pattern: Option<&str>) -> Result<Vec<DirEntry>> {
        let (pool, ds) = self.dataset();
        let dnode = ds.lookup_path(pool, path)?;
        if dnode.object_type != ObjectType::DirectoryContents {
            return Err(Error::NotFound);
        }
        self.list_object(dnode.object_id, pattern)
    }

    fn list_object(&mut self, obj: ZfsObjId, pattern: Option<&str>) -> Result<Vec<DirEntry>> {
        let (pool, ds) = self.dataset();
        let head = ds.head(pool)?;
        let zap = head.read_zap(pool, obj)?;

        let mut names = Vec::new();
        for (name, _) in zap.iter() {
            if pattern.map_or(true, |p| wildcard_match(p, name)) {
                if let Some(entry) = zap.lookup_u64(name) {
                    names.push((name.to_owned(), entry & ZFS_DIRENT_OBJ_MASK));
                }
            }
        }
        drop(zap);

        let mut entries = Vec::with_capacity(names.len());
        for (name, child_obj) in names {
            let dnode = self.read_dnode(child_obj)?;
            match self.attr(&dnode) {
                Ok(attr) => entries.push(DirEntry { name, attr }),
                Err(e) => debug!("skipping entry {name:?}: {e}"),
            }
        }
        Ok(entries)
    }

    /// Total and used bytes, shaped by each vdev's redundancy.
    pub fn stat_fs(&self) -> (u64, u64) {
        let total: u64 = self.pool.vdevs().iter().map(|v| v.shaped_asize()).sum();
        let used = self.root.used_bytes();
        (total, used.min(total))
    }

    fn symlink_target(&mut self, obj: ZfsObjId) -> Result<Vec<u8>> {
        let dnode = self.read_dnode(obj)?;
        let znode = dnode.znode()?;
        if file_kind(znode.mode)? != FileType::Symlink {
            return Err(Error::Format("readlink of a non-symlink"));
        }
        let mut reader = BlockReader::new(&dnode)?;
        let Volume { pool, .. } = self;
        reader.read(pool, 0, znode.size as usize)
    }
}

impl Filesystem for Volume {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent = self.obj_of(parent);
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        let result = (|| -> Result<(FileAttr, u64)> {
            let (pool, ds) = self.dataset();
            let head = ds.head(pool)?;
            let entry = head.lookup(pool, parent, name)?;
            let dnode = head.read_dnode(pool, entry & ZFS_DIRENT_OBJ_MASK)?;
            let generation = dnode.znode().map(|z| z.gen).unwrap_or_default();
            Ok((self.attr(&dnode)?, generation))
        })();

        match result {
            Ok((attr, generation)) => reply.entry(&Self::TTL, &attr, generation),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let obj = self.obj_of(ino);
        let result = self.read_dnode(obj).and_then(|dnode| self.attr(&dnode));
        match result {
            Ok(attr) => reply.attr(&Self::TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let obj = self.obj_of(ino);
        match self.symlink_target(obj) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let obj = self.obj_of(ino);
        match self.open_object(obj) {
            Ok(()) => reply.opened(0, fuser::consts::FOPEN_KEEP_CACHE),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let obj = self.obj_of(ino);
        if self.open_objects.get(&obj).is_none() {
            if let Err(e) = self.open_object(obj) {
                reply.error(e.errno());
                return;
            }
        }

        match self.read(obj, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let obj = self.obj_of(ino);
        self.release_object(obj);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let obj = self.obj_of(ino);
        match self.open_object(obj) {
            Ok(()) => reply.opened(0, fuser::consts::FOPEN_CACHE_DIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let obj = self.obj_of(ino);

        let listing = (|| -> Result<Vec<(u64, FileType, String)>> {
            let dnode = self.read_dnode(obj)?;
            if dnode.object_type != ObjectType::DirectoryContents {
                return Err(Error::NotFound);
            }
            let parent = dnode.znode().map(|z| z.parent).unwrap_or(obj);

            let mut out = vec![
                (self.ino_of(obj), FileType::Directory, ".".to_owned()),
                (self.ino_of(parent), FileType::Directory, "..".to_owned()),
            ];
            for entry in self.list_object(obj, None)? {
                out.push((entry.attr.ino, entry.attr.kind, entry.name));
            }
            Ok(out)
        })();

        match listing {
            Ok(entries) => {
                for (i, (ino, kind, name)) in
                    entries.into_iter().enumerate().skip(offset.max(0) as usize)
                {
                    if reply.add(ino, (i + 1) as i64, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        let obj = self.obj_of(ino);
        self.release_object(obj);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let (total, used) = self.stat_fs();
        let free_sectors = (total - used) >> SECTOR_SHIFT;
        reply.statfs(
            total >> SECTOR_SHIFT,
            free_sectors,
            free_sectors,
            0,
            0,
            SECTOR_SIZE as u32,
            255,
            SECTOR_SIZE as u32,
        );
    }

    fn access(&mut self, _req: &Request, _ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(EROFS_DENIED);
        } else {
            reply.ok();
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(EROFS_DENIED);
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(EROFS_DENIED);
    }

    fn mknod(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS_DENIED);
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(EROFS_DENIED);
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS_DENIED);
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(EROFS_DENIED);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(EROFS_DENIED);
    }

    fn create(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(EROFS_DENIED);
    }
}
