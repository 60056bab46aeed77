// Copyright 2025 Oxide Computer Company
//! Object-store collaborator.
//!
//! The on-disk filesystem backend is out of scope; this module defines the
//! interface the reintegration engine consumes, plus an in-memory
//! implementation with the same transactional shape: every mutation happens
//! under a transaction, commit callbacks fire only once the transaction is
//! durable (here: at the next `sync`), and the durable-record facility used
//! by the client ledger rides the same commit discipline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use talus_common::{
    FileId, ObjectAttrs, ObjectKind, SetAttrs, TalusError,
};
use talus_protocol::{LayoutHint, StatfsReply};

/// Transaction handle.  Obtained from [`ObjectStore::begin`], consumed by
/// [`ObjectStore::commit`].
#[derive(Debug, Eq, PartialEq, Hash)]
pub struct Txn(pub u64);

pub type CommitCallback = Box<dyn FnOnce() + Send>;

/// What `unlink` observed, so the caller can decide between orphan
/// retention and physical removal.
#[derive(Debug)]
pub struct UnlinkOutcome {
    pub id: FileId,
    pub kind: ObjectKind,
    /// Link count after the unlink.
    pub nlink_now: u32,
    pub blocks: u64,
}

/// The filesystem backend, reduced to what the request/recovery core
/// needs.  All calls are synchronous and quick; the implementation is
/// responsible for its own internal locking.
pub trait ObjectStore: Send + Sync {
    fn begin(&self, credits: usize) -> Txn;
    fn register_commit(&self, txn: &Txn, cb: CommitCallback);
    fn commit(&self, txn: Txn) -> Result<(), TalusError>;
    /// Make every committed transaction durable, firing their commit
    /// callbacks.  Returns how many transactions were retired.
    fn sync(&self) -> usize;

    fn root(&self) -> FileId;
    fn lookup(
        &self,
        parent: FileId,
        name: &str,
    ) -> Result<Option<FileId>, TalusError>;
    fn attrs(&self, id: FileId) -> Result<ObjectAttrs, TalusError>;
    fn create(
        &self,
        txn: &Txn,
        parent: FileId,
        name: &str,
        kind: ObjectKind,
        mode: u32,
    ) -> Result<FileId, TalusError>;
    fn link(
        &self,
        txn: &Txn,
        source: FileId,
        parent: FileId,
        name: &str,
    ) -> Result<(), TalusError>;
    fn unlink(
        &self,
        txn: &Txn,
        parent: FileId,
        name: &str,
    ) -> Result<UnlinkOutcome, TalusError>;
    fn rename_entry(
        &self,
        txn: &Txn,
        src_parent: FileId,
        src_name: &str,
        dst_parent: FileId,
        dst_name: &str,
    ) -> Result<(), TalusError>;
    fn set_attributes(
        &self,
        txn: &Txn,
        id: FileId,
        attrs: SetAttrs,
    ) -> Result<(), TalusError>;

    /// Park an object with no remaining links in the reserved
    /// pending-deletion area instead of removing it.
    fn move_to_pending(&self, txn: &Txn, id: FileId)
        -> Result<(), TalusError>;
    /// Physically remove an object (pending or not), returning its
    /// storage-layout metadata if it was a regular file.
    fn destroy(
        &self,
        txn: &Txn,
        id: FileId,
    ) -> Result<Option<LayoutHint>, TalusError>;
    fn is_pending(&self, id: FileId) -> bool;

    /// Whether `ancestor` lies on the path from the root to `descendant`.
    fn is_ancestor(
        &self,
        ancestor: FileId,
        descendant: FileId,
    ) -> Result<bool, TalusError>;

    fn statfs(&self) -> Result<StatfsReply, TalusError>;

    /// Ledger record slots.  Records persist across service restarts as
    /// long as the store itself survives.
    fn read_record(&self, slot: usize) -> Result<Option<Vec<u8>>, TalusError>;
    fn write_record(
        &self,
        txn: &Txn,
        slot: usize,
        data: &[u8],
    ) -> Result<(), TalusError>;
    fn record_count(&self) -> usize;
}

const ROOT_INO: u64 = 2;

#[derive(Debug, Clone)]
struct Object {
    attrs: ObjectAttrs,
    /// Directory entries; empty and unused for files.
    children: BTreeMap<String, FileId>,
    /// Parent directory, for ancestry walks.  The root points at itself.
    parent: FileId,
}

#[derive(Default)]
struct MemStoreInner {
    objects: HashMap<FileId, Object>,
    pending: HashSet<FileId>,
    records: BTreeMap<usize, Vec<u8>>,
    next_ino: u64,
    next_txn: u64,
    open_txns: HashMap<u64, Vec<CommitCallback>>,
    /// Commit callbacks of committed-but-not-yet-durable transactions,
    /// fired in commit order at the next sync.
    unsynced: Vec<Vec<CommitCallback>>,
}

/// In-memory object store.
///
/// Mutations apply immediately under one mutex; the commit/sync split only
/// defers durability *callbacks*, which is all the protocol machinery
/// observes.  Crash simulation in tests works by rebuilding the service on
/// top of the same store.
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> MemStore {
        let root = FileId::new(ROOT_INO, 1);
        let mut objects = HashMap::new();
        objects.insert(
            root,
            Object {
                attrs: ObjectAttrs {
                    id: root,
                    kind: ObjectKind::Directory,
                    mode: 0o755,
                    uid: 0,
                    gid: 0,
                    size: 0,
                    mtime: 0,
                    nlink: 2,
                },
                children: BTreeMap::new(),
                parent: root,
            },
        );
        MemStore {
            inner: Mutex::new(MemStoreInner {
                objects,
                next_ino: ROOT_INO + 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemStore {
    fn begin(&self, _credits: usize) -> Txn {
        let mut inner = self.inner.lock().unwrap();
        inner.next_txn += 1;
        let id = inner.next_txn;
        inner.open_txns.insert(id, Vec::new());
        Txn(id)
    }

    fn register_commit(&self, txn: &Txn, cb: CommitCallback) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .open_txns
            .get_mut(&txn.0)
            .expect("commit callback on unknown transaction")
            .push(cb);
    }

    fn commit(&self, txn: Txn) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.open_txns.remove(&txn.0) {
            Some(cbs) => {
                inner.unsynced.push(cbs);
                Ok(())
            }
            None => Err(TalusError::IoError(
                "commit of unknown transaction".to_string(),
            )),
        }
    }

    fn sync(&self) -> usize {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.unsynced)
        };
        let n = drained.len();
        // Callbacks run outside the store lock; they reach back into the
        // service and the ledger.
        for cbs in drained {
            for cb in cbs {
                cb();
            }
        }
        n
    }

    fn root(&self) -> FileId {
        FileId::new(ROOT_INO, 1)
    }

    fn lookup(
        &self,
        parent: FileId,
        name: &str,
    ) -> Result<Option<FileId>, TalusError> {
        let inner = self.inner.lock().unwrap();
        let dir = inner.objects.get(&parent).ok_or(TalusError::NotFound)?;
        if dir.attrs.kind != ObjectKind::Directory {
            return Err(TalusError::NotDirectory);
        }
        Ok(dir.children.get(name).copied())
    }

    fn attrs(&self, id: FileId) -> Result<ObjectAttrs, TalusError> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&id)
            .map(|o| o.attrs)
            .ok_or(TalusError::NotFound)
    }

    fn create(
        &self,
        _txn: &Txn,
        parent: FileId,
        name: &str,
        kind: ObjectKind,
        mode: u32,
    ) -> Result<FileId, TalusError> {
        let mut inner = self.inner.lock().unwrap();
        let dir = inner.objects.get(&parent).ok_or(TalusError::NotFound)?;
        if dir.attrs.kind != ObjectKind::Directory {
            return Err(TalusError::NotDirectory);
        }
        if dir.children.contains_key(name) {
            return Err(TalusError::Exists);
        }
        inner.next_ino += 1;
        let id = FileId::new(inner.next_ino, 1);
        let nlink = match kind {
            ObjectKind::Directory => 2,
            ObjectKind::File => 1,
        };
        inner.objects.insert(
            id,
            Object {
                attrs: ObjectAttrs {
                    id,
                    kind,
                    mode,
                    uid: 0,
                    gid: 0,
                    size: 0,
                    mtime: 0,
                    nlink,
                },
                children: BTreeMap::new(),
                parent,
            },
        );
        let dir = inner.objects.get_mut(&parent).unwrap();
        dir.children.insert(name.to_string(), id);
        if kind == ObjectKind::Directory {
            dir.attrs.nlink += 1;
        }
        Ok(id)
    }

    fn link(
        &self,
        _txn: &Txn,
        source: FileId,
        parent: FileId,
        name: &str,
    ) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        {
            let src = inner.objects.get(&source).ok_or(TalusError::NotFound)?;
            if src.attrs.kind == ObjectKind::Directory {
                return Err(TalusError::IsDirectory);
            }
            let dir =
                inner.objects.get(&parent).ok_or(TalusError::NotFound)?;
            if dir.attrs.kind != ObjectKind::Directory {
                return Err(TalusError::NotDirectory);
            }
            if dir.children.contains_key(name) {
                return Err(TalusError::Exists);
            }
        }
        inner
            .objects
            .get_mut(&parent)
            .unwrap()
            .children
            .insert(name.to_string(), source);
        inner.objects.get_mut(&source).unwrap().attrs.nlink += 1;
        Ok(())
    }

    fn unlink(
        &self,
        _txn: &Txn,
        parent: FileId,
        name: &str,
    ) -> Result<UnlinkOutcome, TalusError> {
        let mut inner = self.inner.lock().unwrap();
        let id = {
            let dir =
                inner.objects.get(&parent).ok_or(TalusError::NotFound)?;
            *dir.children.get(name).ok_or(TalusError::NotFound)?
        };
        let (kind, empty) = {
            let obj = inner.objects.get(&id).ok_or(TalusError::NotFound)?;
            (obj.attrs.kind, obj.children.is_empty())
        };
        if kind == ObjectKind::Directory && !empty {
            return Err(TalusError::NotEmpty);
        }

        let dir = inner.objects.get_mut(&parent).unwrap();
        dir.children.remove(name);
        if kind == ObjectKind::Directory {
            dir.attrs.nlink -= 1;
        }
        let obj = inner.objects.get_mut(&id).unwrap();
        obj.attrs.nlink = obj.attrs.nlink.saturating_sub(match kind {
            ObjectKind::Directory => 2,
            ObjectKind::File => 1,
        });
        Ok(UnlinkOutcome {
            id,
            kind,
            nlink_now: obj.attrs.nlink,
            blocks: obj.attrs.size / 512,
        })
    }

    fn rename_entry(
        &self,
        _txn: &Txn,
        src_parent: FileId,
        src_name: &str,
        dst_parent: FileId,
        dst_name: &str,
    ) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        let id = {
            let dir = inner
                .objects
                .get(&src_parent)
                .ok_or(TalusError::NotFound)?;
            *dir.children.get(src_name).ok_or(TalusError::NotFound)?
        };
        {
            let dst = inner
                .objects
                .get(&dst_parent)
                .ok_or(TalusError::NotFound)?;
            if dst.attrs.kind != ObjectKind::Directory {
                return Err(TalusError::NotDirectory);
            }
            if dst.children.contains_key(dst_name) {
                return Err(TalusError::Exists);
            }
        }
        let kind = inner.objects.get(&id).unwrap().attrs.kind;
        let src = inner.objects.get_mut(&src_parent).unwrap();
        src.children.remove(src_name);
        if kind == ObjectKind::Directory {
            src.attrs.nlink -= 1;
        }
        let dst = inner.objects.get_mut(&dst_parent).unwrap();
        dst.children.insert(dst_name.to_string(), id);
        if kind == ObjectKind::Directory {
            dst.attrs.nlink += 1;
        }
        inner.objects.get_mut(&id).unwrap().parent = dst_parent;
        Ok(())
    }

    fn set_attributes(
        &self,
        _txn: &Txn,
        id: FileId,
        attrs: SetAttrs,
    ) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner.objects.get_mut(&id).ok_or(TalusError::NotFound)?;
        if let Some(mode) = attrs.mode {
            obj.attrs.mode = mode;
        }
        if let Some(uid) = attrs.uid {
            obj.attrs.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            obj.attrs.gid = gid;
        }
        if let Some(size) = attrs.size {
            obj.attrs.size = size;
        }
        if let Some(mtime) = attrs.mtime {
            obj.attrs.mtime = mtime;
        }
        Ok(())
    }

    fn move_to_pending(
        &self,
        _txn: &Txn,
        id: FileId,
    ) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.objects.contains_key(&id) {
            return Err(TalusError::NotFound);
        }
        inner.pending.insert(id);
        Ok(())
    }

    fn destroy(
        &self,
        _txn: &Txn,
        id: FileId,
    ) -> Result<Option<LayoutHint>, TalusError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&id);
        let obj = inner.objects.remove(&id).ok_or(TalusError::NotFound)?;
        Ok(match obj.attrs.kind {
            ObjectKind::File => Some(LayoutHint {
                id,
                blocks: obj.attrs.size / 512,
            }),
            ObjectKind::Directory => None,
        })
    }

    fn is_pending(&self, id: FileId) -> bool {
        self.inner.lock().unwrap().pending.contains(&id)
    }

    fn is_ancestor(
        &self,
        ancestor: FileId,
        descendant: FileId,
    ) -> Result<bool, TalusError> {
        let inner = self.inner.lock().unwrap();
        let mut cur = descendant;
        loop {
            if cur == ancestor {
                return Ok(true);
            }
            let obj = inner.objects.get(&cur).ok_or(TalusError::NotFound)?;
            if obj.parent == cur {
                return Ok(false);
            }
            cur = obj.parent;
        }
    }

    fn statfs(&self) -> Result<StatfsReply, TalusError> {
        let inner = self.inner.lock().unwrap();
        Ok(StatfsReply {
            files: inner.objects.len() as u64,
            files_free: u64::MAX - inner.objects.len() as u64,
            blocks: inner
                .objects
                .values()
                .map(|o| o.attrs.size / 512)
                .sum(),
            blocks_free: u64::MAX,
        })
    }

    fn read_record(
        &self,
        slot: usize,
    ) -> Result<Option<Vec<u8>>, TalusError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(&slot).cloned())
    }

    fn write_record(
        &self,
        _txn: &Txn,
        slot: usize,
        data: &[u8],
    ) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        if data.is_empty() {
            inner.records.remove(&slot);
        } else {
            inner.records.insert(slot, data.to_vec());
        }
        Ok(())
    }

    fn record_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.records.keys().next_back().map(|k| k + 1).unwrap_or(0)
    }
}
