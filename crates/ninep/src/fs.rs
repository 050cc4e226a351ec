//! A fid table over a host directory tree.
//!
//! Every fid resolves to a path under the export root. Walks never leave the
//! root: `..` at the root stays at the root, names containing `/` are
//! rejected, and symlinks are never followed. A walk may end on a symlink so
//! it can be read with `Treadlink`, but it cannot pass through one, and a
//! symlink fid cannot be opened, listed or used as a directory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::errors::errno;
use crate::fcall::{self, Attr, DirEntry, Qid, Rmessage, StatFs, Tmessage};

const O_ACCMODE: u32 = 0o3;
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

/// Lock status "success" in `Rlock`.
const LOCK_SUCCESS: u8 = 0;
/// Lock type "unlocked" in `Rgetlock`.
const F_UNLCK: u8 = 2;

struct Fid {
    path: PathBuf,
    file: Option<File>,
    dir_listing: Option<Vec<DirEntry>>,
}

impl Fid {
    fn at(path: PathBuf) -> Self {
        Fid {
            path,
            file: None,
            dir_listing: None,
        }
    }
}

pub(crate) struct Session {
    root: PathBuf,
    iounit: u32,
    fids: HashMap<u32, Fid>,
}

fn io_err(e: io::Error) -> Rmessage {
    Rmessage::Lerror { ecode: errno(&e) }
}

fn raw(code: i32) -> Rmessage {
    Rmessage::Lerror { ecode: code as u32 }
}

pub(crate) fn qid_for(meta: &fs::Metadata) -> Qid {
    let ft = meta.file_type();
    let typ = if ft.is_dir() {
        Qid::QTDIR
    } else if ft.is_symlink() {
        Qid::QTSYMLINK
    } else {
        Qid::QTFILE
    };
    Qid {
        typ,
        version: (meta.mtime() as u32) ^ (meta.mtime_nsec() as u32),
        path: meta.ino(),
    }
}

fn dirent_type(meta: &fs::Metadata) -> u8 {
    let ft = meta.file_type();
    if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else {
        libc::DT_REG
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).map_or(false, |m| m.file_type().is_symlink())
}

fn refuse_symlink(path: &Path) -> Result<(), Rmessage> {
    if is_symlink(path) {
        return Err(raw(libc::ELOOP));
    }
    Ok(())
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

impl Session {
    pub(crate) fn new(root: PathBuf, iounit: u32) -> Self {
        Session {
            root,
            iounit,
            fids: HashMap::new(),
        }
    }

    pub(crate) fn fid_count(&self) -> usize {
        self.fids.len()
    }

    fn path(&self, fid: u32) -> Result<&Path, Rmessage> {
        self.fids
            .get(&fid)
            .map(|f| f.path.as_path())
            .ok_or_else(|| raw(libc::EBADF))
    }

    fn child(&self, dfid: u32, name: &str) -> Result<PathBuf, Rmessage> {
        if !valid_name(name) {
            return Err(raw(libc::EINVAL));
        }
        let dir = self.path(dfid)?;
        refuse_symlink(dir)?;
        Ok(dir.join(name))
    }

    /// Answers one request. Version negotiation is handled by the server.
    pub(crate) fn handle(&mut self, msg: Tmessage) -> Rmessage {
        trace!(?msg, "9p request");
        match self.dispatch(msg) {
            Ok(r) => r,
            Err(r) => r,
        }
    }

    fn dispatch(&mut self, msg: Tmessage) -> Result<Rmessage, Rmessage> {
        match msg {
            Tmessage::Auth { .. } => Err(raw(libc::EOPNOTSUPP)),
            Tmessage::Attach { fid, .. } => {
                let meta = fs::metadata(&self.root).map_err(io_err)?;
                self.fids.insert(fid, Fid::at(self.root.clone()));
                Ok(Rmessage::Attach {
                    qid: qid_for(&meta),
                })
            }
            Tmessage::Flush { .. } => Ok(Rmessage::Flush),
            Tmessage::Walk {
                fid,
                newfid,
                wnames,
            } => self.walk(fid, newfid, wnames),
            Tmessage::Lopen { fid, flags } => {
                let iounit = self.iounit;
                let entry = self.fids.get_mut(&fid).ok_or_else(|| raw(libc::EBADF))?;
                let meta = fs::symlink_metadata(&entry.path).map_err(io_err)?;
                if !meta.is_dir() {
                    entry.file = Some(open_options(flags).open(&entry.path).map_err(io_err)?);
                }
                Ok(Rmessage::Lopen {
                    qid: qid_for(&meta),
                    iounit,
                })
            }
            Tmessage::Lcreate {
                fid,
                name,
                flags,
                mode,
                ..
            } => {
                let path = self.child(fid, &name)?;
                let file = open_options(flags | O_CREAT)
                    .mode(mode & 0o7777)
                    .open(&path)
                    .map_err(io_err)?;
                let meta = file.metadata().map_err(io_err)?;
                let entry = self.fids.get_mut(&fid).ok_or_else(|| raw(libc::EBADF))?;
                entry.path = path;
                entry.file = Some(file);
                Ok(Rmessage::Lcreate {
                    qid: qid_for(&meta),
                    iounit: self.iounit,
                })
            }
            Tmessage::Read { fid, offset, count } => {
                let entry = self.fids.get_mut(&fid).ok_or_else(|| raw(libc::EBADF))?;
                let file = entry.file.as_mut().ok_or_else(|| raw(libc::EBADF))?;
                file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
                let mut data = Vec::with_capacity(count as usize);
                file.take(count as u64)
                    .read_to_end(&mut data)
                    .map_err(io_err)?;
                Ok(Rmessage::Read { data })
            }
            Tmessage::Write { fid, offset, data } => {
                let entry = self.fids.get_mut(&fid).ok_or_else(|| raw(libc::EBADF))?;
                let file = entry.file.as_mut().ok_or_else(|| raw(libc::EBADF))?;
                file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
                file.write_all(&data).map_err(io_err)?;
                Ok(Rmessage::Write {
                    count: data.len() as u32,
                })
            }
            Tmessage::Clunk { fid } => {
                self.fids.remove(&fid).ok_or_else(|| raw(libc::EBADF))?;
                Ok(Rmessage::Clunk)
            }
            Tmessage::Remove { fid } => {
                let entry = self.fids.remove(&fid).ok_or_else(|| raw(libc::EBADF))?;
                if entry.path == self.root {
                    return Err(raw(libc::EBUSY));
                }
                let meta = fs::symlink_metadata(&entry.path).map_err(io_err)?;
                if meta.is_dir() {
                    fs::remove_dir(&entry.path).map_err(io_err)?;
                } else {
                    fs::remove_file(&entry.path).map_err(io_err)?;
                }
                Ok(Rmessage::Remove)
            }
            Tmessage::Statfs { fid } => {
                let path = self.path(fid)?;
                refuse_symlink(path)?;
                statfs(path)
            }
            Tmessage::Getattr { fid, .. } => {
                let meta = fs::symlink_metadata(self.path(fid)?).map_err(io_err)?;
                Ok(Rmessage::Getattr(attr_for(&meta)))
            }
            Tmessage::Setattr {
                fid,
                valid,
                mode,
                size,
                ..
            } => {
                let path = self.path(fid)?.to_path_buf();
                refuse_symlink(&path)?;
                if valid & fcall::setattr::MODE != 0 {
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(io_err)?;
                }
                if valid & fcall::setattr::SIZE != 0 {
                    OpenOptions::new()
                        .write(true)
                        .custom_flags(libc::O_NOFOLLOW)
                        .open(&path)
                        .and_then(|f| f.set_len(size))
                        .map_err(io_err)?;
                }
                // Ownership and timestamps are left to the host.
                Ok(Rmessage::Setattr)
            }
            Tmessage::Readdir { fid, offset, count } => self.readdir(fid, offset, count),
            Tmessage::Fsync { fid } => {
                if let Some(file) = self.fids.get(&fid).and_then(|f| f.file.as_ref()) {
                    file.sync_all().map_err(io_err)?;
                }
                Ok(Rmessage::Fsync)
            }
            Tmessage::Mkdir {
                dfid, name, mode, ..
            } => {
                let path = self.child(dfid, &name)?;
                fs::create_dir(&path).map_err(io_err)?;
                fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(io_err)?;
                let meta = fs::metadata(&path).map_err(io_err)?;
                Ok(Rmessage::Mkdir {
                    qid: qid_for(&meta),
                })
            }
            Tmessage::Symlink {
                fid, name, target, ..
            } => {
                let path = self.child(fid, &name)?;
                std::os::unix::fs::symlink(&target, &path).map_err(io_err)?;
                let meta = fs::symlink_metadata(&path).map_err(io_err)?;
                Ok(Rmessage::Symlink {
                    qid: qid_for(&meta),
                })
            }
            Tmessage::Readlink { fid } => {
                let target = fs::read_link(self.path(fid)?).map_err(io_err)?;
                Ok(Rmessage::Readlink {
                    target: target.to_string_lossy().into_owned(),
                })
            }
            Tmessage::Link { dfid, fid, name } => {
                let to = self.child(dfid, &name)?;
                fs::hard_link(self.path(fid)?, to).map_err(io_err)?;
                Ok(Rmessage::Link)
            }
            Tmessage::Rename { fid, dfid, name } => {
                let to = self.child(dfid, &name)?;
                let from = self.path(fid)?.to_path_buf();
                fs::rename(&from, &to).map_err(io_err)?;
                if let Some(entry) = self.fids.get_mut(&fid) {
                    entry.path = to;
                }
                Ok(Rmessage::Rename)
            }
            Tmessage::Renameat {
                olddirfid,
                oldname,
                newdirfid,
                newname,
            } => {
                let from = self.child(olddirfid, &oldname)?;
                let to = self.child(newdirfid, &newname)?;
                fs::rename(from, to).map_err(io_err)?;
                Ok(Rmessage::Renameat)
            }
            Tmessage::Unlinkat {
                dirfid,
                name,
                flags,
            } => {
                let path = self.child(dirfid, &name)?;
                if flags & fcall::AT_REMOVEDIR != 0 {
                    fs::remove_dir(path).map_err(io_err)?;
                } else {
                    fs::remove_file(path).map_err(io_err)?;
                }
                Ok(Rmessage::Unlinkat)
            }
            Tmessage::Lock { fid } => {
                self.path(fid)?;
                Ok(Rmessage::Lock {
                    status: LOCK_SUCCESS,
                })
            }
            Tmessage::Getlock {
                fid,
                start,
                length,
                proc_id,
                client_id,
                ..
            } => {
                self.path(fid)?;
                Ok(Rmessage::Getlock {
                    typ: F_UNLCK,
                    start,
                    length,
                    proc_id,
                    client_id,
                })
            }
            Tmessage::Xattrwalk { .. } | Tmessage::Xattrcreate { .. } | Tmessage::Mknod { .. } => {
                Err(raw(libc::EOPNOTSUPP))
            }
            Tmessage::Version { .. } => Err(raw(libc::EINVAL)),
        }
    }

    fn walk(&mut self, fid: u32, newfid: u32, wnames: Vec<String>) -> Result<Rmessage, Rmessage> {
        let start = self.path(fid)?.to_path_buf();
        if newfid != fid && self.fids.contains_key(&newfid) {
            return Err(raw(libc::EBADF));
        }
        let mut current = start;
        let mut qids = Vec::with_capacity(wnames.len());
        for name in &wnames {
            let next = match name.as_str() {
                ".." => {
                    if current == self.root {
                        current.clone()
                    } else {
                        current
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_else(|| self.root.clone())
                    }
                }
                n if valid_name(n) => current.join(n),
                _ => return Err(raw(libc::EINVAL)),
            };
            // Only the last element may be a symlink.
            if is_symlink(&current) {
                if qids.is_empty() {
                    return Err(raw(libc::ELOOP));
                }
                return Ok(Rmessage::Walk { qids });
            }
            match fs::symlink_metadata(&next) {
                Ok(meta) => {
                    qids.push(qid_for(&meta));
                    current = next;
                }
                Err(e) if qids.is_empty() => return Err(io_err(e)),
                // A partial walk reports how far it got and leaves newfid unset
                Err(_) => return Ok(Rmessage::Walk { qids }),
            }
        }
        self.fids.insert(newfid, Fid::at(current));
        Ok(Rmessage::Walk { qids })
    }

    fn readdir(&mut self, fid: u32, offset: u64, count: u32) -> Result<Rmessage, Rmessage> {
        let entry = self.fids.get_mut(&fid).ok_or_else(|| raw(libc::EBADF))?;
        refuse_symlink(&entry.path)?;
        if offset == 0 || entry.dir_listing.is_none() {
            entry.dir_listing = Some(list_dir(&entry.path).map_err(io_err)?);
        }
        let listing = entry.dir_listing.as_ref().map(Vec::as_slice).unwrap_or(&[]);
        let mut data = Vec::new();
        for d in listing.iter().skip(offset as usize) {
            if !fcall::push_dirent(&mut data, d, count as usize) {
                break;
            }
        }
        Ok(Rmessage::Readdir { data })
    }
}

fn open_options(flags: u32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.custom_flags(libc::O_NOFOLLOW);
    match flags & O_ACCMODE {
        O_WRONLY => {
            opts.write(true);
        }
        O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if flags & O_APPEND != 0 {
        opts.append(true);
    }
    if flags & O_TRUNC != 0 {
        opts.truncate(true);
    }
    if flags & O_CREAT != 0 {
        if flags & O_EXCL != 0 {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
        // create() requires write access
        if flags & O_ACCMODE == 0 {
            opts.write(true);
        }
    }
    opts
}

fn list_dir(path: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let here = fs::metadata(path)?;
    let parent = path
        .parent()
        .and_then(|p| fs::metadata(p).ok())
        .unwrap_or_else(|| here.clone());
    for (name, meta) in [(".", &here), ("..", &parent)] {
        entries.push(DirEntry {
            qid: qid_for(meta),
            offset: 0,
            typ: libc::DT_DIR,
            name: name.to_owned(),
        });
    }
    let mut children: Vec<(String, fs::Metadata)> = Vec::new();
    for child in fs::read_dir(path)? {
        let child = child?;
        let meta = match child.path().symlink_metadata() {
            Ok(m) => m,
            // Raced with a delete
            Err(_) => continue,
        };
        children.push((child.file_name().to_string_lossy().into_owned(), meta));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, meta) in children {
        entries.push(DirEntry {
            qid: qid_for(&meta),
            offset: 0,
            typ: dirent_type(&meta),
            name,
        });
    }
    for (i, e) in entries.iter_mut().enumerate() {
        e.offset = i as u64 + 1;
    }
    Ok(entries)
}

fn attr_for(meta: &fs::Metadata) -> Attr {
    Attr {
        valid: fcall::GETATTR_BASIC,
        qid: qid_for(meta),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink(),
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: (meta.atime() as u64, meta.atime_nsec() as u64),
        mtime: (meta.mtime() as u64, meta.mtime_nsec() as u64),
        ctime: (meta.ctime() as u64, meta.ctime_nsec() as u64),
    }
}

fn statfs(path: &Path) -> Result<Rmessage, Rmessage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| raw(libc::EINVAL))?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL terminated and st is a valid out pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return Err(io_err(io::Error::last_os_error()));
    }
    Ok(Rmessage::Statfs(StatFs {
        // V9FS_MAGIC
        typ: 0x0102_1997,
        bsize: st.f_bsize as u32,
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
        files: st.f_files as u64,
        ffree: st.f_ffree as u64,
        fsid: st.f_fsid as u64,
        namelen: st.f_namemax as u32,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn attach(dir: &Path) -> Session {
        let mut s = Session::new(dir.to_path_buf(), 8192);
        let r = s.handle(Tmessage::Attach {
            fid: 0,
            afid: fcall::NOFID,
            uname: "docker".into(),
            aname: String::new(),
            n_uname: 1000,
        });
        assert!(matches!(r, Rmessage::Attach { .. }));
        s
    }

    #[test]
    fn walking_up_from_the_root_stays_put() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = attach(dir.path());
        let r = s.handle(Tmessage::Walk {
            fid: 0,
            newfid: 1,
            wnames: vec!["..".into(), "..".into()],
        });
        assert!(matches!(r, Rmessage::Walk { ref qids } if qids.len() == 2));
        assert_eq!(s.path(1).unwrap(), dir.path());
    }

    #[test]
    fn slashes_in_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = attach(dir.path());
        let r = s.handle(Tmessage::Walk {
            fid: 0,
            newfid: 1,
            wnames: vec!["a/../../etc".into()],
        });
        assert_eq!(
            r,
            Rmessage::Lerror {
                ecode: libc::EINVAL as u32
            }
        );
    }

    fn walk(s: &mut Session, newfid: u32, names: &[&str]) -> Rmessage {
        s.handle(Tmessage::Walk {
            fid: 0,
            newfid,
            wnames: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    const ELOOP: Rmessage = Rmessage::Lerror {
        ecode: libc::ELOOP as u32,
    };

    #[test]
    fn symlinks_do_not_lead_out_of_the_export() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret"), b"host only").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut s = attach(dir.path());

        // A guest creates a link pointing out of the export.
        let r = s.handle(Tmessage::Symlink {
            fid: 0,
            name: "escape".into(),
            target: outside.path().display().to_string(),
            gid: 0,
        });
        assert!(matches!(r, Rmessage::Symlink { .. }), "{:?}", r);

        // Walking through it stops at the link.
        let r = walk(&mut s, 1, &["escape", "secret"]);
        assert!(matches!(r, Rmessage::Walk { ref qids } if qids.len() == 1), "{:?}", r);
        assert!(s.path(1).is_err());

        // The link itself can be reached and read, but not used as a directory.
        assert!(matches!(walk(&mut s, 2, &["escape"]), Rmessage::Walk { .. }));
        assert!(matches!(
            s.handle(Tmessage::Readlink { fid: 2 }),
            Rmessage::Readlink { .. }
        ));
        assert_eq!(
            s.handle(Tmessage::Readdir {
                fid: 2,
                offset: 0,
                count: 8192
            }),
            ELOOP
        );
        assert_eq!(
            s.handle(Tmessage::Lcreate {
                fid: 2,
                name: "planted".into(),
                flags: O_RDWR,
                mode: 0o644,
                gid: 0,
            }),
            ELOOP
        );
        assert!(!outside.path().join("planted").exists());
        assert!(matches!(walk(&mut s, 3, &["escape", ".."]), Rmessage::Walk { ref qids } if qids.len() == 1));
    }

    #[test]
    fn symlinked_files_are_not_opened() {
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret");
        fs::write(&secret, b"host only").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&secret, dir.path().join("link")).unwrap();
        let mut s = attach(dir.path());

        assert!(matches!(walk(&mut s, 1, &["link"]), Rmessage::Walk { .. }));
        assert_eq!(s.handle(Tmessage::Lopen { fid: 1, flags: 0 }), ELOOP);
        let r = s.handle(Tmessage::Read {
            fid: 1,
            offset: 0,
            count: 64,
        });
        assert!(matches!(r, Rmessage::Lerror { .. }));
    }

    #[test]
    fn partial_walk_leaves_newfid_unset() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        let mut s = attach(dir.path());
        let r = s.handle(Tmessage::Walk {
            fid: 0,
            newfid: 5,
            wnames: vec!["a".into(), "missing".into()],
        });
        assert!(matches!(r, Rmessage::Walk { ref qids } if qids.len() == 1));
        assert!(s.path(5).is_err());
    }

    #[test]
    fn create_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = attach(dir.path());
        s.handle(Tmessage::Walk {
            fid: 0,
            newfid: 1,
            wnames: vec![],
        });
        let r = s.handle(Tmessage::Lcreate {
            fid: 1,
            name: "hello.txt".into(),
            flags: O_RDWR,
            mode: 0o644,
            gid: 0,
        });
        assert!(matches!(r, Rmessage::Lcreate { .. }));
        let r = s.handle(Tmessage::Write {
            fid: 1,
            offset: 0,
            data: b"hello 9p".to_vec(),
        });
        assert_eq!(r, Rmessage::Write { count: 8 });
        let r = s.handle(Tmessage::Read {
            fid: 1,
            offset: 6,
            count: 100,
        });
        assert_eq!(
            r,
            Rmessage::Read {
                data: b"9p".to_vec()
            }
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "hello 9p"
        );
    }

    #[test]
    fn readdir_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        for n in &["a", "b", "c"] {
            fs::write(dir.path().join(n), n).unwrap();
        }
        let mut s = attach(dir.path());
        s.handle(Tmessage::Lopen { fid: 0, flags: 0 });
        let first = match s.handle(Tmessage::Readdir {
            fid: 0,
            offset: 0,
            count: 8192,
        }) {
            Rmessage::Readdir { data } => fcall::parse_dirents(&data).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let names: Vec<_> = first.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "b", "c"]);

        let rest = match s.handle(Tmessage::Readdir {
            fid: 0,
            offset: first[2].offset,
            count: 8192,
        }) {
            Rmessage::Readdir { data } => fcall::parse_dirents(&data).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let names: Vec<_> = rest.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn clunk_releases_the_fid() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = attach(dir.path());
        assert_eq!(s.fid_count(), 1);
        assert_eq!(s.handle(Tmessage::Clunk { fid: 0 }), Rmessage::Clunk);
        assert_eq!(s.fid_count(), 0);
        assert_eq!(
            s.handle(Tmessage::Clunk { fid: 0 }),
            Rmessage::Lerror {
                ecode: libc::EBADF as u32
            }
        );
    }
}
