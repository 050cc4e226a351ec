//! 9P2000.L message types and their little-endian wire encoding.
//!
//! Every message is `size[4] type[1] tag[2] body`, where `size` counts the
//! whole message including itself.

use crate::errors::Error;

/// Tag used by `Tversion`, which is sent before any tags are in flight.
pub const NOTAG: u16 = 0xffff;
/// Fid value meaning "no fid", used for `afid` in `Tattach`.
pub const NOFID: u32 = 0xffff_ffff;

/// `Tgetattr` request mask asking for every basic field.
pub const GETATTR_BASIC: u64 = 0x0000_07ff;

/// `Tsetattr` valid bits
pub mod setattr {
    /// Change the permission bits
    pub const MODE: u32 = 0x0000_0001;
    /// Change the owner
    pub const UID: u32 = 0x0000_0002;
    /// Change the group
    pub const GID: u32 = 0x0000_0004;
    /// Truncate or extend
    pub const SIZE: u32 = 0x0000_0008;
}

/// `Tunlinkat` flag removing a directory instead of a file.
pub const AT_REMOVEDIR: u32 = 0x200;

mod kind {
    pub const RLERROR: u8 = 7;
    pub const TSTATFS: u8 = 8;
    pub const TLOPEN: u8 = 12;
    pub const TLCREATE: u8 = 14;
    pub const TSYMLINK: u8 = 16;
    pub const TMKNOD: u8 = 18;
    pub const TRENAME: u8 = 20;
    pub const TREADLINK: u8 = 22;
    pub const TGETATTR: u8 = 24;
    pub const TSETATTR: u8 = 26;
    pub const TXATTRWALK: u8 = 30;
    pub const TXATTRCREATE: u8 = 32;
    pub const TREADDIR: u8 = 40;
    pub const TFSYNC: u8 = 50;
    pub const TLOCK: u8 = 52;
    pub const TGETLOCK: u8 = 54;
    pub const TLINK: u8 = 70;
    pub const TMKDIR: u8 = 72;
    pub const TRENAMEAT: u8 = 74;
    pub const TUNLINKAT: u8 = 76;
    pub const TVERSION: u8 = 100;
    pub const TAUTH: u8 = 102;
    pub const TATTACH: u8 = 104;
    pub const TFLUSH: u8 = 108;
    pub const TWALK: u8 = 110;
    pub const TREAD: u8 = 116;
    pub const TWRITE: u8 = 118;
    pub const TCLUNK: u8 = 120;
    pub const TREMOVE: u8 = 122;
}

/// Server-unique identity of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Qid {
    /// `QTDIR`, `QTSYMLINK` or `QTFILE`
    pub typ: u8,
    /// Changes whenever the file is modified
    pub version: u32,
    /// Unique per file; the inode number on Unix hosts
    pub path: u64,
}

impl Qid {
    /// Qid type bit for directories
    pub const QTDIR: u8 = 0x80;
    /// Qid type bit for symbolic links
    pub const QTSYMLINK: u8 = 0x02;
    /// Qid type for regular files
    pub const QTFILE: u8 = 0x00;
}

/// File attributes returned by `Rgetattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attr {
    /// Which fields are valid
    pub valid: u64,
    /// Identity
    pub qid: Qid,
    /// Type and permission bits
    pub mode: u32,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Hard link count
    pub nlink: u64,
    /// Device id for special files
    pub rdev: u64,
    /// Size in bytes
    pub size: u64,
    /// Preferred I/O block size
    pub blksize: u64,
    /// 512 byte blocks allocated
    pub blocks: u64,
    /// Access time (seconds, nanoseconds)
    pub atime: (u64, u64),
    /// Modification time
    pub mtime: (u64, u64),
    /// Status change time
    pub ctime: (u64, u64),
}

/// Filesystem statistics returned by `Rstatfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFs {
    /// Filesystem type magic
    pub typ: u32,
    /// Block size
    pub bsize: u32,
    /// Total blocks
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to unprivileged users
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub ffree: u64,
    /// Filesystem id
    pub fsid: u64,
    /// Maximum filename length
    pub namelen: u32,
}

/// One entry of an `Rreaddir` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Identity of the entry
    pub qid: Qid,
    /// Offset to pass in the next `Treaddir` to resume after this entry
    pub offset: u64,
    /// `DT_*` type
    pub typ: u8,
    /// Entry name
    pub name: String,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Tmessage {
    Version { msize: u32, version: String },
    Auth { afid: u32, uname: String, aname: String },
    Attach { fid: u32, afid: u32, uname: String, aname: String, n_uname: u32 },
    Flush { oldtag: u16 },
    Walk { fid: u32, newfid: u32, wnames: Vec<String> },
    Lopen { fid: u32, flags: u32 },
    Lcreate { fid: u32, name: String, flags: u32, mode: u32, gid: u32 },
    Read { fid: u32, offset: u64, count: u32 },
    Write { fid: u32, offset: u64, data: Vec<u8> },
    Clunk { fid: u32 },
    Remove { fid: u32 },
    Statfs { fid: u32 },
    Getattr { fid: u32, request_mask: u64 },
    Setattr { fid: u32, valid: u32, mode: u32, uid: u32, gid: u32, size: u64 },
    Readdir { fid: u32, offset: u64, count: u32 },
    Fsync { fid: u32 },
    Mkdir { dfid: u32, name: String, mode: u32, gid: u32 },
    Symlink { fid: u32, name: String, target: String, gid: u32 },
    Readlink { fid: u32 },
    Link { dfid: u32, fid: u32, name: String },
    Rename { fid: u32, dfid: u32, name: String },
    Renameat { olddirfid: u32, oldname: String, newdirfid: u32, newname: String },
    Unlinkat { dirfid: u32, name: String, flags: u32 },
    Lock { fid: u32 },
    Getlock { fid: u32, typ: u8, start: u64, length: u64, proc_id: u32, client_id: String },
    Xattrwalk { fid: u32, newfid: u32, name: String },
    Xattrcreate { fid: u32 },
    Mknod { dfid: u32 },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Rmessage {
    Lerror { ecode: u32 },
    Version { msize: u32, version: String },
    Attach { qid: Qid },
    Flush,
    Walk { qids: Vec<Qid> },
    Lopen { qid: Qid, iounit: u32 },
    Lcreate { qid: Qid, iounit: u32 },
    Read { data: Vec<u8> },
    Write { count: u32 },
    Clunk,
    Remove,
    Statfs(StatFs),
    Getattr(Attr),
    Setattr,
    Readdir { data: Vec<u8> },
    Fsync,
    Mkdir { qid: Qid },
    Symlink { qid: Qid },
    Readlink { target: String },
    Link,
    Rename,
    Renameat,
    Unlinkat,
    Lock { status: u8 },
    Getlock { typ: u8, start: u64, length: u64, proc_id: u32, client_id: String },
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], Error> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(Error::Truncated {
                field,
                needed: n - remaining,
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, Error> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, Error> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, Error> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, Error> {
        let b = self.take(8, field)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn string(&mut self, field: &'static str) -> Result<String, Error> {
        let len = self.u16(field)? as usize;
        let b = self.take(len, field)?;
        String::from_utf8(b.to_vec()).map_err(|_| Error::InvalidString)
    }

    fn qid(&mut self) -> Result<Qid, Error> {
        Ok(Qid {
            typ: self.u8("qid.type")?,
            version: self.u32("qid.version")?,
            path: self.u64("qid.path")?,
        })
    }

    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn start(typ: u8, tag: u16) -> Self {
        let mut w = Writer::default();
        w.u32(0);
        w.u8(typ);
        w.u16(tag);
        w
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn qid(&mut self, q: &Qid) {
        self.u8(q.typ);
        self.u32(q.version);
        self.u64(q.path);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

/// Appends one directory entry to an `Rreaddir` payload. Returns false, and
/// leaves `buf` untouched, when the entry would push it past `limit` bytes.
pub fn push_dirent(buf: &mut Vec<u8>, entry: &DirEntry, limit: usize) -> bool {
    let needed = 13 + 8 + 1 + 2 + entry.name.len();
    if buf.len() + needed > limit {
        return false;
    }
    let mut w = Writer { buf: std::mem::take(buf) };
    w.qid(&entry.qid);
    w.u64(entry.offset);
    w.u8(entry.typ);
    w.string(&entry.name);
    *buf = w.buf;
    true
}

/// Splits an `Rreaddir` payload back into entries.
pub fn parse_dirents(data: &[u8]) -> Result<Vec<DirEntry>, Error> {
    let mut r = Reader::new(data);
    let mut entries = Vec::new();
    while r.pos < data.len() {
        entries.push(DirEntry {
            qid: r.qid()?,
            offset: r.u64("dirent.offset")?,
            typ: r.u8("dirent.type")?,
            name: r.string("dirent.name")?,
        });
    }
    Ok(entries)
}

impl Tmessage {
    /// Decodes a complete message, including its size header. Returns the tag
    /// alongside the message.
    pub fn decode(buf: &[u8]) -> Result<(u16, Tmessage), Error> {
        let mut r = Reader::new(buf);
        r.u32("size")?;
        let typ = r.u8("type")?;
        let tag = r.u16("tag")?;
        use kind::*;
        let msg = match typ {
            TVERSION => Tmessage::Version {
                msize: r.u32("msize")?,
                version: r.string("version")?,
            },
            TAUTH => Tmessage::Auth {
                afid: r.u32("afid")?,
                uname: r.string("uname")?,
                aname: r.string("aname")?,
            },
            TATTACH => Tmessage::Attach {
                fid: r.u32("fid")?,
                afid: r.u32("afid")?,
                uname: r.string("uname")?,
                aname: r.string("aname")?,
                n_uname: r.u32("n_uname")?,
            },
            TFLUSH => Tmessage::Flush {
                oldtag: r.u16("oldtag")?,
            },
            TWALK => {
                let fid = r.u32("fid")?;
                let newfid = r.u32("newfid")?;
                let n = r.u16("nwname")?;
                let mut wnames = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    wnames.push(r.string("wname")?);
                }
                Tmessage::Walk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            TLOPEN => Tmessage::Lopen {
                fid: r.u32("fid")?,
                flags: r.u32("flags")?,
            },
            TLCREATE => Tmessage::Lcreate {
                fid: r.u32("fid")?,
                name: r.string("name")?,
                flags: r.u32("flags")?,
                mode: r.u32("mode")?,
                gid: r.u32("gid")?,
            },
            TREAD => Tmessage::Read {
                fid: r.u32("fid")?,
                offset: r.u64("offset")?,
                count: r.u32("count")?,
            },
            TWRITE => {
                let fid = r.u32("fid")?;
                let offset = r.u64("offset")?;
                let count = r.u32("count")? as usize;
                let data = r.take(count, "data")?.to_vec();
                Tmessage::Write { fid, offset, data }
            }
            TCLUNK => Tmessage::Clunk { fid: r.u32("fid")? },
            TREMOVE => Tmessage::Remove { fid: r.u32("fid")? },
            TSTATFS => Tmessage::Statfs { fid: r.u32("fid")? },
            TGETATTR => Tmessage::Getattr {
                fid: r.u32("fid")?,
                request_mask: r.u64("request_mask")?,
            },
            TSETATTR => Tmessage::Setattr {
                fid: r.u32("fid")?,
                valid: r.u32("valid")?,
                mode: r.u32("mode")?,
                uid: r.u32("uid")?,
                gid: r.u32("gid")?,
                size: r.u64("size")?,
            },
            TREADDIR => Tmessage::Readdir {
                fid: r.u32("fid")?,
                offset: r.u64("offset")?,
                count: r.u32("count")?,
            },
            TFSYNC => Tmessage::Fsync { fid: r.u32("fid")? },
            TMKDIR => Tmessage::Mkdir {
                dfid: r.u32("dfid")?,
                name: r.string("name")?,
                mode: r.u32("mode")?,
                gid: r.u32("gid")?,
            },
            TSYMLINK => Tmessage::Symlink {
                fid: r.u32("fid")?,
                name: r.string("name")?,
                target: r.string("symtgt")?,
                gid: r.u32("gid")?,
            },
            TREADLINK => Tmessage::Readlink { fid: r.u32("fid")? },
            TLINK => Tmessage::Link {
                dfid: r.u32("dfid")?,
                fid: r.u32("fid")?,
                name: r.string("name")?,
            },
            TRENAME => Tmessage::Rename {
                fid: r.u32("fid")?,
                dfid: r.u32("dfid")?,
                name: r.string("name")?,
            },
            TRENAMEAT => Tmessage::Renameat {
                olddirfid: r.u32("olddirfid")?,
                oldname: r.string("oldname")?,
                newdirfid: r.u32("newdirfid")?,
                newname: r.string("newname")?,
            },
            TUNLINKAT => Tmessage::Unlinkat {
                dirfid: r.u32("dirfid")?,
                name: r.string("name")?,
                flags: r.u32("flags")?,
            },
            TLOCK => {
                let fid = r.u32("fid")?;
                r.rest();
                Tmessage::Lock { fid }
            }
            TGETLOCK => Tmessage::Getlock {
                fid: r.u32("fid")?,
                typ: r.u8("type")?,
                start: r.u64("start")?,
                length: r.u64("length")?,
                proc_id: r.u32("proc_id")?,
                client_id: r.string("client_id")?,
            },
            TXATTRWALK => Tmessage::Xattrwalk {
                fid: r.u32("fid")?,
                newfid: r.u32("newfid")?,
                name: r.string("name")?,
            },
            TXATTRCREATE => {
                let fid = r.u32("fid")?;
                r.rest();
                Tmessage::Xattrcreate { fid }
            }
            TMKNOD => {
                let dfid = r.u32("dfid")?;
                r.rest();
                Tmessage::Mknod { dfid }
            }
            other => return Err(Error::UnknownType(other)),
        };
        Ok((tag, msg))
    }

    /// Encodes a client message. Only the messages a simple client needs are
    /// supported; the rest encode to `None`.
    pub fn encode(&self, tag: u16) -> Option<Vec<u8>> {
        use kind::*;
        let w = match self {
            Tmessage::Version { msize, version } => {
                let mut w = Writer::start(TVERSION, tag);
                w.u32(*msize);
                w.string(version);
                w
            }
            Tmessage::Attach {
                fid,
                afid,
                uname,
                aname,
                n_uname,
            } => {
                let mut w = Writer::start(TATTACH, tag);
                w.u32(*fid);
                w.u32(*afid);
                w.string(uname);
                w.string(aname);
                w.u32(*n_uname);
                w
            }
            Tmessage::Walk {
                fid,
                newfid,
                wnames,
            } => {
                let mut w = Writer::start(TWALK, tag);
                w.u32(*fid);
                w.u32(*newfid);
                w.u16(wnames.len() as u16);
                for n in wnames {
                    w.string(n);
                }
                w
            }
            Tmessage::Lopen { fid, flags } => {
                let mut w = Writer::start(TLOPEN, tag);
                w.u32(*fid);
                w.u32(*flags);
                w
            }
            Tmessage::Lcreate {
                fid,
                name,
                flags,
                mode,
                gid,
            } => {
                let mut w = Writer::start(TLCREATE, tag);
                w.u32(*fid);
                w.string(name);
                w.u32(*flags);
                w.u32(*mode);
                w.u32(*gid);
                w
            }
            Tmessage::Read { fid, offset, count } => {
                let mut w = Writer::start(TREAD, tag);
                w.u32(*fid);
                w.u64(*offset);
                w.u32(*count);
                w
            }
            Tmessage::Write { fid, offset, data } => {
                let mut w = Writer::start(TWRITE, tag);
                w.u32(*fid);
                w.u64(*offset);
                w.u32(data.len() as u32);
                w.buf.extend_from_slice(data);
                w
            }
            Tmessage::Clunk { fid } => {
                let mut w = Writer::start(TCLUNK, tag);
                w.u32(*fid);
                w
            }
            Tmessage::Getattr { fid, request_mask } => {
                let mut w = Writer::start(TGETATTR, tag);
                w.u32(*fid);
                w.u64(*request_mask);
                w
            }
            Tmessage::Readdir { fid, offset, count } => {
                let mut w = Writer::start(TREADDIR, tag);
                w.u32(*fid);
                w.u64(*offset);
                w.u32(*count);
                w
            }
            Tmessage::Mkdir {
                dfid,
                name,
                mode,
                gid,
            } => {
                let mut w = Writer::start(TMKDIR, tag);
                w.u32(*dfid);
                w.string(name);
                w.u32(*mode);
                w.u32(*gid);
                w
            }
            Tmessage::Unlinkat {
                dirfid,
                name,
                flags,
            } => {
                let mut w = Writer::start(TUNLINKAT, tag);
                w.u32(*dirfid);
                w.string(name);
                w.u32(*flags);
                w
            }
            _ => return None,
        };
        Some(w.finish())
    }
}

impl Rmessage {
    /// Encodes a server reply with the given tag.
    pub fn encode(&self, tag: u16) -> Vec<u8> {
        let w = match self {
            Rmessage::Lerror { ecode } => {
                let mut w = Writer::start(kind::RLERROR, tag);
                w.u32(*ecode);
                w
            }
            Rmessage::Version { msize, version } => {
                let mut w = Writer::start(kind::TVERSION + 1, tag);
                w.u32(*msize);
                w.string(version);
                w
            }
            Rmessage::Attach { qid } => {
                let mut w = Writer::start(kind::TATTACH + 1, tag);
                w.qid(qid);
                w
            }
            Rmessage::Flush => Writer::start(kind::TFLUSH + 1, tag),
            Rmessage::Walk { qids } => {
                let mut w = Writer::start(kind::TWALK + 1, tag);
                w.u16(qids.len() as u16);
                for q in qids {
                    w.qid(q);
                }
                w
            }
            Rmessage::Lopen { qid, iounit } => {
                let mut w = Writer::start(kind::TLOPEN + 1, tag);
                w.qid(qid);
                w.u32(*iounit);
                w
            }
            Rmessage::Lcreate { qid, iounit } => {
                let mut w = Writer::start(kind::TLCREATE + 1, tag);
                w.qid(qid);
                w.u32(*iounit);
                w
            }
            Rmessage::Read { data } => {
                let mut w = Writer::start(kind::TREAD + 1, tag);
                w.u32(data.len() as u32);
                w.buf.extend_from_slice(data);
                w
            }
            Rmessage::Write { count } => {
                let mut w = Writer::start(kind::TWRITE + 1, tag);
                w.u32(*count);
                w
            }
            Rmessage::Clunk => Writer::start(kind::TCLUNK + 1, tag),
            Rmessage::Remove => Writer::start(kind::TREMOVE + 1, tag),
            Rmessage::Statfs(s) => {
                let mut w = Writer::start(kind::TSTATFS + 1, tag);
                w.u32(s.typ);
                w.u32(s.bsize);
                w.u64(s.blocks);
                w.u64(s.bfree);
                w.u64(s.bavail);
                w.u64(s.files);
                w.u64(s.ffree);
                w.u64(s.fsid);
                w.u32(s.namelen);
                w
            }
            Rmessage::Getattr(a) => {
                let mut w = Writer::start(kind::TGETATTR + 1, tag);
                w.u64(a.valid);
                w.qid(&a.qid);
                w.u32(a.mode);
                w.u32(a.uid);
                w.u32(a.gid);
                w.u64(a.nlink);
                w.u64(a.rdev);
                w.u64(a.size);
                w.u64(a.blksize);
                w.u64(a.blocks);
                for (sec, nsec) in &[a.atime, a.mtime, a.ctime, (0, 0)] {
                    w.u64(*sec);
                    w.u64(*nsec);
                }
                // gen, data_version
                w.u64(0);
                w.u64(0);
                w
            }
            Rmessage::Setattr => Writer::start(kind::TSETATTR + 1, tag),
            Rmessage::Readdir { data } => {
                let mut w = Writer::start(kind::TREADDIR + 1, tag);
                w.u32(data.len() as u32);
                w.buf.extend_from_slice(data);
                w
            }
            Rmessage::Fsync => Writer::start(kind::TFSYNC + 1, tag),
            Rmessage::Mkdir { qid } => {
                let mut w = Writer::start(kind::TMKDIR + 1, tag);
                w.qid(qid);
                w
            }
            Rmessage::Symlink { qid } => {
                let mut w = Writer::start(kind::TSYMLINK + 1, tag);
                w.qid(qid);
                w
            }
            Rmessage::Readlink { target } => {
                let mut w = Writer::start(kind::TREADLINK + 1, tag);
                w.string(target);
                w
            }
            Rmessage::Link => Writer::start(kind::TLINK + 1, tag),
            Rmessage::Rename => Writer::start(kind::TRENAME + 1, tag),
            Rmessage::Renameat => Writer::start(kind::TRENAMEAT + 1, tag),
            Rmessage::Unlinkat => Writer::start(kind::TUNLINKAT + 1, tag),
            Rmessage::Lock { status } => {
                let mut w = Writer::start(kind::TLOCK + 1, tag);
                w.u8(*status);
                w
            }
            Rmessage::Getlock {
                typ,
                start,
                length,
                proc_id,
                client_id,
            } => {
                let mut w = Writer::start(kind::TGETLOCK + 1, tag);
                w.u8(*typ);
                w.u64(*start);
                w.u64(*length);
                w.u32(*proc_id);
                w.string(client_id);
                w
            }
        };
        w.finish()
    }

    /// Decodes the replies a simple client cares about. Returns the tag and
    /// the message.
    pub fn decode(buf: &[u8]) -> Result<(u16, Rmessage), Error> {
        let mut r = Reader::new(buf);
        r.u32("size")?;
        let typ = r.u8("type")?;
        let tag = r.u16("tag")?;
        use kind::*;
        let msg = match typ {
            RLERROR => Rmessage::Lerror {
                ecode: r.u32("ecode")?,
            },
            t if t == TVERSION + 1 => Rmessage::Version {
                msize: r.u32("msize")?,
                version: r.string("version")?,
            },
            t if t == TATTACH + 1 => Rmessage::Attach { qid: r.qid()? },
            t if t == TWALK + 1 => {
                let n = r.u16("nwqid")?;
                let mut qids = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    qids.push(r.qid()?);
                }
                Rmessage::Walk { qids }
            }
            t if t == TLOPEN + 1 => Rmessage::Lopen {
                qid: r.qid()?,
                iounit: r.u32("iounit")?,
            },
            t if t == TLCREATE + 1 => Rmessage::Lcreate {
                qid: r.qid()?,
                iounit: r.u32("iounit")?,
            },
            t if t == TREAD + 1 => {
                let count = r.u32("count")? as usize;
                Rmessage::Read {
                    data: r.take(count, "data")?.to_vec(),
                }
            }
            t if t == TWRITE + 1 => Rmessage::Write {
                count: r.u32("count")?,
            },
            t if t == TCLUNK + 1 => Rmessage::Clunk,
            t if t == TGETATTR + 1 => {
                let valid = r.u64("valid")?;
                let qid = r.qid()?;
                let mode = r.u32("mode")?;
                let uid = r.u32("uid")?;
                let gid = r.u32("gid")?;
                let nlink = r.u64("nlink")?;
                let rdev = r.u64("rdev")?;
                let size = r.u64("size")?;
                let blksize = r.u64("blksize")?;
                let blocks = r.u64("blocks")?;
                let atime = (r.u64("atime")?, r.u64("atime")?);
                let mtime = (r.u64("mtime")?, r.u64("mtime")?);
                let ctime = (r.u64("ctime")?, r.u64("ctime")?);
                Rmessage::Getattr(Attr {
                    valid,
                    qid,
                    mode,
                    uid,
                    gid,
                    nlink,
                    rdev,
                    size,
                    blksize,
                    blocks,
                    atime,
                    mtime,
                    ctime,
                })
            }
            t if t == TREADDIR + 1 => {
                let count = r.u32("count")? as usize;
                Rmessage::Readdir {
                    data: r.take(count, "data")?.to_vec(),
                }
            }
            t if t == TMKDIR + 1 => Rmessage::Mkdir { qid: r.qid()? },
            t if t == TUNLINKAT + 1 => Rmessage::Unlinkat,
            other => return Err(Error::UnknownType(other)),
        };
        Ok((tag, msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_header_covers_the_whole_message() {
        let buf = Rmessage::Write { count: 5 }.encode(9);
        assert_eq!(buf.len(), 4 + 1 + 2 + 4);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 11);
    }

    #[test]
    fn walk_decodes_every_name() {
        let buf = Tmessage::Walk {
            fid: 1,
            newfid: 2,
            wnames: vec!["a".into(), "bc".into()],
        }
        .encode(3)
        .unwrap();
        let (tag, msg) = Tmessage::decode(&buf).unwrap();
        assert_eq!(tag, 3);
        assert_eq!(
            msg,
            Tmessage::Walk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".into(), "bc".into()]
            }
        );
    }

    #[test]
    fn truncated_messages_name_the_field() {
        let mut buf = Tmessage::Version {
            msize: 8192,
            version: VERSION.into(),
        }
        .encode(NOTAG)
        .unwrap();
        buf.truncate(buf.len() - 2);
        match Tmessage::decode(&buf) {
            Err(Error::Truncated { field, needed }) => {
                assert_eq!(field, "version");
                assert_eq!(needed, 2);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn dirents_stop_at_the_limit() {
        let entry = DirEntry {
            qid: Qid::default(),
            offset: 1,
            typ: 8,
            name: "file.txt".into(),
        };
        let mut buf = Vec::new();
        assert!(push_dirent(&mut buf, &entry, 48));
        let one = buf.len();
        assert_eq!(one, 32);
        assert!(!push_dirent(&mut buf, &entry, 48));
        assert_eq!(buf.len(), one);
        // The limit is inclusive: two entries fill 64 bytes exactly.
        assert!(push_dirent(&mut buf, &entry, 64));
        assert_eq!(buf.len(), 64);
        buf.truncate(one);
        assert_eq!(parse_dirents(&buf).unwrap(), vec![entry]);
    }

    const VERSION: &str = crate::VERSION_9P2000_L;
}
