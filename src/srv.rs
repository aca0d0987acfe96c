//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! This module is the request lifecycle engine: it reads T-messages off one
//! byte stream, validates them against the protocol state machine, keeps the
//! per-connection fid and tag tables, dispatches to the [`Filesystem`]
//! callbacks, and writes the R-messages back. Protocol-level checks (fid and
//! tag uniqueness, open modes, offset rules, permission structure) all happen
//! here, before any callback runs.

use {
    crate::{
        error::{Error, string::*},
        fcall::*,
        pool::Pool,
        serialize,
        tree::{DirReader, FileRef},
        utils::Result,
    },
    async_trait::async_trait,
    bytes::{Buf, BufMut, BytesMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        collections::VecDeque,
        mem,
        sync::{
            Arc, Mutex as StdMutex, OnceLock,
            atomic::{AtomicU32, Ordering},
        },
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::Mutex,
        task::JoinSet,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedWrite, length_delimited::LengthDelimitedCodec},
};

/// Represents a fid of clients holding associated `Filesystem::Fid`.
///
/// The engine owns the protocol-visible state of the handle (qid, open mode,
/// directory cursor, optional file-tree node); the filesystem hangs whatever
/// it needs off `aux`.
pub struct Fid<T> {
    /// Raw client side fid.
    fid: u32,

    /// Owner name, copied from the attach that created the handle.
    uid: String,

    state: StdMutex<FidState>,

    /// `Filesystem::Fid` associated with this fid.
    pub aux: T,
}

struct FidState {
    qid: Qid,
    omode: Option<u8>,
    diroffset: u64,
    file: Option<FileRef>,
    rdir: Option<Box<dyn DirReader>>,
}

impl<T> Fid<T> {
    fn new(fid: u32, uid: String) -> Fid<T>
    where
        T: Default,
    {
        Fid {
            fid,
            uid,
            state: StdMutex::new(FidState {
                qid: Qid::default(),
                omode: None,
                diroffset: 0,
                file: None,
                rdir: None,
            }),
            aux: T::default(),
        }
    }

    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The user this handle was attached as.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The identity of the file the handle currently points at.
    pub fn qid(&self) -> Qid {
        self.state.lock().unwrap().qid
    }

    /// Move the handle to another file. Walk implementations call this as
    /// they step.
    pub fn set_qid(&self, qid: Qid) {
        self.state.lock().unwrap().qid = qid;
    }

    /// The mode the handle was opened with, None before a successful open.
    pub fn omode(&self) -> Option<u8> {
        self.state.lock().unwrap().omode
    }

    /// The file-tree node behind the handle, if the server carries a tree.
    pub fn file(&self) -> Option<FileRef> {
        self.state.lock().unwrap().file.clone()
    }

    /// Bind the handle to a file-tree node. Create implementations use this
    /// to point the fid at the node they made.
    pub fn set_file(&self, file: Option<FileRef>) {
        self.state.lock().unwrap().file = file;
    }

    /// Position of the directory-read cursor.
    pub fn diroffset(&self) -> u64 {
        self.state.lock().unwrap().diroffset
    }

    fn set_diroffset(&self, diroffset: u64) {
        self.state.lock().unwrap().diroffset = diroffset;
    }

    fn set_rdir(&self, rdir: Option<Box<dyn DirReader>>) {
        self.state.lock().unwrap().rdir = rdir;
    }

    fn read_dir(&self, count: u32, offset: u64) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.rdir.as_mut().map(|rdir| rdir.read(count, offset))
    }

    fn set_opened(&self, mode: u8, qid: Qid) {
        let mut state = self.state.lock().unwrap();
        if qid.typ.contains(QidType::DIR) {
            state.diroffset = 0;
        }
        state.qid = qid;
        state.omode = Some(mode);
    }

    fn auth_opened(&self, aqid: Qid) {
        let mut state = self.state.lock().unwrap();
        state.qid = aqid;
        if state.omode.is_none() {
            state.omode = Some(om::RDWR);
        }
    }
}

/// Filesystem server trait for implementing 9P2000 servers.
///
/// Every method is optional: the defaults reproduce the behavior of a server
/// that did not register the corresponding callback, which for most
/// operations is an appropriate "… prohibited" error, and for `attach`,
/// `open`, `remove` and `stat` is the right thing when the connection carries
/// a file tree (see [`crate::tree`]).
///
/// The engine performs all protocol validation before a method is called:
/// when `read` runs, the fid exists, is open for reading, and the count has
/// already been clamped to the negotiated message size. Methods only need to
/// implement the filesystem semantics.
///
/// Version negotiation is not overridable; it is part of the protocol state
/// machine and the engine answers it directly.
///
/// # Example
/// ```no_run
/// use srv9p::{srv::{Fid, Filesystem, Srv}, Qid, QidType, Result};
/// use async_trait::async_trait;
///
/// struct HelloFs;
///
/// #[async_trait]
/// impl Filesystem for HelloFs {
///     type Fid = ();
///
///     async fn attach(
///         &self,
///         _fid: &Fid<()>,
///         _afid: Option<&Fid<()>>,
///         _uname: &str,
///         _aname: &str,
///     ) -> Result<Qid> {
///         Ok(Qid { typ: QidType::DIR, version: 0, path: 0 })
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let (stdin, stdout) = (tokio::io::stdin(), tokio::io::stdout());
///     Srv::new(HelloFs).serve(stdin, stdout).await
/// }
/// ```
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// User defined fid type to be associated with a client's fid.
    type Fid: Send + Sync + Default + 'static;

    /// Establish an authentication file on `afid`, returning its qid
    /// (which should carry [`QidType::AUTH`]).
    async fn auth(&self, _afid: &Fid<Self::Fid>, _uname: &str, _aname: &str) -> Result<Qid> {
        Err(ENOAUTH.into())
    }

    /// Bind `fid` to the root of the served tree and return the root qid.
    ///
    /// When the connection carries a file tree the engine has already pointed
    /// the fid at the tree root, and the default implementation reports that
    /// qid back.
    async fn attach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Qid> {
        Ok(fid.qid())
    }

    /// Notification that the client wants `old` aborted.
    ///
    /// The engine guarantees that the Rflush is written after the reply to
    /// `old`, whether or not this method does anything.
    async fn flush(&self, _old: &FCall) {}

    /// Walk `newfid` from `fid` through `wnames`, returning one qid per name
    /// walked. A result shorter than `wnames` reports a partial walk; an
    /// error is only appropriate when not even the first name could be
    /// walked.
    ///
    /// The default implementation drives [`walk1`](Self::walk1) and
    /// [`clone_fid`](Self::clone_fid), which is usually the easier surface to
    /// implement. Walking several names in place on an open-ended
    /// `fid == newfid` is refused there; a full override may choose to
    /// support it.
    async fn walk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        wnames: &[String],
    ) -> Result<Vec<Qid>> {
        if fid.fid() == newfid.fid() && wnames.len() > 1 {
            return Err(EINPLACEWALK.into());
        }

        if fid.fid() != newfid.fid() {
            newfid.set_qid(fid.qid());
            self.clone_fid(fid, newfid).await?;
        }

        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames {
            match self.walk1(newfid, name).await {
                Ok(qid) => {
                    newfid.set_qid(qid);
                    wqids.push(qid);
                }
                Err(e) if wqids.is_empty() => return Err(e),
                Err(_) => break,
            }
        }
        Ok(wqids)
    }

    /// Step `newfid` one name down the tree and return the new qid.
    async fn walk1(&self, _newfid: &Fid<Self::Fid>, _name: &str) -> Result<Qid> {
        Err(ENOWALK.into())
    }

    /// Prepare `newfid` as a copy of `fid` before a walk starts.
    async fn clone_fid(&self, _fid: &Fid<Self::Fid>, _newfid: &Fid<Self::Fid>) -> Result<()> {
        Ok(())
    }

    /// Open the file behind `fid` with the already-validated `mode`,
    /// returning the qid and iounit for the Ropen.
    async fn open(&self, fid: &Fid<Self::Fid>, _mode: u8) -> Result<(Qid, u32)> {
        Ok((fid.qid(), 0))
    }

    /// Create `name` in the directory behind `fid` and leave the fid
    /// pointing at the new file, returning its qid and iounit.
    async fn create(
        &self,
        _fid: &Fid<Self::Fid>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<(Qid, u32)> {
        Err(ENOCREATE.into())
    }

    /// Read up to `count` bytes at `offset`.
    ///
    /// Directory reads against a file tree never reach this method; the
    /// engine serves them from the tree. A filesystem serving directories
    /// itself must return whole encoded stat entries and respect the offset
    /// contract the engine already enforced.
    async fn read(&self, _fid: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(ENOREAD.into())
    }

    /// Write `data` at `offset`, returning the number of bytes accepted.
    async fn write(&self, _fid: &Fid<Self::Fid>, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(ENOWRITE.into())
    }

    /// Remove the file behind `fid`. The fid is clunked regardless of the
    /// outcome; on success the engine also unlinks the file-tree node, when
    /// there is one.
    async fn remove(&self, fid: &Fid<Self::Fid>) -> Result<()> {
        if fid.file().is_some() {
            Ok(())
        } else {
            Err(ENOREMOVE.into())
        }
    }

    /// Produce the metadata of the file behind `fid`.
    async fn stat(&self, fid: &Fid<Self::Fid>) -> Result<Stat> {
        match fid.file() {
            Some(file) => Ok(file.stat()),
            None => Err(ENOSTAT.into()),
        }
    }

    /// Apply the requested metadata changes. The engine has already verified
    /// the wstat sentinel rules against the fid's qid.
    async fn wstat(&self, _fid: &Fid<Self::Fid>, _stat: &Stat) -> Result<()> {
        Err(ENOWSTAT.into())
    }

    /// Called once before the first message is read.
    async fn start(&self) {}

    /// Called once when the connection has drained.
    async fn end(&self) {}

    /// Called when a fid leaves the fid table for good.
    async fn destroy_fid(&self, _fid: &Fid<Self::Fid>) {}
}

/// One in-flight request.
struct Req<T> {
    tag: u16,
    ifcall: FCall,

    /* resolved while the request is dispatched */
    fid: OnceLock<Arc<Fid<T>>>,
    afid: OnceLock<Arc<Fid<T>>>,
    newfid: OnceLock<Arc<Fid<T>>>,

    /// Flush target, dropped once the flush has been answered.
    oldreq: StdMutex<Option<Arc<Req<T>>>>,

    lk: StdMutex<ReqLk<T>>,
}

struct ReqLk<T> {
    responded: bool,
    flush: Vec<Arc<Req<T>>>,
}

impl<T> Req<T> {
    fn new(tag: u16, ifcall: FCall) -> Req<T> {
        Req {
            tag,
            ifcall,
            fid: OnceLock::new(),
            afid: OnceLock::new(),
            newfid: OnceLock::new(),
            oldreq: StdMutex::new(None),
            lk: StdMutex::new(ReqLk {
                responded: false,
                flush: Vec::new(),
            }),
        }
    }
}

/// Server configuration for one connection.
pub struct Srv<Fs> {
    fs: Arc<Fs>,
    msize: u32,
    tree: Option<FileRef>,
}

impl<Fs: Filesystem + 'static> Srv<Fs> {
    pub fn new(fs: Fs) -> Srv<Fs> {
        Srv {
            fs: Arc::new(fs),
            msize: DEFAULT_MSIZE,
            tree: None,
        }
    }

    /// Message size assumed until a Tversion renegotiates it.
    pub fn msize(mut self, msize: u32) -> Srv<Fs> {
        self.msize = msize;
        self
    }

    /// Serve the given file tree. Walks, permission checks, directory reads
    /// and removals are then resolved against the tree by the engine itself.
    pub fn tree(mut self, root: FileRef) -> Srv<Fs> {
        self.tree = Some(root);
        self
    }

    /// Serve one connection over the given byte streams until the client
    /// hangs up and every outstanding request has been answered.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut framedread = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(self.msize as usize)
            .new_read(reader);
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(self.msize as usize)
            .new_write(writer);

        let conn = Arc::new(Conn {
            fs: self.fs,
            msize: AtomicU32::new(self.msize),
            fids: Pool::new(),
            reqs: Pool::new(),
            writer: Mutex::new(framedwrite),
            tree: self.tree,
        });

        conn.fs.start().await;

        let mut tasks = JoinSet::new();
        let mut result = Ok(());
        loop {
            // a Tversion may have renegotiated the frame size
            framedread
                .decoder_mut()
                .set_max_frame_length(conn.msize() as usize);

            match framedread.next().await {
                None => break,
                Some(Err(e)) => {
                    error!("read: {e}");
                    result = Err(e.into());
                    break;
                }
                Some(Ok(frame)) => {
                    let msg = match serialize::read_msg(&mut frame.reader()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!("dropping undecodable message: {e}");
                            continue;
                        }
                    };
                    debug!("\t← {msg:?}");
                    conn.handle(&mut tasks, msg).await;
                }
            }
        }

        // wait for outstanding requests; deferred flushes ride on them
        while tasks.join_next().await.is_some() {}

        conn.fs.end().await;
        for fid in conn.fids.drain() {
            conn.fs.destroy_fid(&fid).await;
        }
        conn.reqs.drain();

        result
    }
}

/// Shared state of one connection.
struct Conn<Fs: Filesystem, W> {
    fs: Arc<Fs>,
    msize: AtomicU32,
    fids: Pool<u32, Fid<Fs::Fid>>,
    reqs: Pool<u16, Req<Fs::Fid>>,
    writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
    tree: Option<FileRef>,
}

impl<Fs, W> Conn<Fs, W>
where
    Fs: Filesystem + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    async fn change_msize(&self, msize: u32) {
        if self.msize.swap(msize, Ordering::SeqCst) != msize {
            let mut writer = self.writer.lock().await;
            writer.encoder_mut().set_max_frame_length(msize as usize);
            info!("msize negotiated to {msize}");
        }
    }

    /// Dispatch one decoded message. Runs on the reader task, so the
    /// pre-callback phase of every handler is serialized; handlers spawn the
    /// callback-and-respond phase onto `tasks`.
    async fn handle(self: &Arc<Self>, tasks: &mut JoinSet<()>, msg: Msg) {
        let r = Arc::new(Req::new(msg.tag, msg.body));
        if self.reqs.add(r.tag, r.clone()).is_none() {
            info!("tag {} already in use", r.tag);
            self.respond_fake(r.tag, EDUPTAG).await;
            return;
        }

        match r.ifcall {
            FCall::TVersion { .. } => self.sversion(r).await,
            FCall::TAuth { .. } => self.sauth(tasks, r).await,
            FCall::TAttach { .. } => self.sattach(tasks, r).await,
            FCall::TFlush { .. } => self.sflush(tasks, r).await,
            FCall::TWalk { .. } => self.swalk(tasks, r).await,
            FCall::TOpen { .. } => self.sopen(tasks, r).await,
            FCall::TCreate { .. } => self.screate(tasks, r).await,
            FCall::TRead { .. } => self.sread(tasks, r).await,
            FCall::TWrite { .. } => self.swrite(tasks, r).await,
            FCall::TClunk { .. } => self.sclunk(tasks, r).await,
            FCall::TRemove { .. } => self.sremove(tasks, r).await,
            FCall::TStat { .. } => self.sstat(tasks, r).await,
            FCall::TWStat { .. } => self.swstat(tasks, r).await,
            _ => self.respond(r, Err(EUNKNOWNMSG.into())).await,
        }
    }

    async fn sversion(self: &Arc<Self>, r: Arc<Req<Fs::Fid>>) {
        let (msize, version) = {
            let FCall::TVersion { msize, version } = &r.ifcall else {
                return;
            };
            (*msize, version.clone())
        };

        if self.reqs.len() != 1 {
            return self.respond(r, Err(EBOTCH.into())).await;
        }
        if !version.starts_with("9P") {
            let body = FCall::RVersion {
                msize: 256,
                version: VERSION_UNKNOWN.to_owned(),
            };
            return self.respond(r, Ok(body)).await;
        }
        if msize < 256 {
            return self.respond(r, Err(EMSIZE.into())).await;
        }
        let body = FCall::RVersion {
            msize: msize.min(MAX_MSIZE),
            version: P92000.to_owned(),
        };
        self.respond(r, Ok(body)).await;
    }

    async fn sauth(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (afid_n, uname, aname) = {
            let FCall::TAuth { afid, uname, aname } = &r.ifcall else {
                return;
            };
            (*afid, uname.clone(), aname.clone())
        };

        let afid = Arc::new(Fid::new(afid_n, uname.clone()));
        let Some(afid) = self.fids.add(afid_n, afid) else {
            return self.respond(r, Err(EDUPFID.into())).await;
        };
        let _ = r.afid.set(afid.clone());

        let conn = self.clone();
        tasks.spawn(async move {
            let result = conn
                .fs
                .auth(&afid, &uname, &aname)
                .await
                .map(|aqid| FCall::RAuth { aqid });
            conn.respond(r, result).await;
        });
    }

    async fn sattach(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (fid_n, afid_n, uname, aname) = {
            let FCall::TAttach {
                fid,
                afid,
                uname,
                aname,
            } = &r.ifcall
            else {
                return;
            };
            (*fid, *afid, uname.clone(), aname.clone())
        };

        let fid = Arc::new(Fid::new(fid_n, uname.clone()));
        let Some(fid) = self.fids.add(fid_n, fid) else {
            return self.respond(r, Err(EDUPFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());

        let afid = if afid_n != NOFID {
            match self.fids.lookup(&afid_n) {
                Some(afid) => {
                    let _ = r.afid.set(afid.clone());
                    Some(afid)
                }
                // the finalizer reverts the fresh fid
                None => return self.respond(r, Err(EUNKNOWNFID.into())).await,
            }
        } else {
            None
        };

        if let Some(root) = &self.tree {
            fid.set_file(Some(root.clone()));
            fid.set_qid(root.qid());
        }

        let conn = self.clone();
        tasks.spawn(async move {
            let result = conn
                .fs
                .attach(&fid, afid.as_deref(), &uname, &aname)
                .await
                .map(|qid| FCall::RAttach { qid });
            conn.respond(r, result).await;
        });
    }

    async fn sflush(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let oldtag = {
            let FCall::TFlush { oldtag } = &r.ifcall else {
                return;
            };
            *oldtag
        };

        match self.reqs.lookup(&oldtag) {
            Some(old) if !Arc::ptr_eq(&old, &r) => {
                *r.oldreq.lock().unwrap() = Some(old.clone());
                let conn = self.clone();
                tasks.spawn(async move {
                    conn.fs.flush(&old.ifcall).await;
                    conn.respond(r, Ok(FCall::RFlush)).await;
                });
            }
            // target already answered, or a flush of itself
            _ => self.respond(r, Ok(FCall::RFlush)).await,
        }
    }

    async fn swalk(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (fid_n, newfid_n, wnames) = {
            let FCall::TWalk {
                fid,
                newfid,
                wnames,
            } = &r.ifcall
            else {
                return;
            };
            (*fid, *newfid, wnames.clone())
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());
        if fid.omode().is_some() {
            return self.respond(r, Err(EOPENFID.into())).await;
        }
        if !wnames.is_empty() && !fid.qid().typ.contains(QidType::DIR) {
            return self.respond(r, Err(EWALKNODIR.into())).await;
        }

        let newfid = if newfid_n != fid_n {
            let newfid = Arc::new(Fid::new(newfid_n, fid.uid().to_owned()));
            let Some(newfid) = self.fids.add(newfid_n, newfid) else {
                return self.respond(r, Err(EDUPFID.into())).await;
            };
            newfid
        } else {
            fid.clone()
        };
        let _ = r.newfid.set(newfid.clone());

        if let Some(file) = fid.file() {
            // walk the tree locally; a short result is fixed up by the
            // finalizer
            let mut wqids = Vec::with_capacity(wnames.len());
            let mut cur = file;
            let mut short = false;
            for name in &wnames {
                match cur.walk(name) {
                    Some(next) => {
                        wqids.push(next.qid());
                        cur = next;
                    }
                    None => {
                        short = true;
                        break;
                    }
                }
            }
            if !short {
                let qid = cur.qid();
                newfid.set_file(Some(cur));
                newfid.set_qid(qid);
            }
            self.respond(r, Ok(FCall::RWalk { wqids })).await;
        } else {
            let conn = self.clone();
            tasks.spawn(async move {
                let result = conn
                    .fs
                    .walk(&fid, &newfid, &wnames)
                    .await
                    .map(|wqids| FCall::RWalk { wqids });
                conn.respond(r, result).await;
            });
        }
    }

    async fn sopen(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (fid_n, mode) = {
            let FCall::TOpen { fid, mode } = &r.ifcall else {
                return;
            };
            (*fid, *mode)
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());
        if fid.omode().is_some() {
            return self.respond(r, Err(EBOTCH.into())).await;
        }
        let qid = fid.qid();
        if qid.typ.contains(QidType::DIR) && (mode & !om::RCLOSE) != om::READ {
            return self.respond(r, Err(EISDIR.into())).await;
        }
        let p = match mode & 3 {
            om::READ => aperm::READ,
            om::WRITE => aperm::WRITE,
            om::RDWR => aperm::READ | aperm::WRITE,
            om::EXEC => aperm::EXEC,
            _ => unreachable!(),
        };
        let p = if (mode & om::TRUNC) != 0 {
            p | aperm::WRITE
        } else {
            p
        };
        if qid.typ.contains(QidType::DIR) && p != aperm::READ {
            return self.respond(r, Err(EPERM.into())).await;
        }

        if let Some(file) = fid.file() {
            if !file.has_perm(fid.uid(), p) {
                return self.respond(r, Err(EPERM.into())).await;
            }
            if (mode & om::RCLOSE) != 0 && !dirwritable(&fid) {
                return self.respond(r, Err(EPERM.into())).await;
            }
            fid.set_qid(file.qid());
            if file.qid().typ.contains(QidType::DIR) {
                match file.open_dir() {
                    Ok(rdir) => fid.set_rdir(Some(rdir)),
                    Err(_) => return self.respond(r, Err(ENODIRREAD.into())).await,
                }
            }
        }

        let conn = self.clone();
        tasks.spawn(async move {
            let result = conn
                .fs
                .open(&fid, mode)
                .await
                .map(|(qid, iounit)| FCall::ROpen { qid, iounit });
            conn.respond(r, result).await;
        });
    }

    async fn screate(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (fid_n, name, perm, mode) = {
            let FCall::TCreate {
                fid,
                name,
                perm,
                mode,
            } = &r.ifcall
            else {
                return;
            };
            (*fid, name.clone(), *perm, *mode)
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());
        if fid.omode().is_some() {
            return self.respond(r, Err(EBOTCH.into())).await;
        }
        if !fid.qid().typ.contains(QidType::DIR) {
            return self.respond(r, Err(ECREATENONDIR.into())).await;
        }
        if let Some(file) = fid.file() {
            if !file.has_perm(fid.uid(), aperm::WRITE) {
                return self.respond(r, Err(EPERM.into())).await;
            }
        }

        let conn = self.clone();
        tasks.spawn(async move {
            let result = conn
                .fs
                .create(&fid, &name, perm, mode)
                .await
                .map(|(qid, iounit)| FCall::RCreate { qid, iounit });
            conn.respond(r, result).await;
        });
    }

    async fn sread(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (fid_n, offset, count) = {
            let FCall::TRead { fid, offset, count } = &r.ifcall else {
                return;
            };
            (*fid, *offset, *count)
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());
        let Some(omode) = fid.omode() else {
            return self.respond(r, Err(EBOTCH.into())).await;
        };
        match omode & 3 {
            om::READ | om::RDWR | om::EXEC => {}
            _ => return self.respond(r, Err(EBOTCH.into())).await,
        }
        if count > i32::MAX as u32 {
            return self.respond(r, Err(EBOTCH.into())).await;
        }
        let qid = fid.qid();
        if offset > i64::MAX as u64
            || (qid.typ.contains(QidType::DIR) && offset != 0 && offset != fid.diroffset())
        {
            return self.respond(r, Err(EBADOFFSET.into())).await;
        }
        let count = count.min(self.msize() - IOHDRSZ);

        if qid.typ.contains(QidType::DIR) && fid.file().is_some() {
            match fid.read_dir(count, offset) {
                Some(data) => self.respond(r, Ok(FCall::RRead { data: Data(data) })).await,
                None => self.respond(r, Err(EBOTCH.into())).await,
            }
        } else {
            let conn = self.clone();
            tasks.spawn(async move {
                let result = conn
                    .fs
                    .read(&fid, offset, count)
                    .await
                    .map(|data| FCall::RRead { data: Data(data) });
                conn.respond(r, result).await;
            });
        }
    }

    async fn swrite(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let (fid_n, offset) = {
            let FCall::TWrite { fid, offset, .. } = &r.ifcall else {
                return;
            };
            (*fid, *offset)
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());
        let Some(omode) = fid.omode() else {
            return self.respond(r, Err(EBOTCH.into())).await;
        };
        match omode & 3 {
            om::WRITE | om::RDWR => {}
            _ => return self.respond(r, Err(EBOTCH.into())).await,
        }
        if fid.qid().typ.contains(QidType::DIR) {
            return self.respond(r, Err(EBOTCH.into())).await;
        }
        if offset > i64::MAX as u64 {
            return self.respond(r, Err(EBOTCH.into())).await;
        }
        let clamp = (self.msize() - IOHDRSZ) as usize;

        let conn = self.clone();
        tasks.spawn(async move {
            let result = {
                let FCall::TWrite { data, .. } = &r.ifcall else {
                    return;
                };
                let data = &data.0[..data.0.len().min(clamp)];
                conn.fs
                    .write(&fid, offset, data)
                    .await
                    .map(|count| FCall::RWrite { count })
            };
            conn.respond(r, result).await;
        });
    }

    async fn sclunk(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let fid_n = {
            let FCall::TClunk { fid } = &r.ifcall else {
                return;
            };
            *fid
        };

        match self.fids.remove(&fid_n) {
            None => self.respond(r, Err(EUNKNOWNFID.into())).await,
            Some(fid) => {
                let _ = r.fid.set(fid.clone());
                self.respond(r, Ok(FCall::RClunk)).await;
                let conn = self.clone();
                tasks.spawn(async move { conn.fs.destroy_fid(&fid).await });
            }
        }
    }

    async fn sremove(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let fid_n = {
            let FCall::TRemove { fid } = &r.ifcall else {
                return;
            };
            *fid
        };

        // remove always clunks the fid, even when it is then refused
        let Some(fid) = self.fids.remove(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());

        let conn = self.clone();
        if !dirwritable(&fid) {
            self.respond(r, Err(EPERM.into())).await;
            tasks.spawn(async move { conn.fs.destroy_fid(&fid).await });
            return;
        }

        tasks.spawn(async move {
            let result = conn.fs.remove(&fid).await.map(|()| FCall::RRemove);
            conn.respond(r, result).await;
            conn.fs.destroy_fid(&fid).await;
        });
    }

    async fn sstat(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let fid_n = {
            let FCall::TStat { fid } = &r.ifcall else {
                return;
            };
            *fid
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());

        let conn = self.clone();
        tasks.spawn(async move {
            let result = conn
                .fs
                .stat(&fid)
                .await
                .map(|stat| FCall::RStat { stat });
            conn.respond(r, result).await;
        });
    }

    async fn swstat(self: &Arc<Self>, tasks: &mut JoinSet<()>, r: Arc<Req<Fs::Fid>>) {
        let fid_n = {
            let FCall::TWStat { fid, .. } = &r.ifcall else {
                return;
            };
            *fid
        };

        let Some(fid) = self.fids.lookup(&fid_n) else {
            return self.respond(r, Err(EUNKNOWNFID.into())).await;
        };
        let _ = r.fid.set(fid.clone());

        let stat = {
            let FCall::TWStat { stat, .. } = &r.ifcall else {
                return;
            };
            match serialize::stat_from_bytes(stat) {
                Ok(stat) => stat,
                Err(_) => return self.respond(r, Err(EBADDIR.into())).await,
            }
        };

        let qid = fid.qid();
        if stat.qid.path != !0 && stat.qid.path != qid.path {
            return self.respond(r, Err(EWSTATPATH.into())).await;
        }
        if stat.qid.version != !0 && stat.qid.version != qid.version {
            return self.respond(r, Err(EWSTATVERS.into())).await;
        }
        if stat.mode != !0 {
            if (stat.mode & !(dm::DIR | dm::APPEND | dm::EXCL | dm::TMP | 0o777)) != 0 {
                return self.respond(r, Err(EWSTATMODE.into())).await;
            }
            let mode_typ = (stat.mode >> 24) as u8;
            if stat.qid.typ.bits() != !0 && stat.qid.typ.bits() != mode_typ {
                return self.respond(r, Err(EWSTATMISMATCH.into())).await;
            }
            let fixed = !(QidType::APPEND | QidType::EXCL | QidType::TMP).bits();
            if ((mode_typ ^ qid.typ.bits()) & fixed) != 0 {
                return self.respond(r, Err(EWSTATTYPE.into())).await;
            }
        } else if stat.qid.typ.bits() != !0 && stat.qid.typ != qid.typ {
            return self.respond(r, Err(EWSTATTYPE.into())).await;
        }

        let conn = self.clone();
        tasks.spawn(async move {
            let result = conn.fs.wstat(&fid, &stat).await.map(|()| FCall::RWStat);
            conn.respond(r, result).await;
        });
    }

    /// The single exit path for every pooled request: run the finalizer,
    /// write the reply, then re-issue any flushes that were waiting on it.
    async fn respond(&self, r: Arc<Req<Fs::Fid>>, result: Result<FCall>) {
        let mut queue = VecDeque::new();
        queue.push_back((r, result));

        while let Some((r, result)) = queue.pop_front() {
            assert!(
                !r.lk.lock().unwrap().responded,
                "double response for tag {}",
                r.tag
            );

            let result = match self.finalize(&r, result).await {
                Some(result) => result,
                // deferred flush; the target's responder will re-issue it
                None => continue,
            };
            let body = result.unwrap_or_else(|e| FCall::RError { ename: e.ename() });
            let msg = Msg { tag: r.tag, body };

            {
                let mut writer = self.writer.lock().await;
                self.reqs.remove(&r.tag);
                send_frame(&mut *writer, &msg, self.msize()).await;
            }

            // no flush can be appended past this point
            let flushes = {
                let mut lk = r.lk.lock().unwrap();
                lk.responded = true;
                mem::take(&mut lk.flush)
            };
            for flush in flushes {
                queue.push_back((flush, Ok(FCall::RFlush)));
            }
        }
    }

    /// Reply to a request that never made it into the tag table.
    async fn respond_fake(&self, tag: u16, ename: &str) {
        let msg = Msg {
            tag,
            body: FCall::RError {
                ename: ename.to_owned(),
            },
        };
        let mut writer = self.writer.lock().await;
        send_frame(&mut *writer, &msg, self.msize()).await;
    }

    /// Post-callback fixups, by request type. Returning None suspends the
    /// response (only flush does this).
    async fn finalize(
        &self,
        r: &Arc<Req<Fs::Fid>>,
        mut result: Result<FCall>,
    ) -> Option<Result<FCall>> {
        match &r.ifcall {
            FCall::TVersion { .. } => {
                if let Ok(FCall::RVersion { msize, .. }) = &result {
                    self.change_msize(*msize).await;
                }
                Some(result)
            }

            FCall::TAuth { .. } => {
                if let Some(afid) = r.afid.get() {
                    match &result {
                        Ok(FCall::RAuth { aqid }) => afid.auth_opened(*aqid),
                        Err(_) => {
                            if let Some(afid) = self.fids.remove(&afid.fid()) {
                                self.fs.destroy_fid(&afid).await;
                            }
                        }
                        _ => {}
                    }
                }
                Some(result)
            }

            FCall::TAttach { .. } => {
                match &result {
                    Ok(FCall::RAttach { qid }) => {
                        if let Some(fid) = r.fid.get() {
                            fid.set_qid(*qid);
                        }
                    }
                    Err(_) => {
                        if let Some(fid) = r.fid.get() {
                            if let Some(fid) = self.fids.remove(&fid.fid()) {
                                self.fs.destroy_fid(&fid).await;
                            }
                        }
                    }
                    _ => {}
                }
                Some(result)
            }

            FCall::TFlush { .. } => {
                let old = r.oldreq.lock().unwrap().take();
                if let Some(old) = old {
                    let mut lk = old.lk.lock().unwrap();
                    if !lk.responded {
                        // delay the response until old is responded
                        lk.flush.push(r.clone());
                        return None;
                    }
                }
                Some(result)
            }

            FCall::TWalk {
                fid: fid_n,
                newfid: newfid_n,
                wnames,
            } => {
                let allocated = *newfid_n != *fid_n && r.newfid.get().is_some();
                match result {
                    Ok(FCall::RWalk { wqids }) if wqids.len() < wnames.len() => {
                        if allocated {
                            if let Some(newfid) = self.fids.remove(newfid_n) {
                                self.fs.destroy_fid(&newfid).await;
                            }
                        }
                        if wqids.is_empty() {
                            // nothing walked at all
                            Some(Err(ENOTFOUND.into()))
                        } else {
                            // partial walks are reported as success
                            Some(Ok(FCall::RWalk { wqids }))
                        }
                    }
                    Ok(FCall::RWalk { wqids }) => {
                        if let Some(newfid) = r.newfid.get() {
                            match wqids.last() {
                                Some(last) => newfid.set_qid(*last),
                                // just a clone
                                None => {
                                    if let Some(fid) = r.fid.get() {
                                        newfid.set_qid(fid.qid());
                                    }
                                }
                            }
                        }
                        Some(Ok(FCall::RWalk { wqids }))
                    }
                    Err(e) => {
                        if allocated {
                            if let Some(newfid) = self.fids.remove(newfid_n) {
                                self.fs.destroy_fid(&newfid).await;
                            }
                        }
                        Some(Err(e))
                    }
                    other => Some(other),
                }
            }

            FCall::TOpen { mode, .. } | FCall::TCreate { mode, .. } => {
                if let (Ok(FCall::ROpen { qid, .. } | FCall::RCreate { qid, .. }), Some(fid)) =
                    (&result, r.fid.get())
                {
                    fid.set_opened(*mode, *qid);
                }
                Some(result)
            }

            FCall::TRead { offset, count, .. } => {
                if let Ok(FCall::RRead { data }) = &mut result {
                    let clamp = (*count).min(self.msize().saturating_sub(IOHDRSZ));
                    data.0.truncate(clamp as usize);
                    if let Some(fid) = r.fid.get() {
                        if fid.qid().typ.contains(QidType::DIR) {
                            fid.set_diroffset(offset + data.0.len() as u64);
                        }
                    }
                }
                Some(result)
            }

            FCall::TWrite { .. } => {
                if result.is_ok() {
                    if let Some(file) = r.fid.get().and_then(|fid| fid.file()) {
                        file.bump_version();
                    }
                }
                Some(result)
            }

            FCall::TRemove { .. } => {
                let result = match result {
                    Ok(body) => match r.fid.get().and_then(|fid| fid.file()) {
                        Some(file) => {
                            if let Some(fid) = r.fid.get() {
                                fid.set_file(None);
                            }
                            match file.remove() {
                                Ok(()) => Ok(body),
                                Err(e) => Err(Error::Msg(format!(
                                    "remove {}: {}",
                                    file.stat().name,
                                    e.ename()
                                ))),
                            }
                        }
                        None => Ok(body),
                    },
                    e => e,
                };
                Some(result)
            }

            _ => Some(result),
        }
    }
}

/// Whether the parent directory of the file behind `fid` allows `uid` to
/// write it. Trivially true without a file tree.
fn dirwritable<T>(fid: &Fid<T>) -> bool {
    match fid.file().and_then(|file| file.parent()) {
        Some(parent) => parent.has_perm(fid.uid(), aperm::WRITE),
        None => true,
    }
}

/// Encode and send one reply frame. Write errors are logged; the connection
/// is torn down by the next read instead.
async fn send_frame<W>(writer: &mut FramedWrite<W, LengthDelimitedCodec>, msg: &Msg, msize: u32)
where
    W: AsyncWrite + Unpin,
{
    debug!("\t→ {msg:?}");
    let mut buf = BytesMut::with_capacity(4096).writer();
    serialize::write_msg(&mut buf, msg).expect("9P reply encoding cannot fail");
    let frame = buf.into_inner().freeze();
    assert!(
        frame.len() + 4 <= msize as usize,
        "9P reply larger than the negotiated msize"
    );
    if let Err(e) = writer.send(frame).await {
        error!("write tag {}: {e}", msg.tag);
    }
}
