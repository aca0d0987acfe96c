//! End-to-end tests of the request lifecycle engine, driven through an
//! in-memory stream with a callback-backed filesystem.

use async_trait::async_trait;
use srv9p::srv::{Fid, Filesystem, Srv};
use srv9p::{Data, FCall, NOFID, NOTAG, Qid, QidType, Result, Stat, dm, errstr, om, serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

mod common;
use common::{recv, recv_error, send, start};

fn dir_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::DIR,
        version: 0,
        path,
    }
}

fn file_qid(path: u64) -> Qid {
    Qid {
        typ: QidType::FILE,
        version: 0,
        path,
    }
}

/// Namespace: / (qid 1) holds b/ (2) and the files data (4) and slow (5);
/// b/ holds c/ (3). Reads of slow wait for the test to open the gate.
#[derive(Clone)]
struct TestFs {
    gate: Arc<Notify>,
    destroyed: Arc<AtomicUsize>,
    flushed: Arc<AtomicUsize>,
}

impl TestFs {
    fn new() -> TestFs {
        TestFs {
            gate: Arc::new(Notify::new()),
            destroyed: Arc::new(AtomicUsize::new(0)),
            flushed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Filesystem for TestFs {
    type Fid = ();

    async fn attach(
        &self,
        _fid: &Fid<()>,
        _afid: Option<&Fid<()>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Qid> {
        Ok(dir_qid(1))
    }

    async fn walk1(&self, newfid: &Fid<()>, name: &str) -> Result<Qid> {
        match (newfid.qid().path, name) {
            (1, "b") => Ok(dir_qid(2)),
            (2, "c") => Ok(dir_qid(3)),
            (1, "data") => Ok(file_qid(4)),
            (1, "slow") => Ok(file_qid(5)),
            _ => Err(errstr::ENOTFOUND.into()),
        }
    }

    async fn read(&self, fid: &Fid<()>, offset: u64, count: u32) -> Result<Vec<u8>> {
        match fid.qid().path {
            4 => {
                let content = b"hello, 9p world";
                let start = (offset as usize).min(content.len());
                let end = (start + count as usize).min(content.len());
                Ok(content[start..end].to_vec())
            }
            5 => {
                self.gate.notified().await;
                Ok(b"slow".to_vec())
            }
            _ => Err(errstr::ENOTFOUND.into()),
        }
    }

    async fn write(&self, _fid: &Fid<()>, _offset: u64, data: &[u8]) -> Result<u32> {
        Ok(data.len() as u32)
    }

    async fn wstat(&self, _fid: &Fid<()>, _stat: &Stat) -> Result<()> {
        Ok(())
    }

    async fn flush(&self, _old: &FCall) {
        self.flushed.fetch_add(1, Ordering::SeqCst);
    }

    async fn destroy_fid(&self, _fid: &Fid<()>) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Filesystem with nothing but an attach, to exercise the default
/// implementations. Attaching with aname "file" yields a plain-file root.
struct BareFs;

#[async_trait]
impl Filesystem for BareFs {
    type Fid = ();

    async fn attach(
        &self,
        _fid: &Fid<()>,
        _afid: Option<&Fid<()>>,
        _uname: &str,
        aname: &str,
    ) -> Result<Qid> {
        if aname == "file" {
            Ok(file_qid(2))
        } else {
            Ok(dir_qid(1))
        }
    }
}

fn tversion(msize: u32, version: &str) -> FCall {
    FCall::TVersion {
        msize,
        version: version.to_owned(),
    }
}

fn tattach(fid: u32, uname: &str, aname: &str) -> FCall {
    FCall::TAttach {
        fid,
        afid: NOFID,
        uname: uname.to_owned(),
        aname: aname.to_owned(),
    }
}

fn twalk(fid: u32, newfid: u32, wnames: &[&str]) -> FCall {
    FCall::TWalk {
        fid,
        newfid,
        wnames: wnames.iter().map(|s| (*s).to_owned()).collect(),
    }
}

fn sentinel_stat() -> Stat {
    Stat {
        typ: !0,
        dev: !0,
        qid: Qid {
            typ: QidType::from_bits_retain(0xff),
            version: !0,
            path: !0,
        },
        mode: !0,
        atime: !0,
        mtime: !0,
        length: !0,
        name: String::new(),
        uid: String::new(),
        gid: String::new(),
        muid: String::new(),
    }
}

fn twstat(fid: u32, stat: &Stat) -> FCall {
    FCall::TWStat {
        fid,
        stat: serialize::stat_to_bytes(stat),
    }
}

#[tokio::test]
async fn version_negotiation() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, NOTAG, tversion(16384, "9P2000")).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.tag, NOTAG);
    assert_eq!(
        msg.body,
        FCall::RVersion {
            msize: 16384,
            version: "9P2000".to_owned(),
        }
    );
}

#[tokio::test]
async fn version_unknown() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, NOTAG, tversion(8192, "XYZ")).await;
    let msg = recv(&mut cr).await;
    assert_eq!(
        msg.body,
        FCall::RVersion {
            msize: 256,
            version: "unknown".to_owned(),
        }
    );
}

#[tokio::test]
async fn version_msize_too_small() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, NOTAG, tversion(100, "9P2000")).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EMSIZE);
}

#[tokio::test]
async fn version_caps_msize() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, NOTAG, tversion(16 * 1024 * 1024, "9P2000")).await;
    let msg = recv(&mut cr).await;
    assert_eq!(
        msg.body,
        FCall::RVersion {
            msize: 1024 * 1024,
            version: "9P2000".to_owned(),
        }
    );
}

#[tokio::test]
async fn version_with_outstanding_request_is_botch() {
    let fs = TestFs::new();
    let ((mut cr, mut cw), _h) = start(Srv::new(fs.clone()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["slow"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    recv(&mut cr).await;

    send(
        &mut cw,
        9,
        FCall::TRead {
            fid: 1,
            offset: 0,
            count: 128,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut cw, NOTAG, tversion(16384, "9P2000")).await;
    let (tag, ename) = recv_error(&mut cr).await;
    assert_eq!(tag, NOTAG);
    assert_eq!(ename, errstr::EBOTCH);

    fs.gate.notify_one();
    let msg = recv(&mut cr).await;
    assert_eq!(msg.tag, 9);
    assert_eq!(msg.body, FCall::RRead { data: Data(b"slow".to_vec()) });
}

#[tokio::test]
async fn renegotiated_msize_accepts_larger_frames() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, NOTAG, tversion(65536, "9P2000")).await;
    assert_eq!(
        recv(&mut cr).await.body,
        FCall::RVersion {
            msize: 65536,
            version: "9P2000".to_owned(),
        }
    );

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["data"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::WRITE }).await;
    recv(&mut cr).await;

    // larger than the pre-negotiation frame limit
    send(
        &mut cw,
        4,
        FCall::TWrite {
            fid: 1,
            offset: 0,
            data: Data(vec![7; 20000]),
        },
    )
    .await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::RWrite { count: 20000 });
}

#[tokio::test]
async fn attach_and_duplicate_fid() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::RAttach { qid: dir_qid(1) });

    send(&mut cw, 2, tattach(0, "glenda", "")).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EDUPFID);
}

#[tokio::test]
async fn attach_unknown_afid_reverts_fid() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(
        &mut cw,
        1,
        FCall::TAttach {
            fid: 3,
            afid: 42,
            uname: "glenda".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EUNKNOWNFID);

    // the fid allocation was rolled back
    send(&mut cw, 2, tattach(3, "glenda", "")).await;
    assert_eq!(recv(&mut cr).await.body, FCall::RAttach { qid: dir_qid(1) });
}

#[tokio::test]
async fn auth_not_required_reverts_afid() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    for tag in 1..3 {
        send(
            &mut cw,
            tag,
            FCall::TAuth {
                afid: 9,
                uname: "glenda".to_owned(),
                aname: String::new(),
            },
        )
        .await;
        let (_, ename) = recv_error(&mut cr).await;
        // were the afid left behind, the retry would say "duplicate fid"
        assert_eq!(ename, errstr::ENOAUTH);
    }
}

#[tokio::test]
async fn duplicate_tag() {
    let fs = TestFs::new();
    let ((mut cr, mut cw), _h) = start(Srv::new(fs.clone()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["slow"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    recv(&mut cr).await;

    let tread = FCall::TRead {
        fid: 1,
        offset: 0,
        count: 128,
    };
    send(&mut cw, 7, tread.clone()).await;
    send(&mut cw, 7, tread).await;

    let (tag, ename) = recv_error(&mut cr).await;
    assert_eq!(tag, 7);
    assert_eq!(ename, errstr::EDUPTAG);

    // the in-flight request was not disturbed
    fs.gate.notify_one();
    let msg = recv(&mut cr).await;
    assert_eq!(msg.tag, 7);
    assert_eq!(msg.body, FCall::RRead { data: Data(b"slow".to_vec()) });
}

#[tokio::test]
async fn flush_is_ordered_after_target() {
    let fs = TestFs::new();
    let ((mut cr, mut cw), _h) = start(Srv::new(fs.clone()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["slow"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    recv(&mut cr).await;

    send(
        &mut cw,
        5,
        FCall::TRead {
            fid: 1,
            offset: 0,
            count: 128,
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&mut cw, 6, FCall::TFlush { oldtag: 5 }).await;

    // neither reply may appear while the target is stalled
    assert!(
        timeout(Duration::from_millis(100), recv(&mut cr)).await.is_err(),
        "Rflush overtook its target"
    );

    fs.gate.notify_one();
    let first = recv(&mut cr).await;
    assert_eq!(first.tag, 5);
    assert_eq!(first.body, FCall::RRead { data: Data(b"slow".to_vec()) });
    let second = recv(&mut cr).await;
    assert_eq!(second.tag, 6);
    assert_eq!(second.body, FCall::RFlush);

    assert_eq!(fs.flushed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn flush_of_absent_or_own_tag_is_immediate() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 4, FCall::TFlush { oldtag: 999 }).await;
    let msg = recv(&mut cr).await;
    assert_eq!((msg.tag, msg.body), (4, FCall::RFlush));

    send(&mut cw, 5, FCall::TFlush { oldtag: 5 }).await;
    let msg = recv(&mut cr).await;
    assert_eq!((msg.tag, msg.body), (5, FCall::RFlush));
}

#[tokio::test]
async fn partial_walk_reports_success_and_reverts_newfid() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    send(&mut cw, 2, twalk(0, 1, &["b", "c", "zzz"])).await;
    let msg = recv(&mut cr).await;
    assert_eq!(
        msg.body,
        FCall::RWalk {
            wqids: vec![dir_qid(2), dir_qid(3)],
        }
    );

    // newfid must not have been bound
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EUNKNOWNFID);
}

#[tokio::test]
async fn walk_zero_progress_is_an_error() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    send(&mut cw, 2, twalk(0, 1, &["zzz"])).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::ENOTFOUND);

    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EUNKNOWNFID);
}

#[tokio::test]
async fn walk_clone_and_qid_tracking() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    // pure clone
    send(&mut cw, 2, twalk(0, 1, &[])).await;
    assert_eq!(recv(&mut cr).await.body, FCall::RWalk { wqids: vec![] });
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::ROpen { qid: dir_qid(1), iounit: 0 });

    // full walk leaves the new fid at the last wqid
    send(&mut cw, 4, twalk(0, 2, &["b"])).await;
    assert_eq!(
        recv(&mut cr).await.body,
        FCall::RWalk { wqids: vec![dir_qid(2)] }
    );
    send(&mut cw, 5, FCall::TOpen { fid: 2, mode: om::READ }).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::ROpen { qid: dir_qid(2), iounit: 0 });
}

#[tokio::test]
async fn walk_on_open_fid_is_refused() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, FCall::TOpen { fid: 0, mode: om::READ }).await;
    recv(&mut cr).await;

    send(&mut cw, 3, twalk(0, 1, &["b"])).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EOPENFID);
}

#[tokio::test]
async fn walk_in_non_directory() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["data"])).await;
    recv(&mut cr).await;

    send(&mut cw, 3, twalk(1, 2, &["x"])).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EWALKNODIR);
}

#[tokio::test]
async fn in_place_walk_single_step() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    send(&mut cw, 2, twalk(0, 0, &["b"])).await;
    assert_eq!(
        recv(&mut cr).await.body,
        FCall::RWalk { wqids: vec![dir_qid(2)] }
    );
    send(&mut cw, 3, FCall::TOpen { fid: 0, mode: om::READ }).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::ROpen { qid: dir_qid(2), iounit: 0 });
}

#[tokio::test]
async fn in_place_multi_step_walk_is_refused() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    send(&mut cw, 2, twalk(0, 0, &["b", "c"])).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EINPLACEWALK);

    // the fid survives the refusal
    send(&mut cw, 3, FCall::TOpen { fid: 0, mode: om::READ }).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::ROpen { qid: dir_qid(1), iounit: 0 });
}

#[tokio::test]
async fn open_state_machine() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    // read before open
    send(
        &mut cw,
        2,
        FCall::TRead {
            fid: 0,
            offset: 0,
            count: 16,
        },
    )
    .await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EBOTCH);

    // directories only open for reading
    send(&mut cw, 3, FCall::TOpen { fid: 0, mode: om::WRITE }).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EISDIR);

    send(&mut cw, 4, FCall::TOpen { fid: 0, mode: om::READ }).await;
    recv(&mut cr).await;

    // double open
    send(&mut cw, 5, FCall::TOpen { fid: 0, mode: om::READ }).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EBOTCH);
}

#[tokio::test]
async fn write_needs_write_mode() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["data"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    recv(&mut cr).await;

    send(
        &mut cw,
        4,
        FCall::TWrite {
            fid: 1,
            offset: 0,
            data: Data(b"x".to_vec()),
        },
    )
    .await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EBOTCH);
}

#[tokio::test]
async fn read_with_absurd_offset() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["data"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, FCall::TOpen { fid: 1, mode: om::READ }).await;
    recv(&mut cr).await;

    send(
        &mut cw,
        4,
        FCall::TRead {
            fid: 1,
            offset: !0,
            count: 16,
        },
    )
    .await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EBADOFFSET);
}

#[tokio::test]
async fn replies_interleave_across_tags() {
    let fs = TestFs::new();
    let ((mut cr, mut cw), _h) = start(Srv::new(fs.clone()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &["slow"])).await;
    recv(&mut cr).await;
    send(&mut cw, 3, twalk(0, 2, &["data"])).await;
    recv(&mut cr).await;
    send(&mut cw, 4, FCall::TOpen { fid: 1, mode: om::READ }).await;
    recv(&mut cr).await;
    send(&mut cw, 5, FCall::TOpen { fid: 2, mode: om::READ }).await;
    recv(&mut cr).await;

    send(
        &mut cw,
        10,
        FCall::TRead {
            fid: 1,
            offset: 0,
            count: 64,
        },
    )
    .await;
    send(
        &mut cw,
        11,
        FCall::TRead {
            fid: 2,
            offset: 0,
            count: 64,
        },
    )
    .await;

    // the fast read overtakes the stalled one
    let msg = recv(&mut cr).await;
    assert_eq!(msg.tag, 11);
    assert_eq!(
        msg.body,
        FCall::RRead {
            data: Data(b"hello, 9p world".to_vec()),
        }
    );

    fs.gate.notify_one();
    let msg = recv(&mut cr).await;
    assert_eq!(msg.tag, 10);
}

#[tokio::test]
async fn clunk_runs_destroy_hook() {
    let fs = TestFs::new();
    let ((mut cr, mut cw), handle) = start(Srv::new(fs.clone()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    send(&mut cw, 2, FCall::TClunk { fid: 0 }).await;
    assert_eq!(recv(&mut cr).await.body, FCall::RClunk);

    send(&mut cw, 3, FCall::TClunk { fid: 0 }).await;
    let (_, ename) = recv_error(&mut cr).await;
    assert_eq!(ename, errstr::EUNKNOWNFID);

    drop(cw);
    drop(cr);
    handle.await.unwrap().unwrap();
    assert_eq!(fs.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn teardown_destroys_surviving_fids() {
    let fs = TestFs::new();
    let ((mut cr, mut cw), handle) = start(Srv::new(fs.clone()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, twalk(0, 1, &[])).await;
    recv(&mut cr).await;

    drop(cw);
    drop(cr);
    handle.await.unwrap().unwrap();
    assert_eq!(fs.destroyed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn default_callbacks_prohibit() {
    let ((mut cr, mut cw), _h) = start(Srv::new(BareFs));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    send(
        &mut cw,
        2,
        FCall::TCreate {
            fid: 0,
            name: "x".to_owned(),
            perm: 0o644,
            mode: om::WRITE,
        },
    )
    .await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOCREATE);

    send(&mut cw, 3, twalk(0, 1, &["x"])).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOWALK);

    send(&mut cw, 4, FCall::TStat { fid: 0 }).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOSTAT);

    send(&mut cw, 5, twstat(0, &sentinel_stat())).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOWSTAT);

    send(&mut cw, 6, FCall::TRemove { fid: 0 }).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOREMOVE);

    // remove clunks even on failure
    send(&mut cw, 7, FCall::TRemove { fid: 0 }).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EUNKNOWNFID);
}

#[tokio::test]
async fn default_read_write_prohibit() {
    let ((mut cr, mut cw), _h) = start(Srv::new(BareFs));

    send(&mut cw, 1, tattach(0, "glenda", "file")).await;
    recv(&mut cr).await;
    send(&mut cw, 2, FCall::TOpen { fid: 0, mode: om::RDWR }).await;
    let msg = recv(&mut cr).await;
    assert_eq!(msg.body, FCall::ROpen { qid: file_qid(2), iounit: 0 });

    send(
        &mut cw,
        3,
        FCall::TRead {
            fid: 0,
            offset: 0,
            count: 16,
        },
    )
    .await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOREAD);

    send(
        &mut cw,
        4,
        FCall::TWrite {
            fid: 0,
            offset: 0,
            data: Data(b"x".to_vec()),
        },
    )
    .await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::ENOWRITE);
}

#[tokio::test]
async fn wstat_sentinel_rules() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    // all-sentinel stat reaches the callback
    send(&mut cw, 2, twstat(0, &sentinel_stat())).await;
    assert_eq!(recv(&mut cr).await.body, FCall::RWStat);

    // a name change alone is also fine
    let mut stat = sentinel_stat();
    stat.name = "renamed".to_owned();
    send(&mut cw, 3, twstat(0, &stat)).await;
    assert_eq!(recv(&mut cr).await.body, FCall::RWStat);

    let mut stat = sentinel_stat();
    stat.qid.path = 999;
    send(&mut cw, 4, twstat(0, &stat)).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EWSTATPATH);

    let mut stat = sentinel_stat();
    stat.qid.version = 7;
    send(&mut cw, 5, twstat(0, &stat)).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EWSTATVERS);

    let mut stat = sentinel_stat();
    stat.mode = dm::MOUNT | 0o644;
    send(&mut cw, 6, twstat(0, &stat)).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EWSTATMODE);

    // explicit qid.type disagreeing with the mode's high byte
    let mut stat = sentinel_stat();
    stat.mode = dm::DIR | 0o755;
    stat.qid.typ = QidType::FILE;
    send(&mut cw, 7, twstat(0, &stat)).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EWSTATMISMATCH);

    // turning the directory into a plain file
    let mut stat = sentinel_stat();
    stat.mode = 0o644;
    send(&mut cw, 8, twstat(0, &stat)).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EWSTATTYPE);

    // same attempt without a mode
    let mut stat = sentinel_stat();
    stat.qid.typ = QidType::FILE;
    send(&mut cw, 9, twstat(0, &stat)).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EWSTATTYPE);

    // mode changes allowed within the permitted bits
    let mut stat = sentinel_stat();
    stat.mode = dm::DIR | dm::APPEND | 0o700;
    send(&mut cw, 10, twstat(0, &stat)).await;
    assert_eq!(recv(&mut cr).await.body, FCall::RWStat);
}

#[tokio::test]
async fn wstat_malformed_stat() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, tattach(0, "glenda", "")).await;
    recv(&mut cr).await;

    let mut bytes = serialize::stat_to_bytes(&sentinel_stat());
    bytes.pop();
    send(&mut cw, 2, FCall::TWStat { fid: 0, stat: bytes }).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EBADDIR);
}

#[tokio::test]
async fn r_message_as_request() {
    let ((mut cr, mut cw), _h) = start(Srv::new(TestFs::new()));

    send(&mut cw, 1, FCall::RFlush).await;
    assert_eq!(recv_error(&mut cr).await.1, errstr::EUNKNOWNMSG);
}
