#![allow(dead_code)]

//! Client-side harness for driving a server over an in-memory stream.

use srv9p::serialize;
use srv9p::srv::{Filesystem, Srv};
use srv9p::{FCall, Msg};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub type Client = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// Spawn `srv` over an in-memory duplex stream and hand back the client end.
pub fn start<Fs: Filesystem + 'static>(srv: Srv<Fs>) -> (Client, JoinHandle<srv9p::Result<()>>) {
    let (client, server) = tokio::io::duplex(1 << 20);
    let (sr, sw) = tokio::io::split(server);
    let handle = tokio::spawn(srv.serve(sr, sw));
    (tokio::io::split(client), handle)
}

/// Frame and send one T-message.
pub async fn send(w: &mut WriteHalf<DuplexStream>, tag: u16, body: FCall) {
    let msg = Msg { tag, body };
    let mut payload = Vec::new();
    serialize::write_msg(&mut payload, &msg).unwrap();
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32 + 4).to_le_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await.unwrap();
}

/// Receive one framed R-message.
pub async fn recv(r: &mut ReadHalf<DuplexStream>) -> Msg {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.unwrap();
    let len = u32::from_le_bytes(len) as usize;
    let mut buf = vec![0u8; len - 4];
    r.read_exact(&mut buf).await.unwrap();
    serialize::read_msg(&mut Cursor::new(buf)).unwrap()
}

/// Receive a reply and unwrap its Rerror string.
pub async fn recv_error(r: &mut ReadHalf<DuplexStream>) -> (u16, String) {
    let msg = recv(r).await;
    match msg.body {
        FCall::RError { ename } => (msg.tag, ename),
        other => panic!("expected Rerror, got {other:?}"),
    }
}

/// Parse a directory-read payload into its stat entries.
pub fn parse_dir(data: &[u8]) -> Vec<srv9p::Stat> {
    let mut stats = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let size = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize + 2;
        stats.push(serialize::stat_from_bytes(&data[pos..pos + size]).unwrap());
        pos += size;
    }
    stats
}
