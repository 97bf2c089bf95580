//! Framed file and directory transfer.
//!
//! One transfer stream has a fixed sender and receiver. The sender offers,
//! the receiver gates on its user, then files flow one at a time: header,
//! chunks, done, and a per-file ack that doubles as the sender's commit
//! point. Integrity rides on a 128-bit seeded xxh3 digest of the whole
//! file; a mismatch nacks the file and the sender retries it bounded
//! times with backoff before moving on.

use std::future::Future;
use std::path::{Component, Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::config::{CHUNK_SIZE, SEND_FILE_ATTEMPTS, SEND_RETRY_BACKOFF};
use crate::proto::wire::{
    FileHeader, Offer, FRAME_ACCEPT, FRAME_CHUNK, FRAME_ERROR, FRAME_FILE_ACK, FRAME_FILE_DONE,
    FRAME_FILE_HDR, FRAME_FILE_NACK, FRAME_OFFER, FRAME_REJECT, FRAME_XFER_DONE, HASH_ALGO,
};
use crate::proto::{read_frame, write_frame, FrameError};

/// Errors on a transfer stream. All of them abandon the stream; the
/// session itself survives.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("peer rejected the transfer")]
    PeerRejected,

    #[error("unexpected frame 0x{0:02x}")]
    UnexpectedFrame(u8),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unsafe path in file header: {0:?}")]
    UnsafePath(String),

    #[error("not a regular file: {0}")]
    NotRegular(PathBuf),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// What the sender was asked to ship.
#[derive(Debug, Clone)]
pub enum SendSource {
    File(PathBuf),
    Dir(PathBuf),
}

/// Sender-side summary, printed when the stream closes.
#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: Vec<String>,
    pub failed: Vec<String>,
    pub total_bytes: u64,
}

/// Receiver-side summary.
#[derive(Debug, Default)]
pub struct RecvReport {
    pub accepted: bool,
    pub received: Vec<(String, u64)>,
    pub failed: Vec<String>,
}

/// Validates a header name as a clean relative path under the output
/// directory. Absolute paths, parent traversal, and empty names are
/// rejected.
pub fn sanitize_rel_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return None;
    }
    let mut clean = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => clean.push(c),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}

/// Seeded 128-bit digest of a whole file, streamed in chunk-sized reads.
pub async fn hash_file(path: &Path, seed: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Xxh3::with_seed(seed);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:032x}", hasher.digest128()))
}

/// One entry of a directory walk: absolute path, wire-relative name, size.
#[derive(Debug, Clone)]
struct FileEntry {
    abs: PathBuf,
    name: String,
    size: u64,
}

/// Collects all regular files under `root`, sorted by relative path so
/// both ends see a stable order.
fn walk_dir(root: &Path) -> std::io::Result<Vec<FileEntry>> {
    fn visit(dir: &Path, root: &Path, out: &mut Vec<FileEntry>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                visit(&path, root, out)?;
            } else if meta.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .expect("walked path is under root")
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push(FileEntry {
                    abs: path,
                    name: rel,
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

fn progress_bar(len: u64, label: &str, quiet: bool) -> ProgressBar {
    if quiet || len == 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template(
            "{msg:24!} {bytes:>10} / {total_bytes:10} [{bar:32}] {bytes_per_sec} eta {eta}",
        )
        .expect("static progress template")
        .progress_chars("=> "),
    );
    pb.set_message(label.to_string());
    pb
}

/// Runs the sending half of one transfer stream.
pub async fn run_sender<R, W>(
    recv: &mut R,
    send: &mut W,
    source: &SendSource,
    seed: u64,
    quiet: bool,
) -> Result<SendReport, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Assemble the offer and the work list.
    let (offer, entries, dir_mode) = match source {
        SendSource::File(path) => {
            let meta = tokio::fs::metadata(path).await?;
            if !meta.is_file() {
                return Err(TransferError::NotRegular(path.clone()));
            }
            let entry = FileEntry {
                abs: path.clone(),
                name: base_name(path),
                size: meta.len(),
            };
            let offer = Offer {
                kind: "file".into(),
                name: entry.name.clone(),
                size: entry.size,
                files: None,
            };
            (offer, vec![entry], false)
        }
        SendSource::Dir(root) => {
            let entries = walk_dir(root)?;
            let total: u64 = entries.iter().map(|e| e.size).sum();
            let offer = Offer {
                kind: "dir".into(),
                name: base_name(root),
                size: total,
                files: Some(entries.len() as u64),
            };
            (offer, entries, true)
        }
    };

    write_frame(send, FRAME_OFFER, &serde_json::to_vec(&offer)?).await?;
    match read_frame(recv).await? {
        (FRAME_ACCEPT, _) => {}
        (FRAME_REJECT, _) => return Err(TransferError::PeerRejected),
        (other, _) => return Err(TransferError::UnexpectedFrame(other)),
    }

    let total_bar = progress_bar(offer.size, "TOTAL", quiet || !dir_mode);
    let mut report = SendReport::default();

    // In directory mode the relative path rides in the header; in file
    // mode the receiver just gets the base name.
    for entry in &entries {
        let expected = hash_file(&entry.abs, seed).await?;
        let bar = progress_bar(entry.size, &entry.name, quiet);

        let mut delivered = false;
        for attempt in 1..=SEND_FILE_ATTEMPTS {
            bar.set_position(0);
            send_one(send, entry, &expected, &bar, &total_bar, attempt > 1).await?;

            match read_frame(recv).await? {
                (FRAME_FILE_ACK, _) => {
                    delivered = true;
                    break;
                }
                (FRAME_FILE_NACK, _) => {
                    warn!(file = %entry.name, attempt, "receiver reported hash mismatch");
                    if attempt < SEND_FILE_ATTEMPTS {
                        tokio::time::sleep(SEND_RETRY_BACKOFF * attempt).await;
                    }
                }
                (FRAME_ERROR, payload) => {
                    bar.abandon();
                    return Err(TransferError::Remote(
                        String::from_utf8_lossy(&payload).into_owned(),
                    ));
                }
                (other, _) => {
                    bar.abandon();
                    return Err(TransferError::UnexpectedFrame(other));
                }
            }
        }
        bar.finish_and_clear();

        if delivered {
            report.sent.push(entry.name.clone());
            report.total_bytes += entry.size;
        } else {
            report.failed.push(entry.name.clone());
        }
    }

    write_frame(send, FRAME_XFER_DONE, b"").await?;
    total_bar.finish_and_clear();
    info!(
        sent = report.sent.len(),
        failed = report.failed.len(),
        bytes = report.total_bytes,
        "transfer finished"
    );
    Ok(report)
}

async fn send_one<W>(
    send: &mut W,
    entry: &FileEntry,
    expected_hash: &str,
    bar: &ProgressBar,
    total_bar: &ProgressBar,
    is_retry: bool,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let hdr = FileHeader {
        name: entry.name.clone(),
        size: entry.size,
        algo: HASH_ALGO.into(),
        hash: expected_hash.to_string(),
    };
    write_frame(send, FRAME_FILE_HDR, &serde_json::to_vec(&hdr)?).await?;

    let mut file = tokio::fs::File::open(&entry.abs).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_frame(send, FRAME_CHUNK, &buf[..n]).await?;
        bar.inc(n as u64);
        if !is_retry {
            total_bar.inc(n as u64);
        }
    }
    write_frame(send, FRAME_FILE_DONE, b"").await?;
    debug!(file = %entry.name, size = entry.size, "file sent");
    Ok(())
}

/// A file in flight on the receiving side.
struct ActiveFile {
    file: tokio::fs::File,
    path: PathBuf,
    name: String,
    expected_size: u64,
    expected_hash: String,
    algo: String,
    hasher: Xxh3,
    written: u64,
    bar: ProgressBar,
}

/// Receiver state machine: between files, or mid-file.
enum RecvState {
    Idle,
    Receiving(Box<ActiveFile>),
}

/// Runs the receiving half of one transfer stream.
///
/// `decide` is consulted once with the offer; the 30-second default-reject
/// deadline lives in the caller's closure so interactive and test callers
/// can differ.
pub async fn run_receiver<R, W, F, Fut>(
    recv: &mut R,
    send: &mut W,
    out_dir: &Path,
    seed: u64,
    quiet: bool,
    decide: F,
) -> Result<RecvReport, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(&Offer) -> Fut,
    Fut: Future<Output = bool>,
{
    let (typ, payload) = read_frame(recv).await?;
    if typ != FRAME_OFFER {
        return Err(TransferError::UnexpectedFrame(typ));
    }
    let offer: Offer = serde_json::from_slice(&payload)?;

    if !decide(&offer).await {
        write_frame(send, FRAME_REJECT, b"").await?;
        return Ok(RecvReport::default());
    }
    write_frame(send, FRAME_ACCEPT, b"").await?;

    let mut report = RecvReport {
        accepted: true,
        ..RecvReport::default()
    };
    let mut state = RecvState::Idle;

    loop {
        let (typ, payload) = read_frame(recv).await?;
        match (typ, &mut state) {
            (FRAME_FILE_HDR, RecvState::Idle) => {
                let hdr: FileHeader = serde_json::from_slice(&payload)?;
                let Some(rel) = sanitize_rel_path(&hdr.name) else {
                    let msg = format!("unsafe path {:?}", hdr.name);
                    let _ = write_frame(send, FRAME_ERROR, msg.as_bytes()).await;
                    return Err(TransferError::UnsafePath(hdr.name));
                };
                let dst = out_dir.join(rel);
                if let Some(parent) = dst.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        let _ = write_frame(send, FRAME_ERROR, e.to_string().as_bytes()).await;
                        return Err(e.into());
                    }
                }
                let file = match tokio::fs::File::create(&dst).await {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = write_frame(send, FRAME_ERROR, e.to_string().as_bytes()).await;
                        return Err(e.into());
                    }
                };
                let bar = progress_bar(hdr.size, &hdr.name, quiet);
                state = RecvState::Receiving(Box::new(ActiveFile {
                    file,
                    path: dst,
                    name: hdr.name,
                    expected_size: hdr.size,
                    expected_hash: hdr.hash,
                    algo: hdr.algo,
                    hasher: Xxh3::with_seed(seed),
                    written: 0,
                    bar,
                }));
            }

            (FRAME_CHUNK, RecvState::Receiving(active)) => {
                active.file.write_all(&payload).await?;
                active.hasher.update(&payload);
                active.written += payload.len() as u64;
                active.bar.inc(payload.len() as u64);
            }

            (FRAME_FILE_DONE, st) => {
                let RecvState::Receiving(active) = std::mem::replace(st, RecvState::Idle)
                else {
                    return Err(TransferError::UnexpectedFrame(FRAME_FILE_DONE));
                };
                let ActiveFile {
                    mut file,
                    path,
                    name,
                    expected_size,
                    expected_hash,
                    algo,
                    hasher,
                    written,
                    bar,
                } = *active;
                file.flush().await?;
                drop(file);
                bar.finish_and_clear();

                let got = format!("{:032x}", hasher.digest128());
                let ok = algo == HASH_ALGO && got == expected_hash && written == expected_size;
                if ok {
                    debug!(file = %name, size = written, "file verified");
                    // A retry that lands clears the file's earlier nacks.
                    report.failed.retain(|n| n != &name);
                    report.received.push((name, written));
                    write_frame(send, FRAME_FILE_ACK, b"").await?;
                } else {
                    warn!(
                        file = %name,
                        want = %expected_hash,
                        got = %got,
                        "integrity check failed, discarding"
                    );
                    let _ = tokio::fs::remove_file(&path).await;
                    report.failed.push(name);
                    write_frame(send, FRAME_FILE_NACK, b"").await?;
                }
            }

            (FRAME_XFER_DONE, _) => {
                // Only files that exhausted the sender's retries stay here.
                report.failed.sort();
                report.failed.dedup();
                info!(
                    received = report.received.len(),
                    failed = report.failed.len(),
                    "incoming transfer finished"
                );
                return Ok(report);
            }

            (FRAME_ERROR, _) => {
                return Err(TransferError::Remote(
                    String::from_utf8_lossy(&payload).into_owned(),
                ));
            }

            (other, _) => {
                // Includes a header arriving mid-file and chunks without a
                // header; the ordering guarantee rules both out.
                return Err(TransferError::UnexpectedFrame(other));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::duplex;

    const SEED: u64 = 0x5eed_1234_abcd_9999;

    /// Wires a sender and receiver together over in-memory pipes and runs
    /// both to completion.
    async fn transfer(
        source: SendSource,
        out_dir: PathBuf,
        accept: bool,
    ) -> (
        Result<SendReport, TransferError>,
        Result<RecvReport, TransferError>,
    ) {
        let (sender_io, receiver_io) = duplex(1 << 16);
        let (mut s_recv, mut s_send) = tokio::io::split(sender_io);
        let (mut r_recv, mut r_send) = tokio::io::split(receiver_io);

        let sender = tokio::spawn(async move {
            run_sender(&mut s_recv, &mut s_send, &source, SEED, true).await
        });
        let receiver = tokio::spawn(async move {
            run_receiver(&mut r_recv, &mut r_send, &out_dir, SEED, true, |_| async move {
                accept
            })
            .await
        });

        (sender.await.unwrap(), receiver.await.unwrap())
    }

    #[tokio::test]
    async fn single_file_roundtrip() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = src.path().join("hello.bin");
        let payload: Vec<u8> = (0..48 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (sent, recvd) = transfer(
            SendSource::File(path),
            dst.path().to_path_buf(),
            true,
        )
        .await;

        let sent = sent.unwrap();
        assert_eq!(sent.sent, vec!["hello.bin"]);
        assert!(sent.failed.is_empty());
        assert_eq!(sent.total_bytes, payload.len() as u64);

        let recvd = recvd.unwrap();
        assert!(recvd.accepted);
        assert_eq!(recvd.received, vec![("hello.bin".to_string(), payload.len() as u64)]);

        let out = std::fs::read(dst.path().join("hello.bin")).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn empty_file_transfers_with_zero_chunks() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = src.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let (sent, recvd) = transfer(SendSource::File(path), dst.path().to_path_buf(), true).await;
        assert_eq!(sent.unwrap().sent, vec!["empty.bin"]);
        let recvd = recvd.unwrap();
        assert_eq!(recvd.received, vec![("empty.bin".to_string(), 0)]);

        let meta = std::fs::metadata(dst.path().join("empty.bin")).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[tokio::test]
    async fn directory_with_nested_and_empty_files() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let root = src.path().join("root");
        std::fs::create_dir_all(root.join("sub/a")).unwrap();
        std::fs::write(root.join("sub/a/aa.txt"), b"deep content").unwrap();
        std::fs::write(root.join("sub/bb.txt"), b"bb").unwrap();
        std::fs::write(root.join("empty.bin"), b"").unwrap();

        let (sent, recvd) =
            transfer(SendSource::Dir(root.clone()), dst.path().to_path_buf(), true).await;

        let sent = sent.unwrap();
        assert_eq!(sent.sent.len(), 3);
        assert!(sent.failed.is_empty());

        let recvd = recvd.unwrap();
        assert_eq!(recvd.received.len(), 3);

        assert_eq!(
            std::fs::read(dst.path().join("sub/a/aa.txt")).unwrap(),
            b"deep content"
        );
        assert_eq!(std::fs::read(dst.path().join("sub/bb.txt")).unwrap(), b"bb");
        assert_eq!(std::fs::metadata(dst.path().join("empty.bin")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn rejection_closes_without_writing() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let path = src.path().join("secret.txt");
        std::fs::write(&path, b"nope").unwrap();

        let (sent, recvd) =
            transfer(SendSource::File(path), dst.path().to_path_buf(), false).await;

        assert!(matches!(sent, Err(TransferError::PeerRejected)));
        let recvd = recvd.unwrap();
        assert!(!recvd.accepted);
        assert!(std::fs::read_dir(dst.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn receiver_nacks_wrong_hash_and_deletes_file() {
        let dst = TempDir::new().unwrap();
        let (mut peer, receiver_io) = duplex(1 << 16);
        let (mut r_recv, mut r_send) = tokio::io::split(receiver_io);

        let out = dst.path().to_path_buf();
        let receiver = tokio::spawn(async move {
            run_receiver(&mut r_recv, &mut r_send, &out, SEED, true, |_| async { true }).await
        });

        // Offer / accept.
        let offer = Offer {
            kind: "file".into(),
            name: "x.bin".into(),
            size: 4,
            files: None,
        };
        write_frame(&mut peer, FRAME_OFFER, &serde_json::to_vec(&offer).unwrap())
            .await
            .unwrap();
        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_ACCEPT);

        // First attempt carries a deliberately wrong hash.
        let hdr = FileHeader {
            name: "x.bin".into(),
            size: 4,
            algo: HASH_ALGO.into(),
            hash: "f".repeat(32),
        };
        write_frame(&mut peer, FRAME_FILE_HDR, &serde_json::to_vec(&hdr).unwrap())
            .await
            .unwrap();
        write_frame(&mut peer, FRAME_CHUNK, b"data").await.unwrap();
        write_frame(&mut peer, FRAME_FILE_DONE, b"").await.unwrap();

        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_FILE_NACK);
        assert!(!dst.path().join("x.bin").exists());

        // Second attempt with the correct digest is acked.
        let mut hasher = Xxh3::with_seed(SEED);
        hasher.update(b"data");
        let hdr = FileHeader {
            hash: format!("{:032x}", hasher.digest128()),
            ..hdr
        };
        write_frame(&mut peer, FRAME_FILE_HDR, &serde_json::to_vec(&hdr).unwrap())
            .await
            .unwrap();
        write_frame(&mut peer, FRAME_CHUNK, b"data").await.unwrap();
        write_frame(&mut peer, FRAME_FILE_DONE, b"").await.unwrap();

        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_FILE_ACK);
        write_frame(&mut peer, FRAME_XFER_DONE, b"").await.unwrap();

        let report = receiver.await.unwrap().unwrap();
        assert_eq!(report.received, vec![("x.bin".to_string(), 4)]);
        assert!(report.failed.is_empty());
        assert_eq!(std::fs::read(dst.path().join("x.bin")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn sender_retries_after_nack_then_succeeds() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("retry.bin");
        std::fs::write(&path, b"retry me").unwrap();

        let (sender_io, mut peer) = duplex(1 << 16);
        let (mut s_recv, mut s_send) = tokio::io::split(sender_io);

        let sender = tokio::spawn(async move {
            run_sender(
                &mut s_recv,
                &mut s_send,
                &SendSource::File(path),
                SEED,
                true,
            )
            .await
        });

        // Accept the offer.
        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_OFFER);
        write_frame(&mut peer, FRAME_ACCEPT, b"").await.unwrap();

        // Swallow the first delivery, nack it.
        loop {
            let (typ, _) = read_frame(&mut peer).await.unwrap();
            if typ == FRAME_FILE_DONE {
                break;
            }
            assert!(typ == FRAME_FILE_HDR || typ == FRAME_CHUNK);
        }
        write_frame(&mut peer, FRAME_FILE_NACK, b"").await.unwrap();

        // Second delivery arrives identical; ack it.
        let (typ, payload) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_FILE_HDR);
        let hdr: FileHeader = serde_json::from_slice(&payload).unwrap();
        assert_eq!(hdr.name, "retry.bin");
        loop {
            let (typ, _) = read_frame(&mut peer).await.unwrap();
            if typ == FRAME_FILE_DONE {
                break;
            }
            assert_eq!(typ, FRAME_CHUNK);
        }
        write_frame(&mut peer, FRAME_FILE_ACK, b"").await.unwrap();

        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_XFER_DONE);

        let report = sender.await.unwrap().unwrap();
        assert_eq!(report.sent, vec!["retry.bin"]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn sender_gives_up_after_three_nacks() {
        let src = TempDir::new().unwrap();
        let path = src.path().join("cursed.bin");
        std::fs::write(&path, b"cursed").unwrap();

        let (sender_io, mut peer) = duplex(1 << 16);
        let (mut s_recv, mut s_send) = tokio::io::split(sender_io);

        let sender = tokio::spawn(async move {
            run_sender(
                &mut s_recv,
                &mut s_send,
                &SendSource::File(path),
                SEED,
                true,
            )
            .await
        });

        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_OFFER);
        write_frame(&mut peer, FRAME_ACCEPT, b"").await.unwrap();

        for _ in 0..3 {
            loop {
                let (typ, _) = read_frame(&mut peer).await.unwrap();
                if typ == FRAME_FILE_DONE {
                    break;
                }
            }
            write_frame(&mut peer, FRAME_FILE_NACK, b"").await.unwrap();
        }

        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_XFER_DONE);

        let report = sender.await.unwrap().unwrap();
        assert!(report.sent.is_empty());
        assert_eq!(report.failed, vec!["cursed.bin"]);
    }

    #[tokio::test]
    async fn receiver_rejects_traversal_paths() {
        let dst = TempDir::new().unwrap();
        let (mut peer, receiver_io) = duplex(1 << 16);
        let (mut r_recv, mut r_send) = tokio::io::split(receiver_io);

        let out = dst.path().to_path_buf();
        let receiver = tokio::spawn(async move {
            run_receiver(&mut r_recv, &mut r_send, &out, SEED, true, |_| async { true }).await
        });

        let offer = Offer {
            kind: "file".into(),
            name: "evil".into(),
            size: 4,
            files: None,
        };
        write_frame(&mut peer, FRAME_OFFER, &serde_json::to_vec(&offer).unwrap())
            .await
            .unwrap();
        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_ACCEPT);

        let hdr = FileHeader {
            name: "../../etc/evil".into(),
            size: 4,
            algo: HASH_ALGO.into(),
            hash: "0".repeat(32),
        };
        write_frame(&mut peer, FRAME_FILE_HDR, &serde_json::to_vec(&hdr).unwrap())
            .await
            .unwrap();

        let (typ, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(typ, FRAME_ERROR);
        assert!(matches!(
            receiver.await.unwrap(),
            Err(TransferError::UnsafePath(_))
        ));
    }

    #[test]
    fn sanitize_accepts_clean_relative_paths() {
        assert_eq!(
            sanitize_rel_path("sub/a/aa.txt"),
            Some(PathBuf::from("sub/a/aa.txt"))
        );
        assert_eq!(sanitize_rel_path("plain.txt"), Some(PathBuf::from("plain.txt")));
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize_rel_path(""), None);
        assert_eq!(sanitize_rel_path("/etc/passwd"), None);
        assert_eq!(sanitize_rel_path("../up"), None);
        assert_eq!(sanitize_rel_path("a/../../b"), None);
        assert_eq!(sanitize_rel_path("./x"), None);
    }

    #[tokio::test]
    async fn seeded_hash_differs_from_unseeded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"same bytes").unwrap();
        let h1 = hash_file(&path, 1).await.unwrap();
        let h2 = hash_file(&path, 2).await.unwrap();
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 32);
    }
}
