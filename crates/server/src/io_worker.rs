//! The single thread that touches region files.
//!
//! [`IoWorker`] is a cheap, cloneable handle. Every call enqueues a command
//! immediately and returns a future for its result, so the order in which
//! calls are made is the order in which the worker sees them.
//!
//! The worker drains whatever is queued, applies loads against the pending
//! write map, and then writes the pending map out in insertion order. A store
//! for a tile that already has a pending store replaces the pending document.

use std::future::Future;

use indexmap::IndexMap;
use regionstore_engine::storage::region_cache::RegionCache;
use regionstore_engine::{ChunkPos, Document, RegionPos, StorageError};
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

enum Command {
    Load {
        pos: ChunkPos,
        reply: Reply<Option<Document>>,
    },
    Store {
        pos: ChunkPos,
        doc: Option<Document>,
        reply: Reply<()>,
    },
    Chunks {
        region: RegionPos,
        reply: Reply<Vec<ChunkPos>>,
    },
    Synchronize {
        flush: bool,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

struct PendingStore {
    doc: Option<Document>,
    reply: Reply<()>,
}

#[derive(Clone)]
pub struct IoWorker {
    tx: mpsc::UnboundedSender<Command>,
}

impl IoWorker {
    /// Start a worker that owns `cache`. Must be called inside a tokio runtime.
    pub fn spawn(cache: RegionCache) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || run(cache, rx));
        Self { tx }
    }

    /// Raw (unmigrated) document for `pos`, if stored.
    pub fn load(
        &self,
        pos: ChunkPos,
    ) -> impl Future<Output = Result<Option<Document>, StorageError>> + Send + use<> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Load { pos, reply }, rx)
    }

    /// Queue a write, or a deletion when `doc` is `None`. Resolves once the
    /// document has been written, or superseded by a later store.
    pub fn store(
        &self,
        pos: ChunkPos,
        doc: Option<Document>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + use<> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Store { pos, doc, reply }, rx)
    }

    /// Chunks present in `region`, including pending stores.
    pub fn chunks(
        &self,
        region: RegionPos,
    ) -> impl Future<Output = Result<Vec<ChunkPos>, StorageError>> + Send + use<> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Chunks { region, reply }, rx)
    }

    /// Write out everything queued so far; with `flush`, also sync open files.
    pub fn synchronize(
        &self,
        flush: bool,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + use<> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Synchronize { flush, reply }, rx)
    }

    /// Drain pending writes, close every region file and stop the worker.
    pub fn close(&self) -> impl Future<Output = Result<(), StorageError>> + Send + use<> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Close { reply }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn request<T: Send>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, StorageError>>,
    ) -> impl Future<Output = Result<T, StorageError>> + Send + use<T> {
        let sent = self.tx.send(command).is_ok();
        async move {
            if !sent {
                return Err(StorageError::WorkerClosed);
            }
            rx.await.map_err(|_| StorageError::WorkerClosed)?
        }
    }
}

fn run(mut cache: RegionCache, mut rx: mpsc::UnboundedReceiver<Command>) {
    tracing::debug!("I/O worker started for {}", cache.dir().display());
    let mut pending: IndexMap<ChunkPos, PendingStore> = IndexMap::new();

    while let Some(first) = rx.blocking_recv() {
        let mut next = Some(first);
        while let Some(command) = next.take() {
            match command {
                Command::Load { pos, reply } => {
                    let result = match pending.get(&pos) {
                        Some(store) => Ok(store.doc.clone()),
                        None => cache.read(pos),
                    };
                    let _ = reply.send(result);
                }
                Command::Store { pos, doc, reply } => {
                    if let Some(old) = pending.insert(pos, PendingStore { doc, reply }) {
                        // Superseded: the newer document is what ends up on disk.
                        let _ = old.reply.send(Ok(()));
                    }
                }
                Command::Chunks { region, reply } => {
                    write_pending(&mut cache, &mut pending);
                    let _ = reply.send(cache.chunks_in(region));
                }
                Command::Synchronize { flush, reply } => {
                    write_pending(&mut cache, &mut pending);
                    let result = if flush { cache.flush() } else { Ok(()) };
                    let _ = reply.send(result);
                }
                Command::Close { reply } => {
                    write_pending(&mut cache, &mut pending);
                    let _ = reply.send(cache.close());
                    rx.close();
                    // Commands that raced with close see a dropped reply.
                    while rx.try_recv().is_ok() {}
                    tracing::debug!("I/O worker stopped");
                    return;
                }
            }
            next = rx.try_recv().ok();
        }
        write_pending(&mut cache, &mut pending);
    }

    // Every handle was dropped without an explicit close.
    write_pending(&mut cache, &mut pending);
    if let Err(e) = cache.close() {
        tracing::error!("Closing region files after worker shutdown failed: {}", e);
    }
}

fn write_pending(cache: &mut RegionCache, pending: &mut IndexMap<ChunkPos, PendingStore>) {
    for (pos, store) in pending.drain(..) {
        let result = cache.write(pos, store.doc.as_ref());
        if let Err(e) = &result {
            tracing::error!("Failed to store chunk [{}, {}]: {}", pos.x, pos.z, e);
        }
        let _ = store.reply.send(result);
    }
}
