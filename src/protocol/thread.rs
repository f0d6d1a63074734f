use std::{
    io,
    net::TcpStream,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, TrySendError},
    },
    thread,
};

use log::{debug, warn};

/// Serves one accepted connection until the peer goes away.
pub type ConnectionHandler = Arc<dyn Fn(TcpStream) + Send + Sync>;

/// Fixed set of workers serving accepted connections. Connections that find
/// every worker busy wait in a bounded backlog; once that is full,
/// [`ConnectionWorkers::dispatch`] hands the stream back to be refused.
pub struct ConnectionWorkers {
    workers: Vec<Worker>,
    queue: Option<mpsc::SyncSender<TcpStream>>,
    active: Arc<AtomicUsize>,
}

impl ConnectionWorkers {
    /// Starts `size` workers. `active` counts the connections being served
    /// right now and may be shared with observers.
    pub fn spawn(
        size: usize,
        backlog: usize,
        active: Arc<AtomicUsize>,
        handler: ConnectionHandler,
    ) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server needs at least one worker",
            ));
        }

        let (queue, receiver) = mpsc::sync_channel(backlog);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Worker::spawn(
                id,
                Arc::clone(&receiver),
                Arc::clone(&active),
                Arc::clone(&handler),
            )?);
        }

        Ok(Self {
            workers,
            queue: Some(queue),
            active,
        })
    }

    /// Queues `stream` for the next free worker. Gives the stream back when
    /// the backlog is full or the workers are gone.
    pub fn dispatch(&self, stream: TcpStream) -> Result<(), TcpStream> {
        let Some(queue) = &self.queue else {
            return Err(stream);
        };
        match queue.try_send(stream) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(stream)) | Err(TrySendError::Disconnected(stream)) => {
                Err(stream)
            }
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Connections currently held by a worker.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for ConnectionWorkers {
    /// Queued connections are still served before the workers exit.
    fn drop(&mut self) {
        drop(self.queue.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

/// Holds one slot of the active count for as long as a connection is served.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    fn spawn(
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
        active: Arc<AtomicUsize>,
        handler: ConnectionHandler,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("docwire-worker-{id}"))
            .spawn(move || {
                loop {
                    let next = match receiver.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(stream) = next else {
                        debug!("worker {id} disconnected");
                        break;
                    };

                    let _busy = Busy::enter(&active);
                    debug!("worker {id} serving {:?}", stream.peer_addr());
                    handler(stream);
                }
            })?;

        Ok(Self { id, thread })
    }
}
