//! In-process transport: every slave runs on its own worker thread.

use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};

use crate::{traits::Slave, Command, Error, Request, Response, ResponseHandle};

use super::{serve, SlaveHandle, SlaveTransport};

/// Transport to a slave running on a dedicated worker thread.
///
/// Requests are queued on an unbounded channel and handled strictly in order. The queue is
/// closed once [`Command::Free`] has been sent, and requests after it fail as disconnected.
/// Dropping the transport joins the worker.
pub struct LocalTransport {
    name: String,
    cmd_tx: Option<Sender<(Request, ResponseHandle)>>,
    thread: Option<JoinHandle<()>>,
}

impl LocalTransport {
    /// Start a worker thread for `slave` and return it ready for registration.
    pub fn spawn<S: Slave + 'static>(slave: S) -> SlaveHandle {
        let description = slave.description();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();

        let thread = thread::Builder::new()
            .name(format!("slave-{}", description.name))
            .spawn(move || worker_main(slave, cmd_rx));

        let transport = match thread {
            Ok(thread) => Self {
                name: description.name.clone(),
                cmd_tx: Some(cmd_tx),
                thread: Some(thread),
            },
            Err(err) => {
                log::error!("Failed to spawn worker for {}: {err}", description.name);
                // Every send reports the slave as disconnected.
                Self {
                    name: description.name.clone(),
                    cmd_tx: None,
                    thread: None,
                }
            }
        };

        SlaveHandle {
            description,
            transport: Box::new(transport),
        }
    }
}

impl SlaveTransport for LocalTransport {
    fn send(&mut self, request: Request, replies: ResponseHandle) -> Result<(), Error> {
        let slave = replies.slave();
        let free = matches!(request.command, Command::Free);
        let cmd_tx = self.cmd_tx.as_ref().ok_or_else(|| Error::Disconnected {
            slave,
            reason: format!("worker for {} is not running", self.name),
        })?;
        cmd_tx
            .send((request, replies))
            .map_err(|_| Error::Disconnected {
                slave,
                reason: format!("worker for {} has exited", self.name),
            })?;
        if free {
            self.cmd_tx = None;
        }
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        drop(self.cmd_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Worker for {} panicked", self.name);
            }
        }
    }
}

/// Handle requests until the queue closes or the slave is freed.
fn worker_main<S: Slave>(mut slave: S, cmd_rx: Receiver<(Request, ResponseHandle)>) {
    while let Ok((Request { id, command }, replies)) = cmd_rx.recv() {
        let free = matches!(command, Command::Free);

        let reply = panic::catch_unwind(AssertUnwindSafe(|| serve(&mut slave, command)));
        match reply {
            Ok(reply) => replies.on_response(Response { id, reply }),
            Err(_) => {
                replies.on_disconnect("slave panicked while handling a request");
                break;
            }
        }

        if free {
            break;
        }
    }
    // Anything still queued will never be answered.
    let queued = cmd_rx.try_iter().collect::<Vec<_>>();
    drop(cmd_rx);
    for (_, replies) in queued {
        replies.on_disconnect("slave stopped serving requests");
    }
}
