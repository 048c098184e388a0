use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::message::{EventMessage, MethodId};
use crate::session::{
    ConfirmationCallback, DeviceSession, MethodCallback, PolledSession, SendEventError, Session,
    SessionOption, DOWORK_LOOP_NUM, WORK_INTERVAL,
};

fn lock<S>(session: &Mutex<S>) -> MutexGuard<'_, S> {
    // A panicking handler must not wedge shutdown
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a [`PolledSession`] on a background worker thread
///
/// The worker starts with the first registered handler or submitted event, so options set
/// right after creation apply before any I/O. From then on it pumps the session until this
/// value is dropped, and method handlers and confirmation callbacks run on the worker thread.
/// Dropping stops and joins the worker, then pumps the session [`DOWORK_LOOP_NUM`] more times
/// so queued sends are flushed before the inner session is destroyed.
#[derive(Debug)]
pub struct ThreadedSession<S: PolledSession + Send + 'static> {
    inner: Arc<Mutex<S>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<S: PolledSession + Send + 'static> ThreadedSession<S> {
    /// Wrap `session`. No pumping happens until the worker is started.
    pub fn new(session: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            running: Arc::new(AtomicBool::new(true)),
            worker: None,
        }
    }

    /// Whether the worker thread has been started
    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    fn start_worker(&mut self) -> crate::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let running = self.running.clone();
        let worker = thread::Builder::new()
            .name("iothub-worker".to_owned())
            .spawn(move || {
                trace!("Session worker started");
                while running.load(Ordering::Acquire) {
                    lock(&inner).do_work();
                    thread::sleep(WORK_INTERVAL);
                }
                trace!("Session worker stopped");
            })?;
        self.worker = Some(worker);
        Ok(())
    }
}

impl<S: PolledSession + Send + 'static> DeviceSession for ThreadedSession<S> {
    fn send_event_async(
        &mut self,
        message: EventMessage,
        on_confirm: ConfirmationCallback,
    ) -> Result<(), SendEventError> {
        lock(&self.inner).send_event_async(message, on_confirm)?;
        if let Err(err) = self.start_worker() {
            // The event stays queued and is confirmed when the session is dropped
            error!("Failed to start session worker: {}", err);
        }
        Ok(())
    }

    fn respond_to_method(
        &mut self,
        method_id: MethodId,
        body: &[u8],
        status: i32,
    ) -> crate::Result<()> {
        lock(&self.inner).respond_to_method(method_id, body, status)
    }
}

impl<S: PolledSession + Send + 'static> Session for ThreadedSession<S> {
    fn set_option(&mut self, option: SessionOption) -> crate::Result<()> {
        lock(&self.inner).set_option(option)
    }

    fn register_method_handler(&mut self, callback: MethodCallback) -> crate::Result<()> {
        lock(&self.inner).register_method_handler(callback)?;
        self.start_worker()
    }
}

impl<S: PolledSession + Send + 'static> Drop for ThreadedSession<S> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Session worker panicked");
            }
        }

        let mut session = lock(&self.inner);
        for _ in 0..DOWORK_LOOP_NUM {
            session.do_work();
            thread::sleep(WORK_INTERVAL);
        }
    }
}
