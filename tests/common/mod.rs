#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use iothub_device_method::dispatcher::RunFlag;
use iothub_device_method::{
    ConfirmationCallback, ConfirmationResult, DeviceSession, Error, EventMessage, MethodCallback,
    MethodId, MethodInvocation, PolledSession, SendEventError, Session, SessionOption,
};

/// Everything a [`FakeSession`] observed
#[derive(Debug, Default)]
pub struct Journal {
    pub pumps: usize,
    pub pumps_after_stop: usize,
    pub sent: Vec<Vec<u8>>,
    pub responses: Vec<(String, Vec<u8>, i32)>,
    pub confirmations: Vec<(ConfirmationResult, Vec<u8>)>,
    pub options: Vec<SessionOption>,
    pub dispatch_threads: Vec<ThreadId>,
    pub registered: usize,
}

/// In-memory polled session. Each pump confirms the sends queued before it and then
/// delivers at most one queued method invocation.
pub struct FakeSession {
    pub journal: Arc<Mutex<Journal>>,
    pub run: RunFlag,
    pub incoming: VecDeque<MethodInvocation>,
    /// Pumps that pass before the first invocation is delivered
    pub quiet_pumps: usize,
    pub reject_registration: bool,
    pub reject_options: bool,
    pub reject_sends: bool,
    callback: Option<MethodCallback>,
    pending: Vec<(EventMessage, ConfirmationCallback)>,
}

impl FakeSession {
    pub fn new(run: &RunFlag) -> Self {
        Self {
            journal: Arc::new(Mutex::new(Journal::default())),
            run: run.clone(),
            incoming: VecDeque::new(),
            quiet_pumps: 0,
            reject_registration: false,
            reject_options: false,
            reject_sends: false,
            callback: None,
            pending: Vec::new(),
        }
    }

    pub fn with_invocation(mut self, name: &str, payload: &[u8], request_id: &str) -> Self {
        self.incoming.push_back(MethodInvocation::new(
            name,
            payload.to_vec(),
            MethodId::new(request_id),
        ));
        self
    }

    pub fn journal(&self) -> Arc<Mutex<Journal>> {
        self.journal.clone()
    }

    fn complete(&mut self, result: ConfirmationResult) {
        for (message, on_confirm) in self.pending.drain(..) {
            self.journal
                .lock()
                .unwrap()
                .confirmations
                .push((result, message.body.clone()));
            on_confirm(result, message);
        }
    }
}

impl DeviceSession for FakeSession {
    fn send_event_async(
        &mut self,
        message: EventMessage,
        on_confirm: ConfirmationCallback,
    ) -> Result<(), SendEventError> {
        if self.reject_sends {
            return Err(SendEventError {
                message,
                reason: "rejected by fake".to_owned(),
            });
        }
        self.journal.lock().unwrap().sent.push(message.body.clone());
        self.pending.push((message, on_confirm));
        Ok(())
    }

    fn respond_to_method(
        &mut self,
        method_id: MethodId,
        body: &[u8],
        status: i32,
    ) -> iothub_device_method::Result<()> {
        self.journal
            .lock()
            .unwrap()
            .responses
            .push((method_id.as_str().to_owned(), body.to_vec(), status));
        Ok(())
    }
}

impl Session for FakeSession {
    fn set_option(&mut self, option: SessionOption) -> iothub_device_method::Result<()> {
        self.journal.lock().unwrap().options.push(option.clone());
        if self.reject_options {
            return Err(Error::Option {
                name: option.name(),
                reason: "rejected by fake".to_owned(),
            });
        }
        Ok(())
    }

    fn register_method_handler(
        &mut self,
        callback: MethodCallback,
    ) -> iothub_device_method::Result<()> {
        if self.reject_registration {
            return Err(Error::NotConnected);
        }
        self.journal.lock().unwrap().registered += 1;
        self.callback = Some(callback);
        Ok(())
    }
}

impl PolledSession for FakeSession {
    fn do_work(&mut self) {
        let pumps = {
            let mut journal = self.journal.lock().unwrap();
            journal.pumps += 1;
            if !self.run.is_running() {
                journal.pumps_after_stop += 1;
            }
            journal.pumps
        };

        self.complete(ConfirmationResult::Ok);

        if pumps <= self.quiet_pumps {
            return;
        }

        if let Some(mut callback) = self.callback.take() {
            if let Some(invocation) = self.incoming.pop_front() {
                self.journal
                    .lock()
                    .unwrap()
                    .dispatch_threads
                    .push(thread::current().id());
                callback.dispatch(self, invocation);
            }
            self.callback = Some(callback);
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.complete(ConfirmationResult::BecauseDestroy);
    }
}
