use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rtrb::Consumer;

use crate::request::lock;
use crate::stack::{StackEntryPtr, Status};
use crate::{Command, FileRequest, RequestStatus, StreamerContext};

pub(crate) enum SchedulerMsg {
    Request(FileRequest),
    Suspend,
    Resume,
}

/// Drives the streaming stack on its own thread.
pub(crate) struct Scheduler {
    stack: StackEntryPtr,
    context: Arc<StreamerContext>,

    from_client_rx: Receiver<SchedulerMsg>,
    close_signal_rx: Consumer<()>,

    suspended: bool,
    run: bool,
    poll_interval: Duration,
}

impl Scheduler {
    pub(crate) fn spawn(
        stack: StackEntryPtr,
        context: Arc<StreamerContext>,
        poll_interval: Duration,
        from_client_rx: Receiver<SchedulerMsg>,
        close_signal_rx: Consumer<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(String::from("sluice-scheduler"))
            .spawn(move || {
                Scheduler::run(Self {
                    stack,
                    context,
                    from_client_rx,
                    close_signal_rx,
                    suspended: false,
                    run: true,
                    poll_interval,
                });
            })
    }

    fn run(mut self) {
        profiling::register_thread!("Streamer scheduler");
        log::debug!("Scheduler started.");

        while self.run {
            profiling::scope!("scheduler_tick");

            // Check for close signal.
            if self.close_signal_rx.pop().is_ok() {
                break;
            }

            let mut did_work = false;
            while let Ok(msg) = self.from_client_rx.try_recv() {
                self.handle_msg(msg);
                did_work = true;
            }

            did_work |= self.queue_prepared_requests();
            did_work |= lock(&self.stack).execute_requests();
            did_work |= self.context.finalize_completed_requests();

            if did_work {
                self.update_estimates();
                continue;
            }

            match self.from_client_rx.recv_timeout(self.poll_interval) {
                Ok(msg) => self.handle_msg(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!("Streamer went away without closing the scheduler.");
                    self.run = false;
                }
            }
        }

        self.shutdown();
    }

    fn handle_msg(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Request(request) => self.prepare_request(request),
            SchedulerMsg::Suspend => {
                log::debug!("Scheduler suspended.");
                self.suspended = true;
            }
            SchedulerMsg::Resume => {
                log::debug!("Scheduler resumed.");
                self.suspended = false;
            }
        }
    }

    fn prepare_request(&mut self, request: FileRequest) {
        match request.command() {
            Command::Cancel(_)
            | Command::Reschedule(_)
            | Command::Flush(_)
            | Command::FlushAll(_)
            | Command::Report(_)
            | Command::Custom(_) => self.context.push_prepared_request(request),
            Command::Read(_)
            | Command::CreateDedicatedCache(_)
            | Command::DestroyDedicatedCache(_) => lock(&self.stack).prepare_request(request),
        }
    }

    /// Hand prepared requests to the stack while it has room for them.
    fn queue_prepared_requests(&mut self) -> bool {
        let mut did_work = false;

        while !self.suspended {
            let mut status = Status::default();
            lock(&self.stack).update_status(&mut status);
            if status.num_available_slots <= 0 {
                break;
            }

            let request = match self.context.pop_prepared_request_by(scheduling_order) {
                Some(request) => request,
                None => break,
            };

            self.queue_request(request);
            did_work = true;
        }

        did_work
    }

    fn queue_request(&mut self, mut request: FileRequest) {
        match request.command() {
            Command::Cancel(data) => {
                let target = data.target.clone();

                let prepared = self.context.take_prepared_requests();
                let (canceled, rest): (VecDeque<FileRequest>, VecDeque<FileRequest>) =
                    prepared.into_iter().partition(|r| r.works_on(&target));
                self.context.restore_prepared_requests(rest);

                if canceled.is_empty() {
                    request.set_status(RequestStatus::Queued);
                    lock(&self.stack).queue_request(request);
                } else {
                    for mut target in canceled {
                        target.set_status(RequestStatus::Canceled);
                        self.context.mark_request_as_completed(target);
                    }
                    request.set_status(RequestStatus::Completed);
                    self.context.mark_request_as_completed(request);
                }
            }
            Command::Reschedule(data) => {
                let (target, deadline, priority) =
                    (data.target.clone(), data.new_deadline, data.new_priority);

                let mut prepared = self.context.take_prepared_requests();
                for r in prepared.iter_mut().filter(|r| r.works_on(&target)) {
                    r.set_deadline(deadline);
                    r.set_priority(priority);
                }
                self.context.restore_prepared_requests(prepared);

                // Requests that are already queued keep their place.
                request.set_status(RequestStatus::Completed);
                self.context.mark_request_as_completed(request);
            }
            _ => {
                request.set_status(RequestStatus::Queued);
                lock(&self.stack).queue_request(request);
            }
        }
    }

    fn update_estimates(&mut self) {
        profiling::scope!("update_estimates");

        let now = Instant::now();
        let prepared = self.context.take_prepared_requests();
        {
            let pending: Vec<&FileRequest> = prepared.iter().collect();
            lock(&self.stack).update_completion_estimates(now, &[], &pending);
        }
        self.context.restore_prepared_requests(prepared);
    }

    fn shutdown(self) {
        // Anything that wasn't queued yet is canceled when it's dropped.
        while let Ok(msg) = self.from_client_rx.try_recv() {
            drop(msg);
        }
        let prepared = self.context.take_prepared_requests();
        let num_canceled = prepared.len();
        drop(prepared);

        self.context.finalize_completed_requests();

        log::debug!(
            "Scheduler stopped, {} prepared requests were canceled.",
            num_canceled
        );
    }
}

/// Non-read commands go first, then higher priorities, then earlier deadlines.
/// Requests without a deadline go after those with one.
pub(crate) fn scheduling_order(a: &FileRequest, b: &FileRequest) -> Ordering {
    a.command()
        .is_read()
        .cmp(&b.command().is_read())
        .then_with(|| b.priority().cmp(&a.priority()))
        .then_with(|| match (a.deadline(), b.deadline()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}
