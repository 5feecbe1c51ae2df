//! State machine for event driven socket I/O.
//!
//! A queue owns a fixed arena of event slots threaded onto three lists:
//! newly enqueued events awaiting their init callback, events waiting for
//! readiness or a timeout, and free slots. Exactly one thread drains a
//! queue; other threads hand events over through an [`EventQueueHandle`]
//! and interrupt a blocked poll with [`EventQueueHandle::trigger`].

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Why an event callback is being invoked, and what it may wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockWhen {
    /// Always delivered first, right after enqueue.
    Init,
    Read,
    Write,
    Exception,
    Timeout,
    /// Always delivered last, when the queue shuts down.
    Exit,
}

const EV_READ: u8 = 0x01;
const EV_WRITE: u8 = 0x02;
const EV_EXCEPTION: u8 = 0x04;

fn when_bit(when: SockWhen) -> u8 {
    match when {
        SockWhen::Read => EV_READ,
        SockWhen::Write => EV_WRITE,
        SockWhen::Exception => EV_EXCEPTION,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Unset,
    Wait,
    Done,
}

/// Handed to the callback so it can (re)arm its wait conditions. Arming
/// neither events nor a timeout marks the event done.
pub struct EventControl {
    events: u8,
    timeout: Option<Instant>,
    status: Status,
}

impl EventControl {
    /// Waits for `when` (one of read/write/exception), optionally bounded
    /// by an absolute deadline. A `None` deadline keeps the previous one.
    pub fn wait(&mut self, when: SockWhen, timeout: Option<Instant>) {
        self.events = when_bit(when);
        if let Some(timeout) = timeout {
            self.timeout = Some(timeout);
        }
        self.status = if self.events != 0 || timeout.is_some() {
            Status::Wait
        } else {
            Status::Done
        };
    }

    /// Waits for a deadline only; no readiness events.
    pub fn wait_timeout(&mut self, deadline: Instant) {
        self.wait(SockWhen::Timeout, Some(deadline));
    }

    /// Marks the event finished; its slot is recycled.
    pub fn done(&mut self) {
        self.events = 0;
        self.status = Status::Done;
    }
}

pub type EventProc = Box<dyn FnMut(&mut EventControl, SockWhen, Instant) + Send>;

struct NewEvent {
    sock: Option<RawFd>,
    proc: EventProc,
}

struct Shared {
    pending: Mutex<Vec<NewEvent>>,
    free_slots: AtomicUsize,
    waker: Waker,
}

/// Cloneable producer side of a queue.
#[derive(Clone)]
pub struct EventQueueHandle {
    shared: Arc<Shared>,
}

impl EventQueueHandle {
    /// Hands an event over to the queue. The callback first runs with
    /// [`SockWhen::Init`] on the drain thread. Returns `false` when the
    /// queue is full.
    pub fn enqueue(&self, sock: Option<RawFd>, proc: EventProc) -> bool {
        let mut free = self.shared.free_slots.load(Ordering::Acquire);
        loop {
            if free == 0 {
                return false;
            }
            match self.shared.free_slots.compare_exchange_weak(
                free,
                free - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => free = current,
            }
        }

        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(NewEvent { sock, proc });
        true
    }

    /// Wakes the queue out of a blocked poll.
    pub fn trigger(&self) -> io::Result<()> {
        self.shared.waker.wake()
    }
}

struct Slot {
    sock: Option<RawFd>,
    proc: Option<EventProc>,
    events: u8,
    timeout: Option<Instant>,
    status: Status,
    /// Interest currently registered with the poller; 0 when unregistered.
    registered: u8,
    /// Readiness gathered in the current cycle.
    revents: u8,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            sock: None,
            proc: None,
            events: 0,
            timeout: None,
            status: Status::Unset,
            registered: 0,
            revents: 0,
        }
    }
}

/// The consumer side: owns the slots and the poller.
pub struct EventQueue {
    shared: Arc<Shared>,
    poll: Poll,
    events: Events,
    slots: Vec<Slot>,
    init: Vec<usize>,
    wait: Vec<usize>,
    free: Vec<usize>,
}

const WAKER_TOKEN: Token = Token(0);

fn interest_for(bits: u8) -> Option<Interest> {
    let mut interest: Option<Interest> = None;
    let mut add = |next: Interest| {
        interest = Some(match interest {
            Some(existing) => existing | next,
            None => next,
        });
    };
    if bits & EV_READ != 0 {
        add(Interest::READABLE);
    }
    if bits & EV_WRITE != 0 {
        add(Interest::WRITABLE);
    }
    #[cfg(target_os = "linux")]
    if bits & EV_EXCEPTION != 0 {
        add(Interest::PRIORITY);
    }
    interest
}

impl EventQueue {
    /// Creates a queue with a fixed number of event slots.
    pub fn new(maxevents: usize) -> io::Result<EventQueue> {
        assert!(maxevents > 0);

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let slots = (0..maxevents).map(|_| Slot::empty()).collect();
        // Free slots are handed out from the top, like a stack.
        let free = (0..maxevents).rev().collect();

        Ok(EventQueue {
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                free_slots: AtomicUsize::new(maxevents),
                waker,
            }),
            poll,
            events: Events::with_capacity(maxevents + 1),
            slots,
            init: Vec::new(),
            wait: Vec::new(),
            free,
        })
    }

    pub fn handle(&self) -> EventQueueHandle {
        EventQueueHandle {
            shared: self.shared.clone(),
        }
    }

    fn admit_pending(&mut self) {
        let pending = {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };

        for new in pending {
            // Capacity was reserved at enqueue time, so a slot must exist.
            let idx = self
                .free
                .pop()
                .unwrap_or_else(|| unreachable!("free list drained below reservation"));
            let slot = &mut self.slots[idx];
            *slot = Slot::empty();
            slot.sock = new.sock;
            slot.proc = Some(new.proc);
            self.init.push(idx);
        }
    }

    fn invoke(&mut self, idx: usize, when: SockWhen, now: Instant) {
        let slot = &mut self.slots[idx];
        let mut proc = slot
            .proc
            .take()
            .unwrap_or_else(|| unreachable!("slot without callback invoked"));
        let mut control = EventControl {
            events: slot.events,
            timeout: slot.timeout,
            status: slot.status,
        };

        proc(&mut control, when, now);

        let slot = &mut self.slots[idx];
        slot.proc = Some(proc);
        slot.events = control.events;
        slot.timeout = control.timeout;
        slot.status = control.status;
    }

    fn release(&mut self, idx: usize) {
        if self.slots[idx].registered != 0 {
            if let Some(fd) = self.slots[idx].sock {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            self.slots[idx].registered = 0;
        }
        self.slots[idx] = Slot::empty();
        self.free.push(idx);
        self.shared.free_slots.fetch_add(1, Ordering::Release);
    }

    fn sync_registration(&mut self, idx: usize) {
        let slot = &self.slots[idx];
        let (desired, fd) = match slot.sock {
            Some(fd) => (slot.events, fd),
            None => (0, 0),
        };

        if slot.registered == desired {
            return;
        }

        let registry = self.poll.registry();
        if desired == 0 {
            if slot.registered != 0 {
                let _ = registry.deregister(&mut SourceFd(&fd));
            }
        } else if let Some(interest) = interest_for(desired) {
            let result = if self.slots[idx].registered == 0 {
                registry.register(&mut SourceFd(&fd), Token(idx + 1), interest)
            } else {
                registry.reregister(&mut SourceFd(&fd), Token(idx + 1), interest)
            };
            if let Err(err) = result {
                log::error!(error:err = err; "event queue: fd registration failed");
            }
        }
        self.slots[idx].registered = desired;
    }

    /// Runs one iteration of queue callbacks. Returns whether events are
    /// still waiting.
    pub fn run_once(&mut self) -> io::Result<bool> {
        self.admit_pending();

        // Initialize new events; a callback that arms nothing during init
        // is a bug and its slot is reclaimed.
        let now = Instant::now();
        while let Some(idx) = self.init.pop() {
            self.invoke(idx, SockWhen::Init, now);
            match self.slots[idx].status {
                Status::Unset => {
                    log::error!("event queue: callback init failed");
                    self.release(idx);
                }
                Status::Wait => self.wait.push(idx),
                Status::Done => self.release(idx),
            }
        }

        // Sync poll registrations and find the nearest deadline.
        let mut deadline: Option<Instant> = None;
        let waiting: Vec<usize> = self.wait.clone();
        for &idx in &waiting {
            self.sync_registration(idx);
            self.slots[idx].revents = 0;
            if let Some(timeout) = self.slots[idx].timeout {
                deadline = Some(match deadline {
                    Some(existing) => existing.min(timeout),
                    None => timeout,
                });
            }
        }

        let poll_timeout =
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match self.poll.poll(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            let Token(token) = event.token();
            if token == 0 {
                // The waker drained itself; nothing to read.
                continue;
            }
            let idx = token - 1;
            let mut bits = 0;
            // Hang-ups surface as readable so callbacks observe EOF.
            if event.is_readable() || event.is_read_closed() {
                bits |= EV_READ;
            }
            if event.is_writable() {
                bits |= EV_WRITE;
            }
            if event.is_priority() {
                bits |= EV_EXCEPTION;
            }
            if let Some(slot) = self.slots.get_mut(idx) {
                slot.revents |= bits;
            }
        }

        // Fire ready events and expired timers, then reclassify.
        let now = Instant::now();
        let current = std::mem::take(&mut self.wait);
        let mut next_wait = Vec::new();

        for idx in current {
            let revents = self.slots[idx].revents;
            if revents != 0 {
                for when in [SockWhen::Exception, SockWhen::Write, SockWhen::Read] {
                    if revents & when_bit(when) != 0 {
                        self.invoke(idx, when, now);
                    }
                }
            } else if self.slots[idx].timeout.is_some_and(|t| t < now) {
                self.invoke(idx, SockWhen::Timeout, now);
            }

            if self.slots[idx].status == Status::Wait {
                next_wait.push(idx);
            } else {
                self.release(idx);
            }
        }

        // Rebuilding by pushing to the front keeps same-cycle dispatch in
        // reverse-registration order.
        next_wait.reverse();
        self.wait = next_wait;

        Ok(!self.wait.is_empty())
    }

    /// Delivers [`SockWhen::Exit`] to every waiting callback and releases
    /// all slots.
    pub fn exit(&mut self) {
        self.admit_pending();
        let now = Instant::now();

        for idx in std::mem::take(&mut self.init) {
            self.invoke(idx, SockWhen::Exit, now);
            self.release(idx);
        }
        for idx in std::mem::take(&mut self.wait) {
            self.invoke(idx, SockWhen::Exit, now);
            self.release(idx);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counting(
        counter: &Arc<Mutex<Vec<SockWhen>>>,
        mut arm: impl FnMut(&mut EventControl, SockWhen) + Send + 'static,
    ) -> EventProc {
        let counter = counter.clone();
        Box::new(move |control: &mut EventControl, when: SockWhen, _now: Instant| {
            counter.lock().unwrap().push(when);
            arm(control, when);
        })
    }

    #[test]
    fn timer_fires_once_and_slot_returns_to_free() {
        let mut queue = EventQueue::new(4).unwrap();
        let handle = queue.handle();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(handle.enqueue(
            None,
            counting(&calls, move |control, when| {
                if when == SockWhen::Init {
                    control.wait_timeout(deadline);
                }
                // After the timeout fired, arm nothing: done.
                if when == SockWhen::Timeout {
                    control.done();
                }
            }),
        ));

        // First iteration: init, then poll until the timer expires.
        let mut remaining = true;
        let begun = Instant::now();
        while remaining {
            remaining = queue.run_once().unwrap();
            assert!(begun.elapsed() < Duration::from_secs(5));
        }

        assert_eq!(*calls.lock().unwrap(), vec![SockWhen::Init, SockWhen::Timeout]);
        assert_eq!(queue.free.len(), 4);
    }

    #[test]
    fn init_without_arming_is_a_bug_and_frees_the_slot() {
        let mut queue = EventQueue::new(2).unwrap();
        let handle = queue.handle();
        let calls = Arc::new(Mutex::new(Vec::new()));

        handle.enqueue(None, counting(&calls, |_, _| {}));
        // Nothing will be waiting, so give the poll a pending wakeup.
        handle.trigger().unwrap();
        let remaining = queue.run_once().unwrap();

        assert!(!remaining);
        assert_eq!(*calls.lock().unwrap(), vec![SockWhen::Init]);
        assert_eq!(queue.free.len(), 2);
    }

    #[test]
    fn enqueue_fails_when_queue_is_full() {
        let queue = EventQueue::new(1).unwrap();
        let handle = queue.handle();

        assert!(handle.enqueue(None, Box::new(|c: &mut EventControl, _: SockWhen, _: Instant| c.done())));
        assert!(!handle.enqueue(None, Box::new(|c: &mut EventControl, _: SockWhen, _: Instant| c.done())));
    }

    #[test]
    fn readable_socket_fires_read_callback() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let mut queue = EventQueue::new(2).unwrap();
        let handle = queue.handle();
        let calls = Arc::new(Mutex::new(Vec::new()));

        handle.enqueue(
            Some(fd),
            counting(&calls, |control, when| match when {
                SockWhen::Init => control.wait(SockWhen::Read, None),
                SockWhen::Read => control.done(),
                _ => {}
            }),
        );

        use std::io::Write;
        writer.write_all(b"x").unwrap();

        let mut remaining = true;
        let begun = Instant::now();
        while remaining {
            remaining = queue.run_once().unwrap();
            assert!(begun.elapsed() < Duration::from_secs(5));
        }

        assert_eq!(*calls.lock().unwrap(), vec![SockWhen::Init, SockWhen::Read]);
        drop(reader);
    }

    #[test]
    fn trigger_wakes_a_blocked_poll() {
        let mut queue = EventQueue::new(2).unwrap();
        let handle = queue.handle();

        // An event waiting forever on a never-ready socket keeps the poll
        // blocked until the trigger fires.
        let (_writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();
        handle.enqueue(
            Some(fd),
            Box::new(|control: &mut EventControl, when: SockWhen, _: Instant| {
                if when == SockWhen::Init {
                    control.wait(SockWhen::Read, None);
                }
            }),
        );

        let trigger = queue.handle();
        let waker_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.trigger().unwrap();
        });

        let begun = Instant::now();
        let remaining = queue.run_once().unwrap();
        assert!(remaining);
        assert!(begun.elapsed() < Duration::from_secs(5));
        waker_thread.join().unwrap();

        queue.exit();
        drop(handle);
    }

    #[test]
    fn exit_delivers_exit_to_waiting_events() {
        let mut queue = EventQueue::new(2).unwrap();
        let handle = queue.handle();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let deadline = Instant::now() + Duration::from_secs(3600);
        handle.enqueue(
            None,
            counting(&calls, move |control, when| {
                if when == SockWhen::Init {
                    control.wait_timeout(deadline);
                }
            }),
        );

        // Pre-arm the waker so the iteration's poll returns immediately
        // instead of sleeping toward the distant deadline.
        handle.trigger().unwrap();
        queue.run_once().unwrap();
        queue.exit();

        assert_eq!(*calls.lock().unwrap(), vec![SockWhen::Init, SockWhen::Exit]);
        assert_eq!(queue.free.len(), 2);
    }

    #[test]
    fn rearmed_event_keeps_waiting() {
        let mut queue = EventQueue::new(2).unwrap();
        let handle = queue.handle();
        static FIRES: AtomicUsize = AtomicUsize::new(0);

        handle.enqueue(
            None,
            Box::new(|control: &mut EventControl, when: SockWhen, now: Instant| match when {
                SockWhen::Init => control.wait_timeout(now + Duration::from_millis(10)),
                SockWhen::Timeout => {
                    if FIRES.fetch_add(1, Ordering::SeqCst) == 0 {
                        control.wait_timeout(now + Duration::from_millis(10));
                    } else {
                        control.done();
                    }
                }
                _ => {}
            }),
        );

        let begun = Instant::now();
        while queue.run_once().unwrap() {
            assert!(begun.elapsed() < Duration::from_secs(5));
        }
        assert_eq!(FIRES.load(Ordering::SeqCst), 2);
    }
}
