// Retry and timeout scheduling.
//
// A SequentialCall fires the same call after each delay in a sequence, each delay counted from
// the previous firing, and then reports a timeout exactly once. Nothing here sleeps or spawns:
// the owner asks for the next deadline, waits for it however it likes, and polls. What a "call"
// means (usually: put a datagram back on the wire) is up to the owner, which gets the fixed call
// arguments handed back on every firing.

use crate::clock::Clock;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Call,
    TimedOut,
}

/// Something a [`SequentialCall`] wants done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired<A> {
    /// Invoke the callable with its fixed arguments.
    Call(A),

    /// The last delay elapsed without the schedule being cancelled.
    TimedOut { at: Instant },
}

#[derive(Debug)]
pub struct SequentialCall<A> {
    delays: VecDeque<Duration>,
    callable_args: A,
    next: Option<(Instant, Step)>,
}

impl<A: Clone> SequentialCall<A> {
    /// Starts a schedule. With `run_now` the first call is due immediately, before any delay.
    pub fn run(clock: &dyn Clock, delays: &[Duration], callable_args: A, run_now: bool) -> SequentialCall<A> {
        let start = clock.now();
        let mut call = SequentialCall {
            delays: delays.iter().copied().collect(),
            callable_args,
            next: None,
        };
        call.next = if run_now {
            Some((start, Step::Call))
        } else {
            call.schedule_after(start)
        };
        call
    }

    fn schedule_after(&mut self, at: Instant) -> Option<(Instant, Step)> {
        match self.delays.pop_front() {
            Some(delay) => Some((at + delay, Step::Call)),
            None => Some((at, Step::TimedOut)),
        }
    }

    /// Everything that has come due by `now`, in order.
    pub fn poll(&mut self, now: Instant) -> Vec<Fired<A>> {
        let mut fired = Vec::new();
        while let Some((at, step)) = self.next {
            if at > now {
                break;
            }
            match step {
                Step::Call => {
                    fired.push(Fired::Call(self.callable_args.clone()));
                    self.next = self.schedule_after(at);
                }
                Step::TimedOut => {
                    fired.push(Fired::TimedOut { at });
                    self.next = None;
                }
            }
        }
        fired
    }

    pub fn cancel(&mut self) {
        self.next = None;
        self.delays.clear();
    }

    pub fn active(&self) -> bool {
        self.next.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next.map(|(at, _)| at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    Resend(Vec<u8>),
    GiveUp,
}

/// Guards a datagram that expects a response.
///
/// The datagram goes out as soon as the watchdog is polled, then again after every entry of the
/// timeout schedule except the last. The last entry is how long to keep waiting after the final
/// retransmission before giving up on the peer.
#[derive(Debug)]
pub struct Watchdog {
    retries: SequentialCall<Vec<u8>>,
    final_wait: Duration,
    give_up_at: Option<Instant>,
}

impl Watchdog {
    pub fn start(clock: &dyn Clock, schedule: &[Duration], datagram: Vec<u8>) -> Watchdog {
        let (retries, final_wait) = match schedule.split_last() {
            Some((last, rest)) => (rest, *last),
            None => (&[][..], Duration::ZERO),
        };
        Watchdog {
            retries: SequentialCall::run(clock, retries, datagram, true),
            final_wait,
            give_up_at: None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> Vec<WatchdogEvent> {
        let mut events = Vec::new();
        for fired in self.retries.poll(now) {
            match fired {
                Fired::Call(datagram) => events.push(WatchdogEvent::Resend(datagram)),
                Fired::TimedOut { at } => self.give_up_at = Some(at + self.final_wait),
            }
        }
        if let Some(at) = self.give_up_at {
            if at <= now {
                self.give_up_at = None;
                events.push(WatchdogEvent::GiveUp);
            }
        }
        events
    }

    pub fn cancel(&mut self) {
        self.retries.cancel();
        self.give_up_at = None;
    }

    pub fn active(&self) -> bool {
        self.retries.active() || self.give_up_at.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.retries.deadline().or(self.give_up_at)
    }
}
