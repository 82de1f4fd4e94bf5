//! Serial task execution around one [`Engine`].
//!
//! The executor owns the engine, so every task runs with exclusive access
//! and no locking. Other threads reach it through an [`ExecutorHandle`],
//! which only queues closures; they run on the next [`SerialExecutor::run_pending`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::trace;

use super::Engine;
use crate::error::{Error, Result};

/// A task run once.
pub type Task = Box<dyn FnOnce(&mut Engine) + Send>;

/// A task run on every period.
pub type RepeatingTask = Box<dyn FnMut(&mut Engine) + Send>;

/// Identifies a scheduled task for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Runs work against the engine.
pub trait Scheduler {
    /// Run `task` on the next pass.
    fn execute(&mut self, task: Task);

    /// Run `task` once `delay` has passed.
    fn schedule(&mut self, delay: Duration, task: Task) -> TaskId;

    /// Run `task` after `initial`, then every `period`.
    fn schedule_at_fixed_rate(
        &mut self,
        initial: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskId;

    /// Stop a scheduled task. Returns whether it was still pending.
    fn cancel(&mut self, id: TaskId) -> bool;
}

enum TimerTask {
    Once(Task),
    Repeat { period: Duration, task: RepeatingTask },
}

struct TimerEntry {
    at: Instant,
    sequence: u64,
    id: TaskId,
    task: TimerTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Earliest deadline first, then submission order.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.at.cmp(&other.at) {
            Ordering::Equal => self.sequence.cmp(&other.sequence).reverse(),
            ordering => ordering.reverse(),
        }
    }
}

/// Owns an engine and runs tasks against it one at a time.
pub struct SerialExecutor {
    engine: Engine,
    now: Instant,
    ready: VecDeque<Task>,
    timers: BinaryHeap<TimerEntry>,
    live: HashSet<TaskId>,
    next_id: u64,
    sender: mpsc::Sender<Task>,
    inbox: mpsc::Receiver<Task>,
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("engine", &self.engine)
            .field("ready", &self.ready.len())
            .field("timers", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl SerialExecutor {
    /// Take ownership of `engine`, with the clock reading `now`.
    #[must_use]
    pub fn new(engine: Engine, now: Instant) -> Self {
        let (sender, inbox) = mpsc::channel();
        Self {
            engine,
            now,
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            live: HashSet::new(),
            next_id: 0,
            sender,
            inbox,
        }
    }

    /// Cross-thread submission handle.
    #[must_use]
    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            sender: self.sender.clone(),
        }
    }

    /// The owned engine.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Mutable access for the thread driving the executor.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Give the engine back.
    #[must_use]
    pub fn into_engine(self) -> Engine {
        self.engine
    }

    /// Clock reading of the last pass.
    #[must_use]
    pub const fn now(&self) -> Instant {
        self.now
    }

    /// When the next pass has work: a live timer task or an engine deadline.
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        let timer = self.timers.peek().map(|entry| entry.at);
        match (timer, self.engine.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run queued tasks, then due timers, then the engine's own deadlines.
    /// Returns how many tasks ran.
    pub fn run_pending(&mut self, now: Instant) -> Result<usize> {
        self.now = self.now.max(now);
        while let Ok(task) = self.inbox.try_recv() {
            self.ready.push_back(task);
        }
        let mut ran = 0;
        while let Some(task) = self.ready.pop_front() {
            task(&mut self.engine);
            ran += 1;
        }
        while self.timers.peek().is_some_and(|entry| entry.at <= self.now) {
            let Some(entry) = self.timers.pop() else {
                break;
            };
            if !self.live.contains(&entry.id) {
                continue;
            }
            ran += 1;
            match entry.task {
                TimerTask::Once(task) => {
                    self.live.remove(&entry.id);
                    task(&mut self.engine);
                }
                TimerTask::Repeat { period, mut task } => {
                    task(&mut self.engine);
                    let at = entry.at + period.max(Duration::from_nanos(1));
                    self.push_timer(entry.id, at, TimerTask::Repeat { period, task });
                }
            }
        }
        self.discard_cancelled();
        trace!(ran, "executor pass");
        self.engine.tick(self.now)?;
        Ok(ran)
    }

    fn allocate(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        id
    }

    /// Pop cancelled entries so the heap head is always a live task.
    fn discard_cancelled(&mut self) {
        while self.timers.peek().is_some_and(|entry| !self.live.contains(&entry.id)) {
            self.timers.pop();
        }
    }

    fn push_timer(&mut self, id: TaskId, at: Instant, task: TimerTask) {
        let sequence = self.next_id;
        self.next_id += 1;
        self.timers.push(TimerEntry {
            at,
            sequence,
            id,
            task,
        });
    }
}

impl Scheduler for SerialExecutor {
    fn execute(&mut self, task: Task) {
        self.ready.push_back(task);
    }

    fn schedule(&mut self, delay: Duration, task: Task) -> TaskId {
        let id = self.allocate();
        self.push_timer(id, self.now + delay, TimerTask::Once(task));
        id
    }

    fn schedule_at_fixed_rate(
        &mut self,
        initial: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskId {
        let id = self.allocate();
        self.push_timer(id, self.now + initial, TimerTask::Repeat { period, task });
        id
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        let was_live = self.live.remove(&id);
        self.discard_cancelled();
        was_live
    }
}

/// Queues work onto a [`SerialExecutor`] from any thread.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    sender: mpsc::Sender<Task>,
}

impl ExecutorHandle {
    /// Queue `task` for the next pass.
    pub fn submit(&self, task: impl FnOnce(&mut Engine) + Send + 'static) -> Result<()> {
        self.sender
            .send(Box::new(task))
            .map_err(|_| Error::Transport("executor stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::engine::EngineConfig;

    fn executor() -> (SerialExecutor, Instant) {
        let now = Instant::now();
        let engine = Engine::new(EngineConfig::default()).unwrap();
        (SerialExecutor::new(engine, now), now)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Clone + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let bump = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, AtomicOrdering::SeqCst);
            }
        };
        (count, bump)
    }

    #[test]
    fn handle_submits_across_threads() {
        let (mut executor, now) = executor();
        let handle = executor.handle();
        std::thread::spawn(move || {
            handle
                .submit(|engine: &mut Engine| {
                    engine.start().unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(executor.run_pending(now).unwrap(), 1);
        assert!(!executor.engine_mut().take_output().is_empty());
    }

    #[test]
    fn delayed_tasks_wait_for_their_deadline() {
        let (mut executor, now) = executor();
        let (count, bump) = counter();
        executor.schedule(Duration::from_secs(2), Box::new(move |_: &mut Engine| bump()));
        assert_eq!(executor.next_wakeup(), Some(now + Duration::from_secs(2)));
        executor.run_pending(now + Duration::from_secs(1)).unwrap();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        executor.run_pending(now + Duration::from_secs(2)).unwrap();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(executor.next_wakeup(), None);
    }

    #[test]
    fn fixed_rate_repeats_until_cancelled() {
        let (mut executor, now) = executor();
        let (count, bump) = counter();
        let id = executor.schedule_at_fixed_rate(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Box::new(move |_: &mut Engine| bump()),
        );
        executor.run_pending(now + Duration::from_secs(1)).unwrap();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        executor.run_pending(now + Duration::from_secs(3)).unwrap();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
        assert!(executor.cancel(id));
        executor.run_pending(now + Duration::from_secs(10)).unwrap();
        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
        assert!(!executor.cancel(id));
    }

    #[test]
    fn cancelled_one_shot_never_runs() {
        let (mut executor, now) = executor();
        let (count, bump) = counter();
        let id = executor.schedule(Duration::ZERO, Box::new(move |_: &mut Engine| bump()));
        assert!(executor.cancel(id));
        executor.execute(Box::new(|_: &mut Engine| {}));
        assert_eq!(executor.run_pending(now).unwrap(), 1);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn cancelled_timers_do_not_set_the_wakeup() {
        let (mut executor, now) = executor();
        let soon = executor.schedule(Duration::from_secs(1), Box::new(|_: &mut Engine| {}));
        let later = executor.schedule(Duration::from_secs(5), Box::new(|_: &mut Engine| {}));
        let repeating = executor.schedule_at_fixed_rate(
            Duration::from_secs(3),
            Duration::from_secs(3),
            Box::new(|_: &mut Engine| {}),
        );

        assert!(executor.cancel(later));
        assert_eq!(executor.next_wakeup(), Some(now + Duration::from_secs(1)));
        assert!(executor.cancel(soon));
        assert_eq!(executor.next_wakeup(), Some(now + Duration::from_secs(3)));
        assert!(executor.cancel(repeating));
        assert_eq!(executor.next_wakeup(), None);
        assert_eq!(executor.run_pending(now + Duration::from_secs(10)).unwrap(), 0);
    }

    #[test]
    fn stopped_executor_rejects_submissions() {
        let (executor, _) = executor();
        let handle = executor.handle();
        drop(executor);
        assert!(matches!(
            handle.submit(|_: &mut Engine| {}),
            Err(Error::Transport(_))
        ));
    }
}
