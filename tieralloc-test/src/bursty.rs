//! A lock-step test runner, to flush out data-races on shared allocator state.

use std::{
    mem,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

/// Bursty runs user-specified steps in lock-step across multiple threads.
///
/// A Global state is shared by all threads, while each thread owns one Local state. Each step starts as
/// simultaneously as possible on all threads, and no thread starts step N + 1 before all threads completed step N.
///
/// Constructing a `Bursty` is done through a `BurstyBuilder`.
pub struct Bursty<Global, Local> {
    global: Arc<Global>,
    threads: Vec<JoinHandle<Local>>,
}

impl<Global, Local> Bursty<Global, Local> {
    /// Returns a reference to the Global state.
    ///
    /// The threads may still be running.
    pub fn global(&self) -> &Global { &self.global }

    /// Joins the threads, and returns the Global state and the Local states, in thread order.
    ///
    /// #   Panics
    ///
    /// If any of the threads panicked.
    pub fn join(mut self) -> (Arc<Global>, Vec<Local>) {
        let locals = Self::join_all(mem::take(&mut self.threads));

        (self.global.clone(), locals)
    }

    fn join_all(threads: Vec<JoinHandle<Local>>) -> Vec<Local> {
        let results: Vec<_> = threads.into_iter().map(JoinHandle::join).collect();

        results.into_iter()
            .map(|result| result.unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    }
}

impl<Global, Local> Drop for Bursty<Global, Local> {
    fn drop(&mut self) {
        let threads = mem::take(&mut self.threads);

        if thread::panicking() {
            return;
        }

        Self::join_all(threads);
    }
}

/// BurstyBuilder, a builder for a `Bursty` instance.
///
/// #   Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use tieralloc_test::BurstyBuilder;
///
/// let mut builder = BurstyBuilder::new(AtomicUsize::new(0), vec!(1usize, 10));
///
/// builder.add_simple_step(|| |global: &AtomicUsize, local: &mut usize| {
///     global.fetch_add(*local, Ordering::Relaxed);
/// });
///
/// let (global, locals) = builder.launch(4).join();
///
/// assert_eq!(44, global.load(Ordering::Relaxed));
/// assert_eq!(vec!(1, 10), locals);
/// ```
pub struct BurstyBuilder<Global, Local> {
    global: Arc<Global>,
    locals: Vec<Local>,
    steps: Vec<Vec<Step<Global, Local>>>,
}

impl<Global, Local> BurstyBuilder<Global, Local>
    where
        Global: Send + Sync + 'static,
        Local: Send + 'static,
{
    /// Creates an instance, with one thread per Local state.
    ///
    /// #   Panics
    ///
    /// If `locals` is empty.
    pub fn new(global: Global, locals: Vec<Local>) -> Self {
        assert!(!locals.is_empty(), "Cannot run a burst test without a single thread");

        let steps = locals.iter().map(|_| Vec::new()).collect();

        Self { global: Arc::new(global), locals, steps }
    }

    /// Adds a step on each thread.
    ///
    /// The step is created by invoking `factory` once per thread.
    pub fn add_simple_step<Factory, S>(&mut self, mut factory: Factory)
        where
            Factory: FnMut() -> S,
            S: FnMut(&Global, &mut Local) + Send + 'static,
    {
        self.add_complex_step(move || {
            let mut step = factory();
            (|_: &Global, _: &mut Local| (), move |global: &Global, local: &mut Local, _: ()| step(global, local))
        });
    }

    /// Adds a step on each thread, split in a preparation and an execution.
    ///
    /// The preparation runs before synchronizing with the other threads, and is therefore ideal for expensive set-up;
    /// its result is handed over to the execution.
    pub fn add_complex_step<Factory, Prep, R, S>(&mut self, mut factory: Factory)
        where
            Factory: FnMut() -> (Prep, S),
            Prep: FnMut(&Global, &mut Local) -> R + Send + 'static,
            R: 'static,
            S: FnMut(&Global, &mut Local, R) + Send + 'static,
    {
        for serie in &mut self.steps {
            let (mut prep, mut step) = factory();

            let prep = move |global: &Global, local: &mut Local| -> Prepared { Box::new(prep(global, local)) };

            let step = move |global: &Global, local: &mut Local, prepared: Prepared| {
                let prepared = prepared.downcast::<R>().map(|prepared| *prepared);
                step(global, local, prepared.unwrap_or_else(|_| unreachable!("Prepared by `prep`")))
            };

            serie.push(Step { prep: Box::new(prep), step: Box::new(step) });
        }
    }

    /// Launches the threads, each running its serie of steps `iterations` times.
    ///
    /// #   Panics
    ///
    /// If no step was added.
    pub fn launch(self, iterations: usize) -> Bursty<Global, Local> {
        assert!(!self.steps[0].is_empty(), "Cannot run a burst test without a single step");

        let checkpoint = Arc::new(Checkpoint::new(self.locals.len()));

        let threads = self.locals.into_iter().zip(self.steps)
            .map(|(mut local, mut serie)| {
                let global = self.global.clone();
                let checkpoint = checkpoint.clone();

                thread::spawn(move || {
                    let guard = PoisonGuard(&checkpoint);

                    for _ in 0..iterations {
                        for step in &mut serie {
                            let prepared = (step.prep)(&global, &mut local);

                            checkpoint.wait();

                            (step.step)(&global, &mut local, prepared);
                        }
                    }

                    checkpoint.wait();

                    mem::forget(guard);

                    local
                })
            })
            .collect();

        Bursty { global: self.global, threads }
    }
}

//
//  Implementation
//

type Prepared = Box<dyn std::any::Any>;

struct Step<Global, Local> {
    prep: Box<dyn FnMut(&Global, &mut Local) -> Prepared + Send>,
    step: Box<dyn FnMut(&Global, &mut Local, Prepared) + Send>,
}

//  A reusable barrier, which can be poisoned so that a panicking thread releases its peers.
struct Checkpoint {
    participants: usize,
    state: Mutex<CheckpointState>,
    condition: Condvar,
}

#[derive(Default)]
struct CheckpointState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

impl Checkpoint {
    fn new(participants: usize) -> Self {
        Self { participants, state: Mutex::default(), condition: Condvar::new() }
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());

        assert!(!state.poisoned, "Another thread panicked");

        state.arrived += 1;

        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation += 1;
            self.condition.notify_all();
            return;
        }

        let generation = state.generation;

        while state.generation == generation && !state.poisoned {
            state = self.condition.wait(state).unwrap_or_else(|poison| poison.into_inner());
        }

        assert!(!state.poisoned, "Another thread panicked");
    }

    fn poison(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.poisoned = true;
        self.condition.notify_all();
    }
}

struct PoisonGuard<'a>(&'a Checkpoint);

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) { self.0.poison(); }
}
