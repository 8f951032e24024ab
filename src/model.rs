//! Configure and run exploration campaigns.

use crate::rt::action::Action;
use crate::rt::bpor::{BporSched, BporTree};
use crate::rt::execution::{self, ExecResult, Failure, World};
use crate::rt::memory::MemType;
use crate::rt::trace::Trace;
use crate::schedule::Scheduler;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, subscriber};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_MAX_BRANCHES: usize = 1_000;
const DEFAULT_PREEMPTION_BOUND: usize = 2;

/// Configure an exploration campaign.
#[derive(Debug)]
#[non_exhaustive] // Support adding more fields in the future
pub struct Builder {
    /// The memory model executions are checked under.
    pub mem: MemType,

    /// Maximum number of preemptions per schedule. `None` removes the
    /// bound.
    ///
    /// Defaults to `WEFT_MAX_PREEMPTIONS` environment variable, else 2.
    pub preemption_bound: Option<usize>,

    /// Maximum number of steps per execution; longer runs abort.
    ///
    /// Defaults to `WEFT_MAX_BRANCHES` environment variable.
    pub max_branches: usize,

    /// Maximum number of executions to explore.
    ///
    /// Defaults to `WEFT_MAX_PERMUTATIONS` environment variable.
    pub max_permutations: Option<usize>,

    /// Maximum amount of time to spend on checking.
    ///
    /// Defaults to `WEFT_MAX_DURATION` environment variable.
    pub max_duration: Option<Duration>,

    /// When doing an exhaustive check, uses the file to store and load the
    /// exploration progress.
    ///
    /// Defaults to `WEFT_CHECKPOINT_FILE` environment variable.
    pub checkpoint_file: Option<PathBuf>,

    /// How often to write the checkpoint file.
    ///
    /// Defaults to `WEFT_CHECKPOINT_INTERVAL` environment variable.
    pub checkpoint_interval: usize,
}

impl Builder {
    /// Create a new `Builder` instance with default values.
    pub fn new() -> Builder {
        use std::env;

        let preemption_bound = env::var("WEFT_MAX_PREEMPTIONS")
            .map(|v| {
                Some(
                    v.parse()
                        .expect("invalid value for `WEFT_MAX_PREEMPTIONS`"),
                )
            })
            .unwrap_or(Some(DEFAULT_PREEMPTION_BOUND));

        let max_branches = env::var("WEFT_MAX_BRANCHES")
            .map(|v| v.parse().expect("invalid value for `WEFT_MAX_BRANCHES`"))
            .unwrap_or(DEFAULT_MAX_BRANCHES);

        let max_permutations = env::var("WEFT_MAX_PERMUTATIONS")
            .map(|v| {
                v.parse()
                    .expect("invalid value for `WEFT_MAX_PERMUTATIONS`")
            })
            .ok();

        let max_duration = env::var("WEFT_MAX_DURATION")
            .map(|v| {
                let secs = v.parse().expect("invalid value for `WEFT_MAX_DURATION`");
                Duration::from_secs(secs)
            })
            .ok();

        let checkpoint_file = env::var("WEFT_CHECKPOINT_FILE")
            .map(|v| v.parse().expect("invalid value for `WEFT_CHECKPOINT_FILE`"))
            .ok();

        let checkpoint_interval = env::var("WEFT_CHECKPOINT_INTERVAL")
            .map(|v| {
                v.parse()
                    .expect("invalid value for `WEFT_CHECKPOINT_INTERVAL`")
            })
            .unwrap_or(20_000);

        Builder {
            mem: MemType::SequentialConsistency,
            preemption_bound,
            max_branches,
            max_permutations,
            max_duration,
            checkpoint_file,
            checkpoint_interval,
        }
    }

    /// Check the model under a different memory model.
    pub fn mem(&mut self, mem: MemType) -> &mut Self {
        self.mem = mem;
        self
    }

    /// Set the checkpoint file.
    pub fn checkpoint_file(&mut self, file: &str) -> &mut Self {
        self.checkpoint_file = Some(file.into());
        self
    }

    /// Systematically explore the program's schedules within the preemption
    /// bound, returning every observed `(result, trace)` pair.
    ///
    /// The factory is called once per execution; each call must build the
    /// same program.
    pub fn explore<T, F>(&self, mut program: F) -> Vec<(ExecResult<T>, Trace)>
    where
        T: Clone + 'static,
        F: FnMut() -> Action<T>,
    {
        let mut tree = match &self.checkpoint_file {
            Some(path) if path.exists() => checkpoint::load_tree(path),
            _ => BporTree::new(self.mem, self.preemption_bound),
        };

        let mut runs = Vec::new();
        let mut i = 1usize;
        let start = Instant::now();

        while let Some(prefix) = tree.next() {
            let _span = tracing::info_span!("iter", message = i).entered();

            let mut world = World::new(self.mem, program());
            let mut sched = BporSched::new(&prefix, self.mem);
            let (result, trace, mut steps) =
                execution::run(&mut world, &mut sched, self.max_branches);

            // Replaying a reported prefix must reproduce it exactly.
            for (idx, tid) in prefix.tids.iter().enumerate() {
                if idx < steps.len() {
                    let prior = if idx == 0 {
                        None
                    } else {
                        Some(steps[idx - 1].thread)
                    };
                    assert_eq!(
                        steps[idx].thread, *tid,
                        "replayed prefix diverged at step {}",
                        idx
                    );
                    assert_eq!(steps[idx].decision.thread_id(prior), *tid);
                }
            }

            let internal = matches!(result, Err(Failure::InternalError));

            tree.find_backtrack(&mut steps);
            tree.grow(&steps, prefix.conservative);
            tree.install_todo(&steps);
            tree.prune_commits();

            runs.push((result, trace));

            if internal {
                break;
            }

            if i % self.checkpoint_interval == 0 {
                if let Some(path) = &self.checkpoint_file {
                    checkpoint::store_tree(&tree, path);
                }
            }

            if let Some(max) = self.max_permutations {
                if i >= max {
                    break;
                }
            }

            if let Some(max) = self.max_duration {
                if start.elapsed() >= max {
                    break;
                }
            }

            i += 1;
        }

        info!("completed in {} iterations", runs.len());
        runs
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Explore all schedules of the program within the default preemption
/// bound.
///
/// Uses a default [`Builder`] which can be affected by environment
/// variables, and logs per the `WEFT_LOG` env filter.
pub fn model<T, F>(program: F) -> Vec<(ExecResult<T>, Trace)>
where
    T: Clone + 'static,
    F: FnMut() -> Action<T>,
{
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_env("WEFT_LOG"))
        .with_test_writer()
        .without_time()
        .finish();

    subscriber::with_default(subscriber, || Builder::new().explore(program))
}

/// Run the program once under the given scheduler.
///
/// This is the raw scheduler contract: the BPOR driver is not involved.
pub fn run_with<T, S>(builder: &Builder, scheduler: &mut S, program: Action<T>) -> (ExecResult<T>, Trace)
where
    T: Clone + 'static,
    S: Scheduler,
{
    let mut world = World::new(builder.mem, program);
    let (result, trace, _) = execution::run(&mut world, scheduler, builder.max_branches);
    (result, trace)
}

#[cfg(feature = "checkpoint")]
mod checkpoint {
    use crate::rt::bpor::BporTree;
    use std::fs::File;
    use std::io::prelude::*;
    use std::path::Path;

    pub(crate) fn load_tree(path: &Path) -> BporTree {
        let mut file = File::open(path).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    pub(crate) fn store_tree(tree: &BporTree, path: &Path) {
        let serialized = serde_json::to_string(tree).unwrap();

        let mut file = File::create(path).unwrap();
        file.write_all(serialized.as_bytes()).unwrap();
    }
}

#[cfg(not(feature = "checkpoint"))]
mod checkpoint {
    use crate::rt::bpor::BporTree;
    use std::path::Path;

    pub(crate) fn load_tree(_path: &Path) -> BporTree {
        panic!("not compiled with `checkpoint` feature")
    }

    pub(crate) fn store_tree(_tree: &BporTree, _path: &Path) {
        panic!("not compiled with `checkpoint` feature")
    }
}
