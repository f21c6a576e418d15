//! Workload replay. Drives the select engine through a scripted sequence of
//! job submissions and lifecycle events.
//!
//! ```toml
//! start = 1000
//!
//! [[running]]                  # jobs the queue already knows at startup
//! job_id = 9
//! partition = "batch"
//! state = "running"
//! end_time = 1200
//! nodes = ["n0"]
//!
//! [[events]]
//! event = "submit"
//! mode = "run_now"             # run_now | test_only | will_run
//! min_nodes = 2
//! [events.job]
//! job_id = 1
//! partition = "batch"
//! num_procs = 4
//! time_limit = 60
//!
//! [[events]]
//! event = "end"
//! job_id = 1
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use consres_core::{ClusterConfig, JobId, JobRequest, NodeBitmap, NodeLimits};
use consres_select::{
    JobQueue, PlaceMode, PlaceRequest, PlaceStatus, Placement, QueueState, QueuedJob,
    SelectEngine, SelectError, SharedEngine,
};
use consres_state::StateFile;

#[derive(Debug, Deserialize)]
pub struct Workload {
    /// Simulated clock at the first event, seconds since the epoch.
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub running: Vec<QueuedJob>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Workload {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading workload {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    #[default]
    RunNow,
    TestOnly,
    WillRun,
}

impl From<SubmitMode> for PlaceMode {
    fn from(mode: SubmitMode) -> Self {
        match mode {
            SubmitMode::RunNow => PlaceMode::RunNow,
            SubmitMode::TestOnly => PlaceMode::TestOnly,
            SubmitMode::WillRun => PlaceMode::WillRun,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Submit {
        job: JobRequest,
        #[serde(default)]
        mode: SubmitMode,
        #[serde(default = "one")]
        min_nodes: u32,
        max_nodes: Option<u32>,
        req_nodes: Option<u32>,
    },
    End {
        job_id: JobId,
    },
    Suspend {
        job_id: JobId,
    },
    Resume {
        job_id: JobId,
    },
    /// Move the simulated clock forward.
    Advance {
        seconds: u64,
    },
    Sweep,
    Checkpoint,
    /// Swap in a new cluster file, relative to the workload file.
    Reconfigure {
        config: PathBuf,
    },
}

fn one() -> u32 {
    1
}

/// Outcome of one replayed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub step: usize,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Decision {
    fn new(step: usize, event: &'static str, job_id: Option<JobId>) -> Self {
        Self {
            step,
            event,
            job_id,
            status: PlaceStatus::Ok.to_string(),
            nodes: Vec::new(),
            start_time: None,
            detail: None,
        }
    }

    fn failed(mut self, err: &SelectError) -> Self {
        self.status = err.status().to_string();
        self.detail = Some(err.to_string());
        self
    }

    /// One line for text output.
    pub fn render(&self) -> String {
        let mut line = format!("[{:>3}] {}", self.step, self.event);
        if let Some(id) = self.job_id {
            line.push_str(&format!(" job {id}"));
        }
        line.push_str(&format!(": {}", self.status));
        if !self.nodes.is_empty() {
            line.push_str(&format!(" nodes={}", self.nodes.join(",")));
        }
        if let Some(t) = self.start_time {
            line.push_str(&format!(" start={t}"));
        }
        if let Some(detail) = &self.detail {
            line.push_str(&format!(" ({detail})"));
        }
        line
    }
}

/// Replays a workload against a shared engine and its job queue.
pub struct Simulator {
    engine: SharedEngine,
    queue: JobQueue,
    clock: u64,
    state: Option<StateFile>,
    base_dir: PathBuf,
}

impl Simulator {
    /// Build the engine for `config`, seed the queue with the workload's
    /// running jobs and restore any saved state.
    pub fn new(
        config: ClusterConfig,
        workload: &Workload,
        state_dir: Option<PathBuf>,
        base_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let mut engine = SelectEngine::new(config)?;
        let mut queue = JobQueue::new();
        for job in &workload.running {
            queue.insert(job.clone());
        }

        let state = match state_dir {
            Some(dir) => {
                let mut file = StateFile::new(dir);
                let restored = file.restore(&mut engine, &queue);
                info!(path = %file.path().display(), restored, "saved state loaded");
                Some(file)
            }
            None => None,
        };

        Ok(Self {
            engine: engine.shared(),
            queue,
            clock: workload.start,
            state,
            base_dir,
        })
    }

    pub fn engine(&self) -> SharedEngine {
        self.engine.clone()
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn run(&mut self, events: &[Event]) -> anyhow::Result<Vec<Decision>> {
        events
            .iter()
            .enumerate()
            .map(|(step, event)| self.apply(step, event))
            .collect()
    }

    pub fn apply(&mut self, step: usize, event: &Event) -> anyhow::Result<Decision> {
        let engine = self.engine.clone();
        let mut engine = engine.lock().map_err(|_| anyhow!("engine lock poisoned"))?;
        let decision = match event {
            Event::Submit {
                job,
                mode,
                min_nodes,
                max_nodes,
                req_nodes,
            } => {
                let limits = NodeLimits::new(
                    *min_nodes,
                    max_nodes.unwrap_or(*min_nodes),
                    req_nodes.unwrap_or(*min_nodes),
                );
                self.submit(&mut engine, step, job, (*mode).into(), limits)
            }
            Event::End { job_id } => {
                let decision = Decision::new(step, "end", Some(*job_id));
                self.queue.set_state(*job_id, QueueState::Completed);
                let result = engine.job_end(*job_id, &self.queue);
                self.queue.remove(*job_id);
                outcome(decision, result)
            }
            Event::Suspend { job_id } => {
                let decision = Decision::new(step, "suspend", Some(*job_id));
                let result = engine.job_suspend(*job_id);
                if result.is_ok() {
                    self.queue.set_state(*job_id, QueueState::Suspended);
                }
                outcome(decision, result)
            }
            Event::Resume { job_id } => {
                let decision = Decision::new(step, "resume", Some(*job_id));
                let result = engine.job_resume(*job_id);
                if result.is_ok() {
                    self.queue.set_state(*job_id, QueueState::Running);
                }
                outcome(decision, result)
            }
            Event::Advance { seconds } => {
                self.clock += seconds;
                let mut decision = Decision::new(step, "advance", None);
                decision.start_time = Some(self.clock);
                decision
            }
            Event::Sweep => {
                let removed = engine.sweep(&self.queue);
                let mut decision = Decision::new(step, "sweep", None);
                decision.detail = Some(format!("{removed} removed"));
                decision
            }
            Event::Checkpoint => {
                let mut decision = Decision::new(step, "checkpoint", None);
                match self.state.as_mut() {
                    Some(file) => {
                        let written = file.save(&engine)?;
                        decision.detail = Some(if written { "saved" } else { "unchanged" }.to_string());
                    }
                    None => {
                        warn!("checkpoint requested without a state directory");
                        decision.detail = Some("no state directory".to_string());
                    }
                }
                decision
            }
            Event::Reconfigure { config } => {
                let path = self.base_dir.join(config);
                let config = ClusterConfig::from_file(&path)
                    .with_context(|| format!("loading cluster config {}", path.display()))?;
                let decision = Decision::new(step, "reconfigure", None);
                outcome(decision, engine.reconfigure(config))
            }
        };
        debug!(step, status = %decision.status, "event replayed");
        Ok(decision)
    }

    fn submit(
        &mut self,
        engine: &mut SelectEngine,
        step: usize,
        job: &JobRequest,
        mode: PlaceMode,
        limits: NodeLimits,
    ) -> Decision {
        let name = match mode {
            PlaceMode::RunNow => "run_now",
            PlaceMode::TestOnly => "test_only",
            PlaceMode::WillRun => "will_run",
        };
        let mut decision = Decision::new(step, name, Some(job.job_id));
        let candidates = match engine.candidates(job) {
            Ok(c) => c,
            Err(e) => return decision.failed(&e),
        };
        let req = PlaceRequest {
            job,
            candidates,
            limits,
            mode,
        };
        let placement = match engine.place_at(&req, &self.queue, self.clock) {
            Ok(p) => p,
            Err(e) => return decision.failed(&e),
        };

        if let Some(nodes) = placement.nodes() {
            decision.nodes = names(engine, nodes);
        }
        match placement {
            Placement::Allocated { .. } => {
                let end_time = self.clock + u64::from(job.time_limit);
                self.queue.insert(QueuedJob::running(
                    job.job_id,
                    &job.partition,
                    end_time,
                    decision.nodes.clone(),
                ));
            }
            Placement::StartsAt { start_time, .. } => decision.start_time = Some(start_time),
            Placement::StartsNow { .. } => decision.start_time = Some(self.clock),
            Placement::Feasible => {}
        }
        decision
    }
}

fn outcome(decision: Decision, result: Result<(), SelectError>) -> Decision {
    match result {
        Ok(()) => decision,
        Err(e) => decision.failed(&e),
    }
}

fn names(engine: &SelectEngine, nodes: &NodeBitmap) -> Vec<String> {
    nodes
        .iter()
        .map(|i| engine.node_table().node_name(i).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use consres_core::NodeState;
    use consres_select::JobDirectory;

    const CLUSTER: &str = r#"
[select]
granularity = "CORE"
fast_schedule = false

[[nodes]]
name = "n[0-1]"
cpus = 4
sockets = 1
cores = 4

[[partitions]]
name = "batch"
nodes = ["n[0-1]"]
shared = "NO"
"#;

    fn simulator(workload: &Workload, state_dir: Option<PathBuf>) -> Simulator {
        let config = ClusterConfig::from_toml_str(CLUSTER).unwrap();
        Simulator::new(config, workload, state_dir, PathBuf::from(".")).unwrap()
    }

    #[test]
    fn workload_parses_tagged_events() {
        let workload = Workload::from_toml_str(
            r#"
start = 500

[[events]]
event = "submit"
mode = "will_run"
min_nodes = 2
[events.job]
job_id = 3
partition = "batch"
num_procs = 8
memory = { per_node = 100 }

[[events]]
event = "advance"
seconds = 30

[[events]]
event = "checkpoint"
"#,
        )
        .unwrap();
        assert_eq!(workload.start, 500);
        assert_eq!(workload.events.len(), 3);
        match &workload.events[0] {
            Event::Submit {
                job,
                mode,
                min_nodes,
                max_nodes,
                ..
            } => {
                assert_eq!(job.job_id, 3);
                assert_eq!(*mode, SubmitMode::WillRun);
                assert_eq!(*min_nodes, 2);
                assert_eq!(*max_nodes, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(workload.events[2], Event::Checkpoint));
    }

    #[test]
    fn replay_allocates_predicts_and_ends() {
        let workload = Workload::from_toml_str(
            r#"
start = 1000

[[events]]
event = "submit"
min_nodes = 2
[events.job]
job_id = 1
partition = "batch"
num_procs = 8
time_limit = 60

[[events]]
event = "submit"
mode = "will_run"
[events.job]
job_id = 2
partition = "batch"
num_procs = 4

[[events]]
event = "end"
job_id = 1

[[events]]
event = "end"
job_id = 1
"#,
        )
        .unwrap();
        let mut sim = simulator(&workload, None);
        let decisions = sim.run(&workload.events).unwrap();

        assert_eq!(decisions[0].status, "OK");
        assert_eq!(decisions[0].nodes, vec!["n0", "n1"]);
        assert_eq!(decisions[1].status, "OK");
        assert_eq!(decisions[1].start_time, Some(1060));
        assert_eq!(decisions[2].status, "OK");
        assert_eq!(decisions[3].status, "INTERNAL_ERROR");
        assert!(decisions[3].render().contains("job 1"));

        let engine = sim.engine();
        let engine = engine.lock().unwrap();
        assert_eq!(engine.jobs().count(), 0);
        assert_eq!(engine.node_state(0), NodeState::Available);
        assert!(sim.queue().is_empty());
    }

    #[test]
    fn suspend_and_resume_track_queue_state() {
        let workload = Workload::from_toml_str(
            r#"
[[events]]
event = "submit"
[events.job]
job_id = 5
partition = "batch"
num_procs = 2

[[events]]
event = "suspend"
job_id = 5
"#,
        )
        .unwrap();
        let mut sim = simulator(&workload, None);
        sim.run(&workload.events).unwrap();
        assert_eq!(sim.queue().lookup(5).map(|j| j.state), Some(QueueState::Suspended));
        assert_eq!(sim.engine().lock().unwrap().allocated_cpus(0), 0);

        sim.apply(2, &Event::Resume { job_id: 5 }).unwrap();
        assert_eq!(sim.queue().lookup(5).map(|j| j.state), Some(QueueState::Running));
        assert_eq!(sim.engine().lock().unwrap().allocated_cpus(0), 2);
    }

    #[test]
    fn checkpoint_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let workload = Workload::from_toml_str(
            r#"
[[events]]
event = "submit"
[events.job]
job_id = 1
partition = "batch"
num_procs = 4

[[events]]
event = "checkpoint"

[[events]]
event = "checkpoint"
"#,
        )
        .unwrap();
        let mut sim = simulator(&workload, Some(dir.path().to_path_buf()));
        let decisions = sim.run(&workload.events).unwrap();
        assert_eq!(decisions[1].detail.as_deref(), Some("saved"));
        assert_eq!(decisions[2].detail.as_deref(), Some("unchanged"));

        let restart = Workload::from_toml_str(
            r#"
[[running]]
job_id = 1
partition = "batch"
state = "running"
end_time = 0
nodes = ["n0"]
"#,
        )
        .unwrap();
        let sim = simulator(&restart, Some(dir.path().to_path_buf()));
        let engine = sim.engine();
        let engine = engine.lock().unwrap();
        assert!(engine.job(1).is_some());
        assert_eq!(engine.allocated_cpus(0), 4);
    }

    #[test]
    fn unknown_partition_is_reported() {
        let mut sim = simulator(&Workload::from_toml_str("").unwrap(), None);
        let event = Event::Submit {
            job: JobRequest::new(7, "debug", 1),
            mode: SubmitMode::TestOnly,
            min_nodes: 1,
            max_nodes: None,
            req_nodes: None,
        };
        let decision = sim.apply(0, &event).unwrap();
        assert_eq!(decision.status, "INFEASIBLE_EVER");
        assert_eq!(decision.event, "test_only");
    }
}
