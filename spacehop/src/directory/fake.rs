//! Scripted in-memory directory for engine and orchestrator tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ActivityRefinement, AuthStatus, CreateParams, RemoteOutput, WorkspaceDirectory};
use crate::error::{Result, SpaceError};
use crate::workspace::tests::make_workspace;
use crate::workspace::{MachineProfile, Workspace, WorkspaceState};

pub(crate) struct FakeDirectory {
    inner: Mutex<FakeState>,
}

struct FakeState {
    installed: bool,
    auth: AuthStatus,
    /// Successive listings; the last one repeats.
    lists: VecDeque<Vec<Workspace>>,
    list_failures: VecDeque<SpaceError>,
    /// Successive `get` observations per name; the last one repeats. `None` means gone.
    states: HashMap<String, VecDeque<Option<WorkspaceState>>>,
    machines: HashMap<String, MachineProfile>,
    machine_failures: HashSet<String>,
    activity: HashMap<String, ActivityRefinement>,
    connection_params: HashMap<String, String>,
    remote_results: VecDeque<Result<RemoteOutput>>,
    calls: Vec<String>,
}

impl FakeDirectory {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(FakeState {
                installed: true,
                auth: AuthStatus {
                    authenticated: true,
                    has_required_scope: true,
                },
                lists: VecDeque::new(),
                list_failures: VecDeque::new(),
                states: HashMap::new(),
                machines: HashMap::new(),
                machine_failures: HashSet::new(),
                activity: HashMap::new(),
                connection_params: HashMap::new(),
                remote_results: VecDeque::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub(crate) fn set_installed(&self, installed: bool) {
        self.inner.lock().unwrap().installed = installed;
    }

    pub(crate) fn set_auth(&self, authenticated: bool, has_required_scope: bool) {
        self.inner.lock().unwrap().auth = AuthStatus {
            authenticated,
            has_required_scope,
        };
    }

    pub(crate) fn push_list(&self, list: Vec<Workspace>) {
        self.inner.lock().unwrap().lists.push_back(list);
    }

    pub(crate) fn fail_next_list(&self, err: SpaceError) {
        self.inner.lock().unwrap().list_failures.push_back(err);
    }

    pub(crate) fn script_states(&self, name: &str, states: Vec<Option<WorkspaceState>>) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(name.to_string(), states.into());
    }

    pub(crate) fn set_machine(&self, name: &str, profile: MachineProfile) {
        self.inner
            .lock()
            .unwrap()
            .machines
            .insert(name.to_string(), profile);
    }

    pub(crate) fn fail_machine(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .machine_failures
            .insert(name.to_string());
    }

    pub(crate) fn set_activity(&self, name: &str, activity: ActivityRefinement) {
        self.inner
            .lock()
            .unwrap()
            .activity
            .insert(name.to_string(), activity);
    }

    pub(crate) fn set_connection_params(&self, name: &str, text: &str) {
        self.inner
            .lock()
            .unwrap()
            .connection_params
            .insert(name.to_string(), text.to_string());
    }

    pub(crate) fn push_remote(&self, result: Result<RemoteOutput>) {
        self.inner.lock().unwrap().remote_results.push_back(result);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls whose description starts with `prefix`.
    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }

    fn current_list(state: &mut FakeState) -> Vec<Workspace> {
        if state.lists.len() > 1 {
            state.lists.pop_front().unwrap_or_default()
        } else {
            state.lists.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl WorkspaceDirectory for FakeDirectory {
    async fn check_installed(&self) -> bool {
        self.record("check_installed".into());
        self.inner.lock().unwrap().installed
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        self.record("check_auth".into());
        Ok(self.inner.lock().unwrap().auth)
    }

    async fn list(&self) -> Result<Vec<Workspace>> {
        self.record("list".into());
        let mut state = self.inner.lock().unwrap();
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        Ok(Self::current_list(&mut state))
    }

    async fn get(&self, name: &str) -> Result<Option<Workspace>> {
        self.record(format!("get {}", name));
        let mut state = self.inner.lock().unwrap();
        let listed = state
            .lists
            .front()
            .and_then(|l| l.iter().find(|w| w.name == name).cloned());
        let Some(sequence) = state.states.get_mut(name) else {
            return Ok(listed);
        };
        let observed = if sequence.len() > 1 {
            sequence.pop_front().flatten()
        } else {
            sequence.front().copied().flatten()
        };
        Ok(observed.map(|s| {
            let mut ws = listed.unwrap_or_else(|| make_workspace(name, "octo/app", s));
            ws.state = s;
            ws
        }))
    }

    async fn machine_profile(&self, name: &str) -> Result<Option<MachineProfile>> {
        self.record(format!("machine {}", name));
        let state = self.inner.lock().unwrap();
        if state.machine_failures.contains(name) {
            return Err(SpaceError::command("gh api", "HTTP 502"));
        }
        Ok(state.machines.get(name).cloned())
    }

    async fn activity(&self, name: &str) -> Result<ActivityRefinement> {
        self.record(format!("activity {}", name));
        Ok(self
            .inner
            .lock()
            .unwrap()
            .activity
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(format!("start {}", name));
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record(format!("stop {}", name));
        Ok(())
    }

    async fn rebuild(&self, name: &str, full: bool) -> Result<()> {
        self.record(format!("rebuild {} full={}", name, full));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.record(format!("delete {}", name));
        Ok(())
    }

    async fn create(&self, params: &CreateParams) -> Result<String> {
        self.record(format!("create {}", params.repository));
        Ok(format!("{}-new", params.repository.replace('/', "-")))
    }

    async fn fetch_connection_params(&self, name: &str) -> Result<String> {
        self.record(format!("ssh-config {}", name));
        self.inner
            .lock()
            .unwrap()
            .connection_params
            .get(name)
            .cloned()
            .ok_or_else(|| SpaceError::command("gh codespace", "no ssh config"))
    }

    async fn run_remote_command(
        &self,
        name: &str,
        argv: &[String],
        _timeout: Duration,
    ) -> Result<RemoteOutput> {
        self.record(format!("remote {} {}", name, argv.join(" ")));
        if let Some(result) = self.inner.lock().unwrap().remote_results.pop_front() {
            return result;
        }
        let stdout = match argv.split_first() {
            Some((cmd, rest)) if cmd == "echo" => format!("{}\n", rest.join(" ")),
            _ => String::new(),
        };
        Ok(RemoteOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }
}
