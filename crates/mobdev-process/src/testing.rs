//! A scripted [`CommandRunner`] for exercising service orchestration without the real tools.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;

use mobdev_traits::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError, ProcessHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Output,
    Interactive,
    Spawn,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub kind: CallKind,
    pub spec: CommandSpec,
}

impl Call {
    pub fn line(&self) -> String {
        self.spec.to_string()
    }
}

struct Rule {
    prefix: String,
    responses: VecDeque<CommandOutput>,
}

type SpawnHook = Box<dyn Fn(&CommandSpec) -> Option<TcpListener> + Send + Sync>;

/// Answers commands whose rendered line starts with a registered prefix.
///
/// Each rule replays its responses in order and keeps repeating the last one.
/// Commands matching no rule fail with `ProcessError::NotFound`, as a missing tool would.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Arc<Mutex<Vec<Call>>>,
    kills: Arc<Mutex<Vec<String>>>,
    spawned: Mutex<Vec<Arc<AtomicBool>>>,
    spawn_hook: Option<SpawnHook>,
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn fail(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(status),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prefix: &str, response: CommandOutput) -> Self {
        self.on_seq(prefix, vec![response])
    }

    pub fn on_seq(self, prefix: &str, responses: Vec<CommandOutput>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            responses: responses.into(),
        });
        self
    }

    /// Runs on every `spawn`; a returned listener lives as long as the spawned handle.
    pub fn with_spawn_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CommandSpec) -> Option<TcpListener> + Send + Sync + 'static,
    {
        self.spawn_hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Call::line).collect()
    }

    /// Makes every handle spawned so far report that its process has exited.
    pub fn exit_spawned(&self) {
        for exited in self.spawned.lock().unwrap().iter() {
            exited.store(true, Ordering::SeqCst);
        }
    }

    /// Programs whose spawned handles were killed, in order.
    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    fn respond(&self, kind: CallKind, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.calls.lock().unwrap().push(Call { kind, spec: spec.clone() });
        let line = spec.to_string();
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| line.starts_with(&r.prefix))
            .ok_or_else(|| ProcessError::NotFound(spec.program.clone()))?;
        let response = if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        };
        Ok(response.unwrap_or_else(|| ok("")))
    }
}

struct FakeHandle {
    program: String,
    kills: Arc<Mutex<Vec<String>>>,
    exited: Arc<AtomicBool>,
    _listener: Option<TcpListener>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_alive(&mut self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            self._listener = None;
            return false;
        }
        true
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self._listener = None;
        self.kills.lock().unwrap().push(self.program.clone());
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.respond(CallKind::Output, spec)
    }

    async fn interactive(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.respond(CallKind::Interactive, spec)
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        self.respond(CallKind::Spawn, spec)?;
        let exited = Arc::new(AtomicBool::new(false));
        self.spawned.lock().unwrap().push(Arc::clone(&exited));
        let listener = self.spawn_hook.as_ref().and_then(|hook| hook(spec));
        Ok(Box::new(FakeHandle {
            program: spec.program.clone(),
            kills: Arc::clone(&self.kills),
            exited,
            _listener: listener,
        }))
    }
}
