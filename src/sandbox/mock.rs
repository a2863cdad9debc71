//! Mock sandbox simulating an X11 desktop.
//!
//! Understands the handful of commands the desktop controller issues
//! (Xvfb, xdpyinfo, xrandr, xdotool, x11vnc, noVNC, ps, scrot, ...) and keeps
//! just enough state for them to agree with each other: the resolution Xvfb
//! was started with is what xrandr reports, a `mousemove` is what
//! `getmouselocation` returns, and so on.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CommandHandle, RunOptions, SandboxBackend};
use crate::{Error, ExecOutput, Result};

/// Bytes every PNG starts with; fake screenshots are this plus a payload.
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Clone)]
struct MockProcess {
    command: String,
    defunct: bool,
}

#[derive(Debug)]
struct MockState {
    responses: VecDeque<ExecOutput>,
    commands: Vec<String>,
    spawned: Vec<String>,
    processes: HashMap<u32, MockProcess>,
    next_pid: u32,
    resolution: Option<(u32, u32)>,
    display_probe_failures: u32,
    cursor: (u32, u32),
    vnc_running: bool,
    listening: Vec<u16>,
    bridge_never_listens: bool,
    files: HashMap<String, Vec<u8>>,
    killed: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            responses: VecDeque::new(),
            commands: Vec::new(),
            spawned: Vec::new(),
            processes: HashMap::new(),
            next_pid: 100,
            resolution: None,
            display_probe_failures: 0,
            cursor: (0, 0),
            vnc_running: false,
            listening: Vec::new(),
            bridge_never_listens: false,
            files: HashMap::new(),
            killed: false,
        }
    }
}

/// Mock sandbox for testing
#[derive(Debug, Default)]
pub struct MockSandbox {
    state: Mutex<MockState>,
}

fn ok(stdout: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput::new(stdout.into(), Vec::new(), 0)
}

fn fail(stderr: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput::new(Vec::new(), stderr.into(), 1)
}

/// Value following `flag` in a whitespace separated command line.
fn flag_value<'a>(command: &'a str, flag: &str) -> Option<&'a str> {
    let mut words = command.split_whitespace();
    while let Some(word) = words.next() {
        if word == flag {
            return words.next();
        }
    }
    None
}

impl MockSandbox {
    /// Create a new mock sandbox
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response for the next `run` call, ahead of the simulation.
    pub fn queue_response(&self, output: ExecOutput) {
        self.state().responses.push_back(output);
    }

    /// Make the next `n` display probes fail as if Xvfb were still booting.
    pub fn fail_display_probes(&self, n: u32) {
        self.state().display_probe_failures = n;
    }

    /// Keep the noVNC port closed forever.
    pub fn bridge_never_listens(&self) {
        self.state().bridge_never_listens = true;
    }

    /// Turn a background process into a zombie.
    pub fn mark_defunct(&self, pid: u32) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.defunct = true;
        }
    }

    /// Pretend a VNC server was started by someone else.
    pub fn set_vnc_running(&self, running: bool) {
        self.state().vnc_running = running;
    }

    /// Every foreground command run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Every background command spawned so far, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.state().spawned.clone()
    }

    /// Pids of background processes still alive (including zombies).
    pub fn running_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state().processes.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Files currently present in the simulated filesystem.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Whether `kill` was called.
    pub fn is_killed(&self) -> bool {
        self.state().killed
    }

    fn simulate(state: &mut MockState, command: &str, opts: &RunOptions) -> ExecOutput {
        let words: Vec<&str> = command.split_whitespace().collect();
        let program = words.first().copied().unwrap_or("");

        match program {
            "echo" => {
                let mut text = command.strip_prefix("echo").unwrap_or("").trim().to_string();
                for (key, value) in &opts.env {
                    text = text.replace(&format!("${key}"), value);
                }
                ok(format!("{text}\n"))
            }
            "xdpyinfo" => {
                if state.resolution.is_none() {
                    return fail("xdpyinfo:  unable to open display\n");
                }
                if state.display_probe_failures > 0 {
                    state.display_probe_failures -= 1;
                    return fail("xdpyinfo:  unable to open display\n");
                }
                ok("name of display:    :0\n")
            }
            "xrandr" => match state.resolution {
                Some((w, h)) => ok(format!(
                    "Screen 0: minimum 1 x 1, current {w} x {h}, maximum 32767 x 32767\n\
                     screen connected primary {w}x{h}+0+0 0mm x 0mm\n   {w}x{h}  0.00*\n"
                )),
                None => fail("Can't open display\n"),
            },
            "xdotool" => Self::simulate_xdotool(state, &words),
            "pgrep" if words.get(2) == Some(&"x11vnc") => {
                if state.vnc_running {
                    ok("4242\n")
                } else {
                    fail("")
                }
            }
            "pkill" if words.get(1) == Some(&"x11vnc") => {
                if std::mem::take(&mut state.vnc_running) {
                    ok("")
                } else {
                    fail("")
                }
            }
            "x11vnc" => {
                if words.contains(&"-storepasswd") {
                    return ok("stored passwd in file\n");
                }
                state.vnc_running = true;
                ok("PORT=5900\n")
            }
            "netstat" => {
                let port = command
                    .split("\":")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .and_then(|p| p.parse::<u16>().ok());
                match port {
                    Some(port) if state.listening.contains(&port) => ok(format!(
                        "tcp        0      0 0.0.0.0:{port}            0.0.0.0:*               LISTEN\n"
                    )),
                    _ => fail(""),
                }
            }
            "ps" => {
                let pid = flag_value(command, "-p").and_then(|p| p.parse::<u32>().ok());
                match pid.and_then(|pid| state.processes.get(&pid)) {
                    Some(process) if process.defunct => ok("Z    [xfce4-session] <defunct>\n"),
                    Some(process) => ok(format!("S    {}\n", process.command)),
                    None => fail(""),
                }
            }
            "scrot" => match words.last() {
                Some(path) if words.len() > 1 && state.resolution.is_some() => {
                    let mut png = PNG_SIGNATURE.to_vec();
                    png.extend_from_slice(b"mock-screenshot");
                    state.files.insert((*path).to_string(), png);
                    ok("")
                }
                _ => fail("scrot: Can't open X display\n"),
            },
            _ => ok(""),
        }
    }

    fn simulate_xdotool(state: &mut MockState, words: &[&str]) -> ExecOutput {
        match words.get(1).copied() {
            Some("mousemove") => {
                let coords: Vec<u32> = words[2..]
                    .iter()
                    .filter_map(|w| w.parse::<u32>().ok())
                    .collect();
                match coords.as_slice() {
                    [x, y] => {
                        state.cursor = (*x, *y);
                        ok("")
                    }
                    _ => fail("xdotool: invalid mousemove arguments\n"),
                }
            }
            Some("getmouselocation") => {
                let (x, y) = state.cursor;
                ok(format!("x:{x} y:{y} screen:0 window:4194311\n"))
            }
            Some("getwindowfocus") => ok("4194311\n"),
            Some("search") => ok("4194311\n4194320\n"),
            Some("getwindowname") => ok("Terminal - user@sandbox: ~\n"),
            _ => ok(""),
        }
    }

    fn register(&self, command: &str) -> u32 {
        let mut state = self.state();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.spawned.push(command.to_string());
        state.processes.insert(
            pid,
            MockProcess {
                command: command.to_string(),
                defunct: false,
            },
        );

        if command.starts_with("Xvfb") {
            // -screen <n> <W>x<H>x<depth>
            let geometry = command
                .split_whitespace()
                .skip_while(|w| *w != "-screen")
                .nth(2);
            let resolution = geometry.and_then(|geometry| {
                let mut parts = geometry.split('x').map(|p| p.parse::<u32>().ok());
                Some((parts.next()??, parts.next()??))
            });
            state.resolution = resolution;
        }
        if command.contains("novnc_proxy") && !state.bridge_never_listens {
            if let Some(port) = flag_value(command, "--listen").and_then(|p| p.parse().ok()) {
                state.listening.push(port);
            }
        }
        pid
    }
}

#[async_trait::async_trait]
impl SandboxBackend for MockSandbox {
    async fn run(&self, command: &str, opts: &RunOptions) -> Result<ExecOutput> {
        let mut state = self.state();
        state.commands.push(command.to_string());
        if let Some(response) = state.responses.pop_front() {
            return Ok(response);
        }
        Ok(Self::simulate(&mut state, command, opts))
    }

    async fn spawn(&self, command: &str, _opts: &RunOptions) -> Result<CommandHandle> {
        let pid = self.register(command);
        Ok(CommandHandle::new(pid, command))
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        let mut state = self.state();
        let process = state
            .processes
            .remove(&pid)
            .ok_or_else(|| Error::Sandbox(format!("no background process with pid {}", pid)))?;
        if process.command.contains("novnc_proxy") {
            let port = flag_value(&process.command, "--listen").and_then(|p| p.parse::<u16>().ok());
            if let Some(port) = port {
                state.listening.retain(|p| *p != port);
            }
        }
        Ok(())
    }

    async fn expose_port(&self, port: u16) -> Result<String> {
        Ok(format!("{port}-mock.sandbox.local"))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.state()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Sandbox(format!("file not found: {}", path)))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::Sandbox(format!("file not found: {}", path)))
    }

    async fn kill(&self) -> Result<()> {
        let mut state = self.state();
        state.processes.clear();
        state.listening.clear();
        state.vnc_running = false;
        state.killed = true;
        Ok(())
    }
}
