//! Optional per-tick enrichment (spec §4.7 steps 3-4): CPU-churn detection
//! and tmux pane-target resolution. Neither is load-bearing for session
//! lifecycle; both are best-effort and never block the poll loop.
//!
//! Grounded in the teacher's process-tree walk (`logs.rs::get_pane_pid`,
//! `collect_descendant_pids`) generalized from "find the pane for a known
//! session" to "find the pane for a known pid" and from a single walk to a
//! one-shot `tmux list-panes` snapshot reused across all sessions in a tick.

use std::collections::HashMap;
use std::process::Command;

use sysinfo::{Pid, System};

/// CPU usage delta since the previous poll, keyed by pid, used to decide
/// `isChurning` (spec §4.7 step 3).
#[derive(Default)]
pub struct ProcessActivityTracker {
    system: System,
    prev_cpu: HashMap<u32, f32>,
}

impl ProcessActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns, for every pid whose executable looks like one of the three
    /// agent CLIs, its cwd and whether its CPU usage crossed
    /// `cpu_threshold` since the previous sample.
    pub fn sample(&mut self, cpu_threshold: f64) -> HashMap<std::path::PathBuf, ChurnSample> {
        self.system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        self.system.refresh_cpu_usage();

        let mut by_cwd = HashMap::new();
        for (pid, process) in self.system.processes() {
            let name = process.name().to_str().unwrap_or_default();
            if !is_agent_process(name, process.cmd()) {
                continue;
            }
            let Some(cwd) = process.cwd() else { continue };
            let cpu = process.cpu_usage() as f64;
            let prev = self.prev_cpu.get(&pid.as_u32()).copied().unwrap_or(0.0) as f64;
            by_cwd.insert(
                cwd.to_path_buf(),
                ChurnSample {
                    pid: pid.as_u32(),
                    is_churning: cpu >= cpu_threshold && (cpu - prev).abs() > f64::EPSILON,
                },
            );
            self.prev_cpu.insert(pid.as_u32(), cpu as f32);
        }
        by_cwd
    }
}

pub struct ChurnSample {
    pub pid: u32,
    pub is_churning: bool,
}

fn is_agent_process(name: &str, cmd: &[std::ffi::OsString]) -> bool {
    let name = name.to_ascii_lowercase();
    if matches!(name.as_str(), "claude" | "codex" | "gemini") {
        return true;
    }
    if name == "node" || name == "npx" {
        return cmd.iter().any(|arg| {
            let arg = arg.to_string_lossy();
            (arg.contains("claude") || arg.contains("codex") || arg.contains("gemini"))
                && !arg.contains("node_modules/.bin/")
        });
    }
    false
}

/// A one-shot snapshot of `tmux list-panes -a` output, mapping pid to its
/// `session:window.pane` target. Resolution walks up to 10 parent pids
/// looking for a match (spec §4.7 step 4).
pub struct TmuxPanes {
    pid_to_target: HashMap<u32, String>,
}

impl TmuxPanes {
    pub fn capture() -> Self {
        let mut pid_to_target = HashMap::new();
        if let Ok(output) = Command::new("tmux")
            .args(["list-panes", "-a", "-F", "#{session_name}:#{window_index}.#{pane_index} #{pane_pid}"])
            .output()
        {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                for line in text.lines() {
                    let mut parts = line.rsplitn(2, ' ');
                    let (Some(pid_str), Some(target)) = (parts.next(), parts.next()) else {
                        continue;
                    };
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        pid_to_target.insert(pid, target.to_string());
                    }
                }
            }
        }
        Self { pid_to_target }
    }

    pub fn target_for_pid(&self, system: &System, pid: u32) -> Option<String> {
        let mut current = Pid::from_u32(pid);
        for _ in 0..10 {
            if let Some(target) = self.pid_to_target.get(&current.as_u32()) {
                return Some(target.clone());
            }
            current = system.process(current)?.parent()?;
        }
        None
    }
}
