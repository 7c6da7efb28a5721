use std::io::{self, Write};

use serde::Serialize;

use crate::domain::TaskState;
use crate::pipeline::{ProgressEvent, ProgressSink, RunReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Writes one line per progress event to stderr.
pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr().lock();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(stderr, "{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => writeln!(stderr, "{}", event.message),
        };
    }
}

pub fn print_summary(report: &RunReport) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write_summary(&mut stdout, report)
}

pub fn write_summary(out: &mut dyn Write, report: &RunReport) -> io::Result<()> {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    if report.unlocked {
        writeln!(out, "{green}Unlocked working directory {}{reset}", report.workdir)?;
        return Ok(());
    }

    if report.dryrun {
        writeln!(out, "{cyan}Dry run: {} task(s) would run{reset}", report.planned.len())?;
        for planned in &report.planned {
            let reason = planned
                .reason
                .map(|reason| format!("{reason:?}"))
                .unwrap_or_else(|| "-".to_string());
            writeln!(out, "{yellow}  {} [{}] reason: {reason}{reset}", planned.id, planned.stage)?;
            for output in &planned.outputs {
                writeln!(out, "      -> {output}")?;
            }
        }
        return Ok(());
    }

    if report.planned.is_empty() {
        writeln!(out, "{green}Nothing to be done; all targets are up to date{reset}")?;
    }
    for task in &report.tasks {
        let color = match task.state {
            TaskState::Done | TaskState::Satisfied => green,
            TaskState::Failed => red,
            TaskState::Stale | TaskState::Running => yellow,
        };
        let elapsed = task
            .elapsed_ms
            .map(|ms| format!(" {:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        writeln!(out, "{color}  {:<10} {}{elapsed}{reset}", task.state, task.id)?;
        if let Some(error) = &task.error {
            writeln!(out, "{red}      {error}{reset}")?;
        }
    }
    let failed = report
        .tasks
        .iter()
        .filter(|task| task.state == TaskState::Failed)
        .count();
    if report.success {
        writeln!(out, "{green}Finished: {} task(s) ran{reset}", report.planned.len())?;
    } else {
        writeln!(out, "{red}Pipeline failed: {failed} task(s) failed{reset}")?;
    }
    Ok(())
}
