//! Direct, indirect and write–execute flow analysers.

use std::io::Write;

use anyhow::Error;

use super::reach::{self, Trace};
use super::{AccessMode, Analysis, Label, State};

/// A target directly accessible from a state reachable from an entry point.
pub struct DirectFlow {
    pub entry: State,
    pub target: String,
    /// The state in which the target is accessible; equals `entry` (with an
    /// empty trace) when the entry point itself suffices.
    pub state: State,
    pub trace: Trace,
}

/// An intermediate object writable after reading the target from one entry
/// and readable from another.
pub struct IndirectFlow {
    pub source: State,
    pub reader: State,
    pub target: String,
    pub object: String,
    pub write_traces: Vec<(State, Trace)>,
    pub reads: Vec<(State, Trace)>,
}

/// An object both writable and executable along walks from one entry point.
pub struct WriteExecFlow {
    pub entry: State,
    pub object: String,
    pub write_traces: Vec<(State, Trace)>,
    pub exec_traces: Vec<(State, Trace)>,
}

/// Check each (entry point, target) pair for direct accessibility with
/// `mode`, walking the transition system when the entry point itself does
/// not suffice.
pub fn direct_flows(
    analysis: &Analysis,
    entries: &[State],
    targets: &[String],
    mode: AccessMode,
) -> Result<Vec<DirectFlow>, Error> {
    let mut findings = Vec::new();

    for entry in entries {
        let mut reachable: Option<Vec<(State, Trace)>> = None;
        for target in targets {
            if analysis.check(entry, target, mode)? {
                findings.push(DirectFlow {
                    entry: entry.clone(),
                    target: target.clone(),
                    state: entry.clone(),
                    trace: Vec::new(),
                });
                continue;
            }

            if reachable.is_none() {
                let mut states: Vec<(State, Trace)> =
                    reach::reachable_states_entries(analysis, entry)
                        .into_iter()
                        .collect();
                states.sort();
                reachable = Some(states);
            }
            if let Some(states) = &reachable {
                for (state, trace) in states {
                    if state == entry {
                        continue;
                    }
                    if analysis.check(state, target, mode)? {
                        findings.push(DirectFlow {
                            entry: entry.clone(),
                            target: target.clone(),
                            state: state.clone(),
                            trace: trace.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(findings)
}

/// For each `(s1, s2, target)` triple: objects writable from `s1` after
/// reading `target`, intersected with readability from `s2`.
pub fn indirect_flows(
    analysis: &Analysis,
    triples: &[(State, State, String)],
) -> Result<Vec<IndirectFlow>, Error> {
    let mut findings = Vec::new();

    for (source, reader, target) in triples {
        let objects = reach::reachable_write_objects(analysis, source, target)?;
        if objects.is_empty() {
            continue;
        }

        let mut reachable: Vec<(State, Trace)> =
            reach::reachable_states_entries(analysis, reader)
                .into_iter()
                .collect();
        reachable.sort();

        for (object, write_traces) in objects {
            let mut reads = Vec::new();
            for (state, trace) in &reachable {
                if analysis.check(state, &object, AccessMode::Read)? {
                    reads.push((state.clone(), trace.clone()));
                }
            }
            if !reads.is_empty() {
                findings.push(IndirectFlow {
                    source: source.clone(),
                    reader: reader.clone(),
                    target: target.clone(),
                    object,
                    write_traces,
                    reads,
                });
            }
        }
    }

    Ok(findings)
}

/// Objects both writable and executable along walks from each entry point.
pub fn write_exec_flows(
    analysis: &Analysis,
    entries: &[State],
) -> Result<Vec<WriteExecFlow>, Error> {
    let mut findings = Vec::new();

    for entry in entries {
        let writable = reach::trace_to_perm(analysis, entry, AccessMode::Write)?;
        let mut executable = reach::trace_to_perm(analysis, entry, AccessMode::Exec)?;
        for (object, write_traces) in writable {
            if let Some(exec_traces) = executable.remove(&object) {
                findings.push(WriteExecFlow {
                    entry: entry.clone(),
                    object,
                    write_traces,
                    exec_traces,
                });
            }
        }
    }

    Ok(findings)
}

/// All findings for one run.
pub struct Report {
    pub direct_read: Vec<DirectFlow>,
    pub direct_write: Vec<DirectFlow>,
    pub indirect: Vec<IndirectFlow>,
    pub write_exec: Vec<WriteExecFlow>,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.direct_read.is_empty()
            && self.direct_write.is_empty()
            && self.indirect.is_empty()
            && self.write_exec.is_empty()
    }
}

/// Run every analyser over the configured entry points, triples and targets.
pub fn analyze_all(
    analysis: &Analysis,
    entries: &[State],
    triples: &[(State, State, String)],
    targets: &[String],
) -> Result<Report, Error> {
    Ok(Report {
        direct_read: direct_flows(analysis, entries, targets, AccessMode::Read)?,
        direct_write: direct_flows(analysis, entries, targets, AccessMode::Write)?,
        indirect: indirect_flows(analysis, triples)?,
        write_exec: write_exec_flows(analysis, entries)?,
    })
}

/// Render a trace as alternating `-label->` arrows ending in `last`.
pub fn format_trace(analysis: &Analysis, trace: &[(State, Label)], last: &State) -> String {
    let mut out = String::new();
    for (pred, label) in trace {
        out.push_str(&analysis.format_state(pred));
        out.push_str(" -");
        out.push_str(&label.to_string());
        out.push_str("-> ");
    }
    out.push_str(&analysis.format_state(last));
    out
}

fn write_trace_list(
    analysis: &Analysis,
    out: &mut dyn Write,
    traces: &[(State, Trace)],
) -> Result<(), Error> {
    for (state, trace) in traces {
        writeln!(out, "      {}", format_trace(analysis, trace, state))?;
    }
    Ok(())
}

/// Render the full report as text.
pub fn render_report(
    analysis: &Analysis,
    report: &Report,
    out: &mut dyn Write,
) -> Result<(), Error> {
    writeln!(out, "direct read flows: {}", report.direct_read.len())?;
    for flow in &report.direct_read {
        writeln!(
            out,
            "  {} readable from {}",
            flow.target,
            analysis.format_state(&flow.entry)
        )?;
        writeln!(out, "      {}", format_trace(analysis, &flow.trace, &flow.state))?;
    }

    writeln!(out, "direct write flows: {}", report.direct_write.len())?;
    for flow in &report.direct_write {
        writeln!(
            out,
            "  {} writable from {}",
            flow.target,
            analysis.format_state(&flow.entry)
        )?;
        writeln!(out, "      {}", format_trace(analysis, &flow.trace, &flow.state))?;
    }

    writeln!(out, "indirect flows: {}", report.indirect.len())?;
    for flow in &report.indirect {
        writeln!(
            out,
            "  {} written after reading {} from {}, readable from {}",
            flow.object,
            flow.target,
            analysis.format_state(&flow.source),
            analysis.format_state(&flow.reader)
        )?;
        writeln!(out, "    write traces:")?;
        write_trace_list(analysis, out, &flow.write_traces)?;
        writeln!(out, "    read traces:")?;
        write_trace_list(analysis, out, &flow.reads)?;
    }

    writeln!(out, "write-execute flows: {}", report.write_exec.len())?;
    for flow in &report.write_exec {
        writeln!(
            out,
            "  {} writable and executable from {}",
            flow.object,
            analysis.format_state(&flow.entry)
        )?;
        writeln!(out, "    write traces:")?;
        write_trace_list(analysis, out, &flow.write_traces)?;
        writeln!(out, "    exec traces:")?;
        write_trace_list(analysis, out, &flow.exec_traces)?;
    }

    Ok(())
}
